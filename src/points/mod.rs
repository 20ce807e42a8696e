//! Point-cloud container and typed read-only view
//!
//! `Points` owns the cloud: a fixed `PtsInfo` header plus one contiguous
//! float block holding the attribute arrays in attribute order (points,
//! normals, features, fpfh, roughness, labels). `PointsView` is the borrowed
//! accessor the octree builder consumes; it never mutates the cloud.

pub mod info;

pub use info::{PtsInfo, PtsProp, PTS_MAGIC, PTS_PROP_NUM};

use std::path::Path;

use glam::Vec3;

use crate::core::Error;

/// Bounding cube of a point cloud, in the form the octree header consumes
#[derive(Clone, Copy, Debug)]
pub struct PointsBounds {
    pub radius: f32,
    pub center: Vec3,
}

/// Owned point cloud
#[derive(Clone, Debug)]
pub struct Points {
    info: PtsInfo,
    data: Vec<f32>,
}

impl Points {
    /// Build a cloud from raw attribute arrays. Empty slices mark absent
    /// attributes. The points must not be empty, and normals and features
    /// must not both be absent.
    pub fn from_attributes(
        pts: &[f32],
        normals: &[f32],
        features: &[f32],
        fpfh: &[f32],
        roughness: &[f32],
        labels: &[f32],
    ) -> Result<Self, Error> {
        if pts.is_empty() || pts.len() % 3 != 0 {
            return Err(Error::Points(format!(
                "expected a non-empty xyz array, got {} floats",
                pts.len()
            )));
        }
        let npt = pts.len() / 3;
        if normals.is_empty() && features.is_empty() {
            return Err(Error::Points(
                "normals and features must not both be absent".to_string(),
            ));
        }
        if !normals.is_empty() && normals.len() != 3 * npt {
            return Err(Error::Points(format!(
                "expected {} normal floats, got {}",
                3 * npt,
                normals.len()
            )));
        }
        for (name, attr) in [("feature", features), ("fpfh", fpfh), ("roughness", roughness)] {
            if !attr.is_empty() && attr.len() % npt != 0 {
                return Err(Error::Points(format!(
                    "the {} array length {} is not a multiple of the point count {}",
                    name,
                    attr.len(),
                    npt
                )));
            }
        }
        if !labels.is_empty() && labels.len() != npt {
            return Err(Error::Points(format!(
                "expected {} labels, got {}",
                npt,
                labels.len()
            )));
        }

        let mut info = PtsInfo::new();
        info.set_pt_num(npt as i32);
        info.set_channel(PtsProp::Point, 3);
        info.set_channel(PtsProp::Normal, if normals.is_empty() { 0 } else { 3 });
        info.set_channel(PtsProp::Feature, (features.len() / npt) as i32);
        info.set_channel(PtsProp::Fpfh, (fpfh.len() / npt) as i32);
        info.set_channel(PtsProp::Roughness, (roughness.len() / npt) as i32);
        info.set_channel(PtsProp::Label, if labels.is_empty() { 0 } else { 1 });
        info.set_ptr_dis();

        let mut data =
            Vec::with_capacity(info.sizeof_points() / 4 - std::mem::size_of::<PtsInfo>() / 4);
        data.extend_from_slice(pts);
        data.extend_from_slice(normals);
        data.extend_from_slice(features);
        data.extend_from_slice(fpfh);
        data.extend_from_slice(roughness);
        data.extend_from_slice(labels);

        Ok(Self { info, data })
    }

    /// Load a cloud from its binary file form
    pub fn read_points<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Parse a cloud from the binary file image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let header_size = std::mem::size_of::<PtsInfo>();
        if bytes.len() < header_size {
            return Err(Error::Format(format!(
                "points buffer too small: {} bytes",
                bytes.len()
            )));
        }
        let info: PtsInfo = bytemuck::pod_read_unaligned(&bytes[..header_size]);
        let msgs = info.check_format();
        if !msgs.is_empty() {
            return Err(Error::Format(msgs.join("; ")));
        }
        if bytes.len() != info.sizeof_points() {
            return Err(Error::Format(format!(
                "points buffer is {} bytes, header describes {}",
                bytes.len(),
                info.sizeof_points()
            )));
        }
        let data = bytemuck::pod_collect_to_vec(&bytes[header_size..]);
        Ok(Self { info, data })
    }

    /// Write the cloud to its binary file form
    pub fn write_points<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Binary file image: header followed by the attribute blocks
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.info.sizeof_points());
        bytes.extend_from_slice(bytemuck::bytes_of(&self.info));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.data));
        bytes
    }

    pub fn info(&self) -> &PtsInfo {
        &self.info
    }

    pub fn pt_num(&self) -> usize {
        self.info.pt_num() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.info.pt_num() == 0
    }

    /// Borrowed typed view over the attribute arrays
    pub fn view(&self) -> PointsView<'_> {
        PointsView {
            info: &self.info,
            data: &self.data,
        }
    }

    /// Axis-aligned bounding box of the points
    pub fn bbox(&self) -> (Vec3, Vec3) {
        let mut bbmin = Vec3::splat(f32::MAX);
        let mut bbmax = Vec3::splat(f32::MIN);
        if let Some(pts) = self.view().points() {
            for p in pts.chunks_exact(3) {
                let v = Vec3::new(p[0], p[1], p[2]);
                bbmin = bbmin.min(v);
                bbmax = bbmax.max(v);
            }
        }
        (bbmin, bbmax)
    }

    /// Bounding cube: center of the bounding box plus half its largest extent
    pub fn bounds(&self) -> PointsBounds {
        let (bbmin, bbmax) = self.bbox();
        PointsBounds {
            radius: 0.5 * (bbmax - bbmin).max_element(),
            center: 0.5 * (bbmin + bbmax),
        }
    }
}

/// Read-only accessor over a point cloud's attribute arrays
#[derive(Clone, Copy)]
pub struct PointsView<'a> {
    info: &'a PtsInfo,
    data: &'a [f32],
}

impl<'a> PointsView<'a> {
    pub fn info(&self) -> &'a PtsInfo {
        self.info
    }

    pub fn pt_num(&self) -> usize {
        self.info.pt_num() as usize
    }

    pub fn channel(&self, ptype: PtsProp) -> usize {
        self.info.channel(ptype) as usize
    }

    /// Slice of an attribute's data, `pt_num * channel` floats, or `None`
    /// when the attribute is absent
    pub fn prop(&self, ptype: PtsProp) -> Option<&'a [f32]> {
        if !self.info.has_property(ptype) {
            return None;
        }
        let header_size = std::mem::size_of::<PtsInfo>() as i32;
        let start = ((self.info.ptr_dis(ptype) - header_size) / 4) as usize;
        let len = self.pt_num() * self.channel(ptype);
        Some(&self.data[start..start + len])
    }

    pub fn points(&self) -> Option<&'a [f32]> {
        self.prop(PtsProp::Point)
    }

    pub fn normals(&self) -> Option<&'a [f32]> {
        self.prop(PtsProp::Normal)
    }

    pub fn features(&self) -> Option<&'a [f32]> {
        self.prop(PtsProp::Feature)
    }

    pub fn fpfh(&self) -> Option<&'a [f32]> {
        self.prop(PtsProp::Fpfh)
    }

    pub fn roughness(&self) -> Option<&'a [f32]> {
        self.prop(PtsProp::Roughness)
    }

    pub fn labels(&self) -> Option<&'a [f32]> {
        self.prop(PtsProp::Label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cloud() -> Points {
        let pts = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let normals = [0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let labels = [0.0, 1.0, 1.0];
        Points::from_attributes(&pts, &normals, &[], &[], &[], &labels).unwrap()
    }

    #[test]
    fn test_from_attributes() {
        let points = sample_cloud();
        assert_eq!(points.pt_num(), 3);

        let view = points.view();
        assert_eq!(view.channel(PtsProp::Point), 3);
        assert_eq!(view.channel(PtsProp::Normal), 3);
        assert_eq!(view.channel(PtsProp::Label), 1);
        assert_eq!(view.channel(PtsProp::Feature), 0);
        assert_eq!(view.points().unwrap().len(), 9);
        assert_eq!(view.normals().unwrap()[1], 1.0);
        assert_eq!(view.labels().unwrap(), &[0.0, 1.0, 1.0]);
        assert!(view.features().is_none());
    }

    #[test]
    fn test_rejects_bad_input() {
        // not a multiple of 3
        assert!(Points::from_attributes(&[0.0; 4], &[0.0; 4], &[], &[], &[], &[]).is_err());
        // empty
        assert!(Points::from_attributes(&[], &[], &[], &[], &[], &[]).is_err());
        // neither normals nor features
        assert!(Points::from_attributes(&[0.0; 3], &[], &[], &[], &[], &[]).is_err());
        // label count mismatch
        assert!(
            Points::from_attributes(&[0.0; 6], &[0.0; 6], &[], &[], &[], &[0.0; 3]).is_err()
        );
    }

    #[test]
    fn test_features_only_cloud() {
        let points =
            Points::from_attributes(&[0.0; 6], &[], &[1.0, 2.0, 3.0, 4.0], &[], &[], &[]).unwrap();
        assert_eq!(points.view().channel(PtsProp::Feature), 2);
        assert!(points.view().normals().is_none());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let points = sample_cloud();
        let bytes = points.to_bytes();
        assert_eq!(bytes.len(), points.info().sizeof_points());

        let reread = Points::from_bytes(&bytes).unwrap();
        assert_eq!(reread.pt_num(), points.pt_num());
        assert_eq!(reread.to_bytes(), bytes);
        assert_eq!(
            reread.view().normals().unwrap(),
            points.view().normals().unwrap()
        );
    }

    #[test]
    fn test_file_roundtrip() {
        let points = sample_cloud();
        let path = std::env::temp_dir().join("cloudtree_points_roundtrip.points");
        points.write_points(&path).unwrap();
        let reread = Points::read_points(&path).unwrap();
        assert_eq!(reread.to_bytes(), points.to_bytes());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bounds() {
        let points = sample_cloud();
        let (bbmin, bbmax) = points.bbox();
        assert_eq!(bbmin, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(bbmax, Vec3::new(1.0, 1.0, 1.0));

        let bounds = points.bounds();
        assert_eq!(bounds.radius, 0.5);
        assert_eq!(bounds.center, Vec3::splat(0.5));
    }
}
