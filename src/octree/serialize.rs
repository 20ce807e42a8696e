//! Octree buffer assembly
//!
//! The serialized octree is one contiguous allocation: the header, then
//! every present property's per-layer payloads at the offsets the header
//! records. The float signals are concatenated per layer into the single
//! Feature property in a fixed order: normals, displacement, features,
//! fpfh, roughness.

use bytemuck::NoUninit;

use crate::math::morton;
use crate::octree::builder::OctreeBuilder;
use crate::octree::info::{OctProp, OctreeInfo};
use crate::octree::octree::Octree;

impl<'a> OctreeBuilder<'a> {
    /// Move the built arrays into the durable artifact and serialize it
    pub(super) fn assemble(mut self) -> Octree {
        let depth = self.info.depth() as usize;

        let keys = if self.info.key2xyz() {
            key_to_xyz(&self.keys, &self.info)
        } else {
            std::mem::take(&mut self.keys)
        };

        let mut features = vec![Vec::new(); depth + 1];
        for (d, feature) in features.iter_mut().enumerate() {
            let mut f = std::mem::take(&mut self.avg_normals[d]);
            f.append(&mut self.displacement[d]);
            f.append(&mut self.avg_features[d]);
            f.append(&mut self.avg_fpfh[d]);
            f.append(&mut self.avg_roughness[d]);
            *feature = f;
        }

        let mut octree = Octree {
            info: self.info,
            keys,
            children: std::mem::take(&mut self.children),
            features,
            labels: std::mem::take(&mut self.avg_labels),
            splits: std::mem::take(&mut self.split_labels),
            buffer: Vec::new(),
        };
        octree.serialize();
        octree
    }
}

impl Octree {
    /// Assemble the serialized buffer from the header and property arrays.
    /// The layout is deterministic, so re-serializing a parsed octree
    /// reproduces its buffer exactly.
    pub fn serialize(&mut self) {
        let mut buffer = vec![0u8; self.info.sizeof_octree()];
        let header_size = std::mem::size_of::<OctreeInfo>();
        buffer[..header_size].copy_from_slice(bytemuck::bytes_of(&self.info));

        write_property(&mut buffer, &self.info, OctProp::Key, &self.keys);
        write_property(&mut buffer, &self.info, OctProp::Child, &self.children);
        write_property(&mut buffer, &self.info, OctProp::Feature, &self.features);
        write_property(&mut buffer, &self.info, OctProp::Label, &self.labels);
        write_property(&mut buffer, &self.info, OctProp::Split, &self.splits);

        self.buffer = buffer;
    }
}

/// Copy a property's per-layer arrays to their recorded offsets
fn write_property<T: NoUninit>(
    buffer: &mut [u8],
    info: &OctreeInfo,
    ptype: OctProp,
    data: &[Vec<T>],
) {
    if !info.has_property(ptype) {
        return;
    }
    let location = info.location(ptype);
    let layers: Vec<i32> = if location == -1 {
        (0..=info.depth()).collect()
    } else {
        vec![location]
    };
    for d in layers {
        let bytes = bytemuck::cast_slice::<T, u8>(&data[d as usize]);
        let offset = info.ptr_dis(ptype, d) as usize;
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Re-encode Morton keys as packed cell coordinates: one byte per axis for
/// depths up to 8, two bytes per axis beyond that (the spare high slot stays
/// zero).
pub(super) fn key_to_xyz(keys: &[Vec<u32>], info: &OctreeInfo) -> Vec<Vec<u32>> {
    let depth = info.depth();
    let channel = info.channel(OctProp::Key) as usize;

    let mut xyz = vec![Vec::new(); (depth + 1) as usize];
    for d in 0..=depth {
        let layer = &keys[d as usize];
        let mut out = vec![0u32; layer.len() * channel];
        for (i, &key) in layer.iter().enumerate() {
            let pt = morton::compute_pt(key, d);
            if channel == 1 {
                out[i] = u32::from_le_bytes([pt[0] as u8, pt[1] as u8, pt[2] as u8, 0]);
            } else {
                out[2 * i] = (pt[0] & 0xffff) | ((pt[1] & 0xffff) << 16);
                out[2 * i + 1] = pt[2] & 0xffff;
            }
        }
        xyz[d as usize] = out;
    }
    xyz
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::morton::compute_key;
    use crate::octree::builder::OctreeBuilder;
    use crate::octree::config::BuildParams;
    use crate::points::Points;

    fn sample_points() -> Points {
        let pts = [0.1, 0.2, 0.3, 0.8, 0.7, 0.6, 0.3, 0.9, 0.2];
        let normals = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        Points::from_attributes(&pts, &normals, &[], &[], &[], &[]).unwrap()
    }

    fn build(params: &BuildParams, points: &Points) -> Octree {
        let view = points.view();
        let mut info = OctreeInfo::new();
        info.initialize(params, &view);
        info.set_bbox(glam::Vec3::ZERO, glam::Vec3::ONE);
        OctreeBuilder::new(info, view).unwrap().build().unwrap()
    }

    #[test]
    fn test_buffer_holds_header_then_payloads() {
        let params = BuildParams {
            depth: 3,
            full_layer: 1,
            node_feature: true,
            ..Default::default()
        };
        let octree = build(&params, &sample_points());
        let info = octree.info();
        let buffer = octree.buffer();

        assert_eq!(buffer.len(), info.sizeof_octree());
        assert_eq!(
            &buffer[..std::mem::size_of::<OctreeInfo>()],
            bytemuck::bytes_of(info)
        );

        // the key payload starts right after the header
        let offset = info.ptr_dis(OctProp::Key, 0) as usize;
        let first_key = u32::from_le_bytes([
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ]);
        assert_eq!(first_key, octree.keys(0)[0]);

        // the child payload of the finest layer sits at its recorded offset
        let offset = info.ptr_dis(OctProp::Child, 3) as usize;
        let first_child = i32::from_le_bytes([
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ]);
        assert_eq!(first_child, octree.children(3)[0]);
    }

    #[test]
    fn test_key2xyz_single_channel_packing() {
        let params = BuildParams {
            depth: 2,
            full_layer: 1,
            key2xyz: true,
            node_feature: true,
            ..Default::default()
        };
        let octree = build(&params, &sample_points());
        assert_eq!(octree.info().channel(OctProp::Key), 1);

        // every stored word is [x, y, z, 0] bytes, in Morton order
        for d in 0..=2 {
            let decoded: Vec<u32> = octree
                .keys(d)
                .iter()
                .map(|&word| {
                    let [x, y, z, pad] = word.to_le_bytes();
                    assert_eq!(pad, 0);
                    assert!(x < 4 && y < 4 && z < 4);
                    compute_key([x as u32, y as u32, z as u32], d)
                })
                .collect();
            for w in decoded.windows(2) {
                assert!(w[0] < w[1]);
            }
        }
    }

    #[test]
    fn test_key_to_xyz_two_channel_packing() {
        // a deep header forces two-byte-per-axis packing
        let mut info = OctreeInfo::new();
        info.set_full_layer(1);
        info.set_depth(9);
        info.set_key2xyz(true);
        info.set_property(OctProp::Key, 2, -1);

        let key = compute_key([300, 5, 511], 9);
        let mut keys = vec![Vec::new(); 10];
        keys[9] = vec![key];
        let xyz = key_to_xyz(&keys, &info);

        assert_eq!(xyz[9].len(), 2);
        assert_eq!(xyz[9][0] & 0xffff, 300);
        assert_eq!(xyz[9][0] >> 16, 5);
        assert_eq!(xyz[9][1], 511);
    }

    #[test]
    fn test_serialized_key2xyz_roundtrips() {
        let params = BuildParams {
            depth: 2,
            full_layer: 1,
            key2xyz: true,
            node_feature: true,
            ..Default::default()
        };
        let octree = build(&params, &sample_points());
        let mut reread = Octree::from_bytes(octree.buffer()).unwrap();
        reread.serialize();
        assert_eq!(reread.buffer(), octree.buffer());
    }
}
