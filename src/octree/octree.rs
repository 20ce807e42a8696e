//! Serialized octree artifact
//!
//! An `Octree` owns its property arrays and the single serialized byte
//! buffer; the header and every accessor are views into data the octree
//! owns. Re-serializing a deserialized octree reproduces the buffer byte
//! for byte.

use std::path::Path;

use bytemuck::{AnyBitPattern, NoUninit};

use crate::core::Error;
use crate::octree::info::{OctProp, OctreeInfo};

/// Built octree: header, per-layer property arrays and the serialized buffer
#[derive(Clone, Debug)]
pub struct Octree {
    pub(super) info: OctreeInfo,
    /// Per-layer key words: Morton keys, or packed xyz when `key2xyz` is set
    pub(super) keys: Vec<Vec<u32>>,
    /// Per-layer child indices, -1 for empty nodes
    pub(super) children: Vec<Vec<i32>>,
    /// Per-layer aggregated float signal, channel-major
    pub(super) features: Vec<Vec<f32>>,
    /// Per-layer label modes
    pub(super) labels: Vec<Vec<f32>>,
    /// Per-layer split labels
    pub(super) splits: Vec<Vec<f32>>,
    /// Serialized image: header prefix plus property payloads
    pub(super) buffer: Vec<u8>,
}

impl Octree {
    pub fn info(&self) -> &OctreeInfo {
        &self.info
    }

    /// The serialized buffer; valid after `serialize`
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Key words of layer `d`
    pub fn keys(&self, d: i32) -> &[u32] {
        &self.keys[d as usize]
    }

    /// Child indices of layer `d`
    pub fn children(&self, d: i32) -> &[i32] {
        &self.children[d as usize]
    }

    /// Aggregated feature signal of layer `d`, channel-major
    pub fn feature(&self, d: i32) -> &[f32] {
        &self.features[d as usize]
    }

    /// Label modes of layer `d`
    pub fn label(&self, d: i32) -> &[f32] {
        &self.labels[d as usize]
    }

    /// Split labels of layer `d`
    pub fn split(&self, d: i32) -> &[f32] {
        &self.splits[d as usize]
    }

    pub fn node_num(&self, d: i32) -> usize {
        self.info.nnum(d) as usize
    }

    pub fn total_node_num(&self) -> usize {
        self.info.total_nnum() as usize
    }

    /// Parse an octree from its serialized image
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let header_size = std::mem::size_of::<OctreeInfo>();
        if bytes.len() < header_size {
            return Err(Error::Format(format!(
                "octree buffer too small: {} bytes",
                bytes.len()
            )));
        }
        let info: OctreeInfo = bytemuck::pod_read_unaligned(&bytes[..header_size]);
        info.validate()?;
        if bytes.len() != info.sizeof_octree() {
            return Err(Error::Format(format!(
                "octree buffer is {} bytes, header describes {}",
                bytes.len(),
                info.sizeof_octree()
            )));
        }

        Ok(Self {
            info,
            keys: read_property(bytes, &info, OctProp::Key),
            children: read_property(bytes, &info, OctProp::Child),
            features: read_property(bytes, &info, OctProp::Feature),
            labels: read_property(bytes, &info, OctProp::Label),
            splits: read_property(bytes, &info, OctProp::Split),
            buffer: bytes.to_vec(),
        })
    }

    /// Load a serialized octree from a file
    pub fn read_octree<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Write the serialized buffer to a file
    pub fn write_octree<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        std::fs::write(path, &self.buffer)?;
        Ok(())
    }
}

/// Slice a property's payload back into per-layer arrays
fn read_property<T: AnyBitPattern + NoUninit>(
    bytes: &[u8],
    info: &OctreeInfo,
    ptype: OctProp,
) -> Vec<Vec<T>> {
    let depth = info.depth();
    let mut out = vec![Vec::new(); (depth + 1) as usize];
    if !info.has_property(ptype) {
        return out;
    }
    let channel = info.channel(ptype) as usize;
    let location = info.location(ptype);
    let layers: Vec<i32> = if location == -1 {
        (0..=depth).collect()
    } else {
        vec![location]
    };
    for d in layers {
        let offset = info.ptr_dis(ptype, d) as usize;
        let len = 4 * channel * info.nnum(d) as usize;
        out[d as usize] = bytemuck::pod_collect_to_vec(&bytes[offset..offset + len]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::builder::build_octree;
    use crate::octree::config::BuildParams;
    use crate::points::Points;

    fn sample_octree() -> Octree {
        let pts = [
            0.1, 0.1, 0.1, //
            0.9, 0.2, 0.3, //
            0.4, 0.8, 0.6, //
            0.7, 0.7, 0.9,
        ];
        let normals = [
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0, //
            0.0, 1.0, 0.0,
        ];
        let labels = [0.0, 1.0, 2.0, 1.0];
        let points = Points::from_attributes(&pts, &normals, &[], &[], &[], &labels).unwrap();
        let params = BuildParams {
            depth: 3,
            full_layer: 1,
            node_feature: true,
            split_label: true,
            ..Default::default()
        };
        build_octree(&params, &points).unwrap()
    }

    #[test]
    fn test_serialize_roundtrip_is_byte_identical() {
        let octree = sample_octree();
        assert!(!octree.buffer().is_empty());

        let mut reread = Octree::from_bytes(octree.buffer()).unwrap();
        reread.serialize();
        assert_eq!(reread.buffer(), octree.buffer());
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Octree::from_bytes(&[0u8; 16]).is_err());
        assert!(Octree::from_bytes(&[0u8; 1024]).is_err());

        // truncated buffer with a valid header
        let octree = sample_octree();
        let len = octree.buffer().len();
        assert!(Octree::from_bytes(&octree.buffer()[..len - 4]).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let octree = sample_octree();
        let path = std::env::temp_dir().join("cloudtree_octree_roundtrip.octree");
        octree.write_octree(&path).unwrap();
        let reread = Octree::read_octree(&path).unwrap();
        assert_eq!(reread.buffer(), octree.buffer());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_property_offsets_cover_the_buffer() {
        let octree = sample_octree();
        let info = octree.info();
        let total = info.total_nnum() as usize;
        let header = std::mem::size_of::<OctreeInfo>();

        let mut expected = header;
        for ptype in OctProp::ALL {
            if !info.has_property(ptype) {
                continue;
            }
            let num = if info.location(ptype) == -1 {
                total
            } else {
                info.nnum(info.depth()) as usize
            };
            assert_eq!(info.ptr_dis(ptype, 0) as usize, expected);
            expected += 4 * num * info.channel(ptype) as usize;
        }
        assert_eq!(info.sizeof_octree(), expected);
        assert_eq!(octree.buffer().len(), expected);
    }
}
