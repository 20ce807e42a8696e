//! Binary header of the serialized octree
//!
//! `OctreeInfo` is the fixed-size prefix of the octree buffer: build
//! parameters, bounding box, per-property channel/location tables, per-layer
//! node counts and the byte offsets of every property payload. The exact
//! field order is the on-disk layout.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::core::Error;
use crate::octree::config::BuildParams;
use crate::points::PointsView;
use crate::points::PtsProp;

/// Magic string identifying the octree format
pub const OCTREE_MAGIC: [u8; 16] = *b"_OCTREE_1.0_\0\0\0\0";

/// Number of property kinds in the header tables
pub const PROP_NUM: usize = 6;

/// Per-property channel caps enforced by `check_format`
const CHANNEL_MAX: [i32; PROP_NUM] = [2, 1, 8, 1 << 30, 1, 1];

/// Octree property kinds, used as bit flags in the header's content flags.
///
/// `Neigh` is a reserved kind: it participates in the tables and offset math
/// but this builder never emits it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum OctProp {
    Key = 1,
    Child = 2,
    Neigh = 4,
    Feature = 8,
    Label = 16,
    Split = 32,
}

impl OctProp {
    pub const ALL: [OctProp; PROP_NUM] = [
        OctProp::Key,
        OctProp::Child,
        OctProp::Neigh,
        OctProp::Feature,
        OctProp::Label,
        OctProp::Split,
    ];

    /// Index of this property in the channel/location/offset tables
    pub fn index(self) -> usize {
        (self as i32).trailing_zeros() as usize
    }
}

/// Fixed-size octree header; the field order is the serialized layout
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct OctreeInfo {
    magic: [u8; 16],
    batch_size: i32,
    depth: i32,
    full_layer: i32,
    is_adaptive: i32,
    adp_layer: i32,
    has_displace: i32,
    key2xyz: i32,
    channels: [i32; PROP_NUM],
    locations: [i32; PROP_NUM],
    nnum: [i32; 16],
    nnum_cum: [i32; 16],
    nnum_nempty: [i32; 16],
    ptr_dis: [i32; 8],
    content_flags: i32,
    th_dist: f32,
    th_norm: f32,
    bbmin: [f32; 3],
    bbmax: [f32; 3],
}

impl OctreeInfo {
    pub fn new() -> Self {
        let mut info = Self::zeroed();
        info.magic = OCTREE_MAGIC;
        info
    }

    /// Derive the header from build parameters and the input cloud: Key and
    /// Child are always stored for every layer, Split on request, and the
    /// Feature property aggregates normals, displacement, features, fpfh and
    /// roughness. Node counts and offsets are only known once the octree is
    /// built.
    pub fn initialize(&mut self, params: &BuildParams, points: &PointsView) {
        self.set_batch_size(1);
        self.set_depth(params.depth);
        self.set_full_layer(params.full_layer);
        self.set_adaptive_layer(params.adaptive_layer);
        self.set_adaptive(params.adaptive);
        self.set_node_dis(params.node_displacement);
        self.set_key2xyz(params.key2xyz);
        self.set_threshold_normal(params.th_normal);
        self.set_threshold_dist(params.th_distance);

        // by default, the octree contains Key and Child
        let key_channel = if params.key2xyz && self.depth > 8 { 2 } else { 1 };
        self.set_property(OctProp::Key, key_channel, -1);
        self.set_property(OctProp::Child, 1, -1);

        if params.split_label {
            self.set_property(OctProp::Split, 1, -1);
        }

        // the feature property aggregates every float signal
        let mut channel = points.channel(PtsProp::Normal)
            + points.channel(PtsProp::Feature)
            + points.channel(PtsProp::Fpfh)
            + points.channel(PtsProp::Roughness);
        if params.node_displacement {
            channel += 1;
        }
        // location -1 means the property exists on every layer
        let location = if params.node_feature || params.adaptive {
            -1
        } else {
            self.depth
        };
        self.set_property(OctProp::Feature, channel as i32, location);

        if points.channel(PtsProp::Label) == 1 {
            self.set_property(OctProp::Label, 1, location);
        }
    }

    pub fn batch_size(&self) -> i32 {
        self.batch_size
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn full_layer(&self) -> i32 {
        self.full_layer
    }

    pub fn adaptive_layer(&self) -> i32 {
        self.adp_layer
    }

    pub fn is_adaptive(&self) -> bool {
        self.is_adaptive != 0
    }

    pub fn has_displace(&self) -> bool {
        self.has_displace != 0
    }

    pub fn key2xyz(&self) -> bool {
        self.key2xyz != 0
    }

    pub fn threshold_distance(&self) -> f32 {
        self.th_dist
    }

    pub fn threshold_normal(&self) -> f32 {
        self.th_norm
    }

    pub fn bbmin(&self) -> Vec3 {
        Vec3::from_array(self.bbmin)
    }

    pub fn bbmax(&self) -> Vec3 {
        Vec3::from_array(self.bbmax)
    }

    /// Largest bounding-box extent, with a small epsilon substituted when the
    /// box is degenerate
    pub fn bbox_max_width(&self) -> f32 {
        let width = (self.bbmax() - self.bbmin()).max_element();
        if width == 0.0 {
            1.0e-10
        } else {
            width
        }
    }

    pub fn has_property(&self, ptype: OctProp) -> bool {
        (self.content_flags & ptype as i32) != 0
    }

    pub fn channel(&self, ptype: OctProp) -> i32 {
        if !self.has_property(ptype) {
            return 0;
        }
        self.channels[ptype.index()]
    }

    /// Layer placement of a property: -1 for every layer, `depth` for the
    /// finest layer only. Absent properties report 0.
    pub fn location(&self, ptype: OctProp) -> i32 {
        if !self.has_property(ptype) {
            return 0;
        }
        self.locations[ptype.index()]
    }

    /// Node count of layer `d`
    pub fn nnum(&self, d: i32) -> i32 {
        self.nnum[d as usize]
    }

    /// Cumulative node count of layers `[0, d)`
    pub fn nnum_cum(&self, d: i32) -> i32 {
        self.nnum_cum[d as usize]
    }

    /// Non-empty node count of layer `d`
    pub fn nnum_nempty(&self, d: i32) -> i32 {
        self.nnum_nempty[d as usize]
    }

    /// Node count over all layers
    pub fn total_nnum(&self) -> i32 {
        self.nnum_cum[(self.depth + 1) as usize]
    }

    pub fn total_nnum_capacity(&self) -> i32 {
        self.nnum_cum[(self.depth + 2) as usize]
    }

    /// Byte offset of a property's payload; for per-layer properties, the
    /// offset of layer `d`'s slice
    pub fn ptr_dis(&self, ptype: OctProp, d: i32) -> i32 {
        if !self.has_property(ptype) {
            return -1;
        }
        let mut dis = self.ptr_dis[ptype.index()];
        if self.location(ptype) == -1 {
            dis += 4 * self.nnum_cum(d) * self.channel(ptype);
        }
        dis
    }

    /// Total byte size of the serialized octree
    pub fn sizeof_octree(&self) -> usize {
        self.ptr_dis[PROP_NUM] as usize
    }

    pub fn set_batch_size(&mut self, b: i32) {
        self.batch_size = b.max(1);
    }

    pub fn set_depth(&mut self, d: i32) {
        self.depth = d.max(self.full_layer);
    }

    pub fn set_full_layer(&mut self, fl: i32) {
        self.full_layer = fl.max(0);
    }

    /// Clamped into `[full_layer, depth]`; call after depth and full layer
    /// are set
    pub fn set_adaptive_layer(&mut self, al: i32) {
        let lo = self.full_layer;
        let hi = self.depth.max(lo);
        self.adp_layer = al.clamp(lo, hi);
    }

    pub fn set_adaptive(&mut self, adaptive: bool) {
        self.is_adaptive = adaptive as i32;
    }

    pub fn set_node_dis(&mut self, dis: bool) {
        self.has_displace = dis as i32;
    }

    pub fn set_key2xyz(&mut self, key2xyz: bool) {
        self.key2xyz = key2xyz as i32;
    }

    pub fn set_threshold_dist(&mut self, th: f32) {
        self.th_dist = th;
    }

    pub fn set_threshold_normal(&mut self, th: f32) {
        self.th_norm = th;
    }

    pub fn set_bbox(&mut self, bbmin: Vec3, bbmax: Vec3) {
        self.bbmin = bbmin.to_array();
        self.bbmax = bbmax.to_array();
    }

    /// Bounding cube from a radius and center, the form `Points::bounds`
    /// produces
    pub fn set_bbox_cube(&mut self, radius: f32, center: Vec3) {
        self.set_bbox(center - Vec3::splat(radius), center + Vec3::splat(radius));
    }

    pub fn set_property(&mut self, ptype: OctProp, channel: i32, location: i32) {
        self.set_channel(ptype, channel);
        self.set_location(ptype, location);
    }

    /// Set a property's channel count, keeping the content flag in sync.
    /// A channel count of zero removes the property.
    pub fn set_channel(&mut self, ptype: OctProp, channel: i32) {
        let i = ptype.index();
        if channel > 0 {
            self.channels[i] = channel;
            self.content_flags |= ptype as i32;
        } else {
            self.channels[i] = 0;
            self.content_flags &= !(ptype as i32);
        }
    }

    pub fn set_location(&mut self, ptype: OctProp, location: i32) {
        self.locations[ptype.index()] = location;
    }

    pub fn set_nnum(&mut self, num: &[i32]) {
        self.nnum[..num.len()].copy_from_slice(num);
    }

    pub fn set_nempty(&mut self, num: &[i32]) {
        self.nnum_nempty[..num.len()].copy_from_slice(num);
    }

    /// Recompute the cumulative node counts from the per-layer counts
    pub fn set_nnum_cum(&mut self) {
        self.nnum_cum[0] = 0;
        let d = self.depth as usize;
        for i in 1..d + 2 {
            self.nnum_cum[i] = self.nnum_cum[i - 1] + self.nnum[i - 1];
        }
        self.nnum_cum[d + 2] = self.nnum_cum[d + 1];
    }

    /// Recompute the property payload offsets; valid only after the node
    /// counts are set
    pub fn set_ptr_dis(&mut self) {
        self.ptr_dis[0] = std::mem::size_of::<OctreeInfo>() as i32;
        for i in 1..=PROP_NUM {
            let ptype = OctProp::ALL[i - 1];
            let lc = self.location(ptype);
            // absent properties contribute nothing: their channel is 0
            let num = if lc == -1 {
                self.total_nnum_capacity()
            } else {
                self.nnum(lc)
            };
            self.ptr_dis[i] = self.ptr_dis[i - 1] + 4 * num * self.channels[i - 1];
        }
    }

    /// Collect format errors; an empty list means the header is valid
    pub fn check_format(&self) -> Vec<String> {
        let mut msgs = Vec::new();
        if self.magic != OCTREE_MAGIC {
            msgs.push("wrong magic string".to_string());
        }
        if self.batch_size < 1 {
            msgs.push("the batch size should be larger than 0".to_string());
        }
        if self.depth < 1 || self.depth > 8 {
            msgs.push("the depth should be in range [1, 8]".to_string());
        }
        if self.full_layer < 0 || self.full_layer > self.depth {
            msgs.push("the full layer should be in range [0, depth]".to_string());
        }
        if self.adp_layer < self.full_layer || self.adp_layer > self.depth {
            msgs.push("the adaptive layer should be in range [full_layer, depth]".to_string());
        }
        for i in 0..PROP_NUM {
            if self.channels[i] < 0 || self.channels[i] > CHANNEL_MAX[i] {
                msgs.push(format!(
                    "channel {} should be in range [0, {}]",
                    i, CHANNEL_MAX[i]
                ));
            }
            if (self.channels[i] == 0) != ((self.content_flags & (1 << i)) == 0) {
                msgs.push(format!(
                    "the content flags should be consistent with channel {}",
                    i
                ));
            }
            if self.channels[i] != 0 && self.locations[i] != -1 && self.locations[i] != self.depth
            {
                msgs.push(format!("location {} should be -1 or {}", i, self.depth));
            }
        }
        msgs
    }

    /// `check_format` with the messages folded into an error
    pub fn validate(&self) -> Result<(), Error> {
        let msgs = self.check_format();
        if msgs.is_empty() {
            Ok(())
        } else {
            Err(Error::Format(msgs.join("; ")))
        }
    }
}

impl Default for OctreeInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::Points;

    fn sample_points() -> Points {
        Points::from_attributes(
            &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            &[],
            &[],
            &[],
            &[2.0, 1.0],
        )
        .unwrap()
    }

    #[test]
    fn test_size() {
        assert_eq!(std::mem::size_of::<OctreeInfo>(), 352);
    }

    #[test]
    fn test_initialize_channels() {
        let points = sample_points();
        let params = BuildParams {
            depth: 5,
            full_layer: 2,
            ..Default::default()
        };
        let mut info = OctreeInfo::new();
        info.initialize(&params, &points.view());

        assert_eq!(info.channel(OctProp::Key), 1);
        assert_eq!(info.channel(OctProp::Child), 1);
        assert_eq!(info.channel(OctProp::Feature), 3); // normals only
        assert_eq!(info.channel(OctProp::Label), 1);
        assert!(!info.has_property(OctProp::Split));
        assert!(!info.has_property(OctProp::Neigh));
        // non-adaptive, no node features: finest layer only
        assert_eq!(info.location(OctProp::Feature), 5);
        assert_eq!(info.location(OctProp::Label), 5);
        assert_eq!(info.location(OctProp::Key), -1);
    }

    #[test]
    fn test_initialize_displacement_and_adaptive() {
        let points = sample_points();
        let params = BuildParams {
            depth: 4,
            full_layer: 1,
            adaptive: true,
            adaptive_layer: 2,
            node_displacement: true,
            split_label: true,
            ..Default::default()
        };
        let mut info = OctreeInfo::new();
        info.initialize(&params, &points.view());

        assert_eq!(info.channel(OctProp::Feature), 4); // normals + displacement
        assert_eq!(info.location(OctProp::Feature), -1);
        assert_eq!(info.location(OctProp::Label), -1);
        assert_eq!(info.channel(OctProp::Split), 1);
        assert!(info.is_adaptive());
        assert!(info.has_displace());
    }

    #[test]
    fn test_deep_key2xyz_uses_two_channels() {
        let points = sample_points();
        let params = BuildParams {
            depth: 9,
            full_layer: 1,
            key2xyz: true,
            ..Default::default()
        };
        let mut info = OctreeInfo::new();
        info.initialize(&params, &points.view());
        assert_eq!(info.channel(OctProp::Key), 2);

        let shallow = BuildParams {
            depth: 8,
            key2xyz: true,
            ..Default::default()
        };
        let mut info = OctreeInfo::new();
        info.initialize(&shallow, &points.view());
        assert_eq!(info.channel(OctProp::Key), 1);
    }

    #[test]
    fn test_check_format() {
        let points = sample_points();
        let params = BuildParams::default();
        let mut info = OctreeInfo::new();
        info.initialize(&params, &points.view());
        assert!(info.check_format().is_empty(), "{:?}", info.check_format());

        let mut bad = info;
        bad.depth = 9;
        assert!(!bad.check_format().is_empty());

        let mut bad = info;
        bad.adp_layer = -1;
        assert!(!bad.check_format().is_empty());

        let mut bad = info;
        bad.magic = [0; 16];
        assert!(bad.validate().is_err());

        let mut bad = info;
        bad.channels[OctProp::Child.index()] = 0; // flag still set
        assert!(!bad.check_format().is_empty());
    }

    #[test]
    fn test_node_counts_and_offsets() {
        let points = sample_points();
        let params = BuildParams {
            depth: 2,
            full_layer: 1,
            node_feature: true,
            ..Default::default()
        };
        let mut info = OctreeInfo::new();
        info.initialize(&params, &points.view());

        info.set_nnum(&[1, 8, 16]);
        info.set_nempty(&[1, 2, 5]);
        info.set_nnum_cum();
        info.set_ptr_dis();

        assert_eq!(info.total_nnum(), 25);
        assert_eq!(info.nnum_cum(2), 9);

        let header = std::mem::size_of::<OctreeInfo>() as i32;
        assert_eq!(info.ptr_dis(OctProp::Key, 0), header);
        // key: 25 nodes, 1 channel
        assert_eq!(info.ptr_dis(OctProp::Child, 0), header + 4 * 25);
        // layer offset within the key payload
        assert_eq!(info.ptr_dis(OctProp::Key, 2), header + 4 * 9);
        // feature: 3 channels over all 25 nodes, after key + child
        assert_eq!(info.ptr_dis(OctProp::Feature, 0), header + 4 * 50);
        assert_eq!(
            info.sizeof_octree(),
            header as usize + 4 * (25 + 25 + 75 + 25)
        );
    }

    #[test]
    fn test_degenerate_bbox_width() {
        let mut info = OctreeInfo::new();
        info.set_bbox(Vec3::ONE, Vec3::ONE);
        assert_eq!(info.bbox_max_width(), 1.0e-10);

        info.set_bbox_cube(0.5, Vec3::splat(0.5));
        assert_eq!(info.bbmin(), Vec3::ZERO);
        assert_eq!(info.bbmax(), Vec3::ONE);
        assert_eq!(info.bbox_max_width(), 1.0);
    }
}
