//! Octree builder: spatial keying, sorting and the bottom-up structure build
//!
//! The pipeline is strictly ordered: normalize the points into the finest
//! cell grid, sort them by Morton key with a 64-bit `(key, index)` pack,
//! collapse duplicate keys, grow the node layers bottom-up (every occupied
//! parent materializes its complete 8-block of children), then average the
//! per-node signals and serialize. Per-point and per-node loops run in
//! parallel; the layer recursion does not.

use rayon::prelude::*;

use crate::core::Error;
use crate::math::morton;
use crate::octree::config::BuildParams;
use crate::octree::info::{OctProp, OctreeInfo};
use crate::octree::is_leaf;
use crate::octree::octree::Octree;
use crate::points::{Points, PointsView};

/// Additive guard for every division and normalization
pub(super) const ESP: f32 = 1.0e-30;

/// Build an octree over a cloud, with the bounding cube taken from the
/// cloud itself
pub fn build_octree(params: &BuildParams, points: &Points) -> Result<Octree, Error> {
    let view = points.view();
    let mut info = OctreeInfo::new();
    info.initialize(params, &view);
    let bounds = points.bounds();
    info.set_bbox_cube(bounds.radius, bounds.center);
    OctreeBuilder::new(info, view)?.build()
}

/// One octree build over a borrowed point cloud.
///
/// Owns every intermediate per-layer array; `build` consumes the builder and
/// returns the serialized [`Octree`].
pub struct OctreeBuilder<'a> {
    pub(super) info: OctreeInfo,
    pub(super) npt: usize,
    pub(super) pts: &'a [f32],
    pub(super) normals: Option<&'a [f32]>,
    pub(super) features: Option<&'a [f32]>,
    pub(super) fpfh: Option<&'a [f32]>,
    pub(super) roughness: Option<&'a [f32]>,
    pub(super) labels: Option<&'a [f32]>,

    /// Points normalized into `[0, 2^depth)`
    pub(super) pts_scaled: Vec<f32>,
    /// Original point index of each sorted entry
    pub(super) sorted_idx: Vec<u32>,
    /// Start of each finest-layer node's point run, plus a final entry
    /// holding the point count
    pub(super) unique_idx: Vec<u32>,

    pub(super) keys: Vec<Vec<u32>>,
    pub(super) children: Vec<Vec<i32>>,

    pub(super) avg_normals: Vec<Vec<f32>>,
    pub(super) avg_features: Vec<Vec<f32>>,
    pub(super) avg_fpfh: Vec<Vec<f32>>,
    pub(super) avg_roughness: Vec<Vec<f32>>,
    pub(super) avg_pts: Vec<Vec<f32>>,
    pub(super) avg_labels: Vec<Vec<f32>>,
    pub(super) displacement: Vec<Vec<f32>>,
    pub(super) split_labels: Vec<Vec<f32>>,
    pub(super) max_label: i32,

    /// Per node: number of finest-layer nodes it covers
    pub(super) dnum: Vec<Vec<i32>>,
    /// Per node: index of its first non-empty finest-layer descendant
    pub(super) didx: Vec<Vec<i32>>,
    pub(super) normal_err: Vec<Vec<f32>>,
    pub(super) distance_err: Vec<Vec<f32>>,
}

impl<'a> OctreeBuilder<'a> {
    pub fn new(info: OctreeInfo, points: PointsView<'a>) -> Result<Self, Error> {
        info.validate()?;
        let npt = points.pt_num();
        if npt == 0 {
            return Err(Error::Points("the point cloud is empty".to_string()));
        }
        let pts = points
            .points()
            .ok_or_else(|| Error::Points("the point coordinates are missing".to_string()))?;
        let normals = points.normals();
        let features = points.features();
        if normals.is_none() && features.is_none() {
            return Err(Error::Points(
                "normals and features must not both be absent".to_string(),
            ));
        }
        if info.has_displace() && normals.is_none() {
            return Err(Error::Points(
                "displacement requires point normals".to_string(),
            ));
        }

        let layers = (info.depth() + 1) as usize;
        Ok(Self {
            info,
            npt,
            pts,
            normals,
            features,
            fpfh: points.fpfh(),
            roughness: points.roughness(),
            labels: points.labels(),
            pts_scaled: Vec::new(),
            sorted_idx: Vec::new(),
            unique_idx: Vec::new(),
            keys: vec![Vec::new(); layers],
            children: vec![Vec::new(); layers],
            avg_normals: vec![Vec::new(); layers],
            avg_features: vec![Vec::new(); layers],
            avg_fpfh: vec![Vec::new(); layers],
            avg_roughness: vec![Vec::new(); layers],
            avg_pts: vec![Vec::new(); layers],
            avg_labels: vec![Vec::new(); layers],
            displacement: vec![Vec::new(); layers],
            split_labels: vec![Vec::new(); layers],
            max_label: 0,
            dnum: vec![Vec::new(); layers],
            didx: vec![Vec::new(); layers],
            normal_err: vec![Vec::new(); layers],
            distance_err: vec![Vec::new(); layers],
        })
    }

    /// Run the full pipeline and serialize the result
    pub fn build(mut self) -> Result<Octree, Error> {
        log::debug!(
            "building octree: {} points, depth {}, full layer {}",
            self.npt,
            self.info.depth(),
            self.info.full_layer()
        );

        self.normalize_pts();
        let mut node_keys = self.sort_keys();
        self.unique_idx = unique_key(&mut node_keys);
        self.build_structure(node_keys);
        self.calc_node_num();

        self.calc_signal_finest();
        let signal_everywhere = self.info.location(OctProp::Feature) == -1;
        if signal_everywhere {
            self.covered_depth_nodes();
            let calc_norm_err = self.info.is_adaptive();
            let calc_dist_err = calc_norm_err && self.info.has_displace();
            self.calc_signal_coarse(calc_norm_err, calc_dist_err);
        }
        if self.info.has_property(OctProp::Split) {
            self.calc_split_label();
        }

        // the trim thresholds read the error arrays the coarse pass fills
        if self.info.is_adaptive() && signal_everywhere {
            self.trim_octree();
        }

        log::debug!(
            "octree built: {} nodes over {} layers, {} bytes",
            self.info.total_nnum(),
            self.info.depth() + 1,
            self.info.sizeof_octree()
        );
        Ok(self.assemble())
    }

    /// Scale the cloud into `[0, 2^depth)` cell coordinates
    fn normalize_pts(&mut self) {
        let bbmin = self.info.bbmin();
        let mul = (1u32 << self.info.depth()) as f32 / self.info.bbox_max_width();

        let mut scaled = vec![0.0f32; 3 * self.npt];
        scaled
            .par_chunks_exact_mut(3)
            .zip(self.pts.par_chunks_exact(3))
            .for_each(|(dst, src)| {
                for j in 0..3 {
                    dst[j] = (src[j] - bbmin[j]) * mul;
                }
            });
        self.pts_scaled = scaled;
    }

    /// Key every point at the finest depth and sort. Packing `(key, index)`
    /// into one u64 sorts by key with ties broken by the original index.
    /// Returns the sorted keys; the matching point indices land in
    /// `sorted_idx`.
    fn sort_keys(&mut self) -> Vec<u32> {
        let depth = self.info.depth();
        // points on the bounding box's max faces land in the last cell
        let max_cell = (1u32 << depth) - 1;

        let mut code: Vec<u64> = self
            .pts_scaled
            .par_chunks_exact(3)
            .enumerate()
            .map(|(i, p)| {
                let pt = [
                    (p[0] as u32).min(max_cell),
                    (p[1] as u32).min(max_cell),
                    (p[2] as u32).min(max_cell),
                ];
                let key = morton::compute_key(pt, depth);
                ((key as u64) << 32) | i as u64
            })
            .collect();
        code.par_sort_unstable();

        let mut sorted_keys = vec![0u32; self.npt];
        let mut sorted_idx = vec![0u32; self.npt];
        for (i, &c) in code.iter().enumerate() {
            sorted_idx[i] = c as u32;
            sorted_keys[i] = (c >> 32) as u32;
        }
        self.sorted_idx = sorted_idx;
        sorted_keys
    }

    /// Grow the node layers from the occupied finest-layer keys.
    ///
    /// Layers `[0, full_layer]` are complete; deeper layers materialize the
    /// full 8-block of children under every occupied parent, with `-1`
    /// marking the empty slots.
    fn build_structure(&mut self, mut node_keys: Vec<u32>) {
        let depth = self.info.depth();
        let full_layer = self.info.full_layer();

        for d in 0..=full_layer {
            let n = 1usize << (3 * d);
            self.keys[d as usize] = (0..n as u32).collect();
            self.children[d as usize] = if d != full_layer {
                (0..n as i32).collect()
            } else {
                vec![-1; n]
            };
        }

        for d in ((full_layer + 1)..=depth).rev() {
            let n = node_keys.len();
            let mut parent_keys: Vec<u32> = node_keys.par_iter().map(|&k| k >> 3).collect();
            let parent_pidx = unique_key(&mut parent_keys);

            // materialize the complete 8-block under every occupied parent
            let np = parent_keys.len();
            let nch = np * 8;
            let mut keys = vec![0u32; nch];
            for (i, key) in keys.iter_mut().enumerate() {
                *key = (parent_keys[i >> 3] << 3) | (i as u32 & 7);
            }
            let mut children = vec![-1i32; nch];

            // base address of each node's parent block
            let mut addr = vec![0u32; n];
            for i in 0..np {
                for j in parent_pidx[i]..parent_pidx[i + 1] {
                    addr[j as usize] = (i as u32) << 3;
                }
            }
            for (i, &key) in node_keys.iter().enumerate() {
                let slot = (key & 7) | addr[i];
                children[slot as usize] = i as i32;
            }

            self.keys[d as usize] = keys;
            self.children[d as usize] = children;
            node_keys = parent_keys;
        }

        // hook the surviving top of the bottom-up build into the full layer
        if depth > full_layer {
            for (i, &key) in node_keys.iter().enumerate() {
                self.children[full_layer as usize][key as usize] = i as i32;
            }
        }
    }

    /// Refresh the header's node counts, cumulative sums and payload offsets
    pub(super) fn calc_node_num(&mut self) {
        let depth = self.info.depth() as usize;

        let node_num: Vec<i32> = (0..=depth).map(|d| self.keys[d].len() as i32).collect();

        let mut node_num_nempty = vec![0i32; depth + 1];
        for d in 0..=depth {
            // the last non-leaf entry indexes the layer's last child block
            for &t in self.children[d].iter().rev() {
                if !is_leaf(t) {
                    node_num_nempty[d] = t + 1;
                    break;
                }
            }
        }

        self.info.set_nnum(&node_num);
        self.info.set_nempty(&node_num_nempty);
        self.info.set_nnum_cum();
        self.info.set_ptr_dis();
    }
}

/// Collapse adjacent duplicate keys in place. Returns the start position of
/// each surviving run, with a final entry holding the input length.
pub(super) fn unique_key(keys: &mut Vec<u32>) -> Vec<u32> {
    let n = keys.len();
    let mut idx = Vec::with_capacity(n + 1);
    idx.push(0);
    if n > 0 {
        let mut j = 1;
        for i in 1..n {
            if keys[i] != keys[i - 1] {
                idx.push(i as u32);
                keys[j] = keys[i];
                j += 1;
            }
        }
        keys.truncate(j);
    }
    idx.push(n as u32);
    idx
}
