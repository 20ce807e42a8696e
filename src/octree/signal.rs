//! Per-layer signal averaging and error estimation
//!
//! The finest layer averages raw point attributes over each occupied cell;
//! coarser layers average the finest-layer signals over the cells they
//! cover. Adaptive builds additionally annotate each coarse node with a
//! normal deviation and a symmetric point/plane distance error that drive
//! the trim pass.

use rayon::prelude::*;

use glam::Vec3;

use crate::math::morton;
use crate::math::plane::intersect_cube;
use crate::octree::builder::{OctreeBuilder, ESP};
use crate::octree::is_leaf;

/// Rescale displacements into inscribed-sphere units: 2 / sqrt(3)
const DIS_FACTOR: f32 = 1.154_700_5;

/// Sentinel for error entries of leaves and the finest layer
const ERR_SENTINEL: f32 = 1.0e20;

/// Sentinel distance when the plane/cube intersection degenerates
const DEGENERATE_DIST: f32 = 5.0e10;

/// Index of the first maximum; ties go to the lowest label
pub(super) fn first_max_index(counts: &[i32]) -> usize {
    let mut best = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[best] {
            best = i;
        }
    }
    best
}

impl<'a> OctreeBuilder<'a> {
    /// Average raw point attributes into the finest layer
    pub(super) fn calc_signal_finest(&mut self) {
        let depth = self.info.depth();
        let dd = depth as usize;
        let nnum = self.info.nnum(depth) as usize;

        if let Some(normals) = self.normals {
            let channel = normals.len() / self.npt;
            self.avg_normals[dd] = self.average_attr(normals, channel, true);
        }
        if let Some(features) = self.features {
            let channel = features.len() / self.npt;
            self.avg_features[dd] = self.average_attr(features, channel, false);
        }
        if let Some(fpfh) = self.fpfh {
            let channel = fpfh.len() / self.npt;
            self.avg_fpfh[dd] = self.average_attr(fpfh, channel, false);
        }
        if let Some(roughness) = self.roughness {
            let channel = roughness.len() / self.npt;
            self.avg_roughness[dd] = self.average_attr(roughness, channel, false);
        }

        if let Some(labels) = self.labels {
            let max = labels.iter().copied().fold(f32::MIN, f32::max);
            self.max_label = max as i32 + 1;
            let max_label = self.max_label as usize;
            let children = &self.children[dd];

            self.avg_labels[dd] = (0..nnum)
                .into_par_iter()
                .map(|i| {
                    let t = children[i];
                    if is_leaf(t) {
                        return -1.0;
                    }
                    let t = t as usize;
                    let mut counts = vec![0i32; max_label];
                    for j in self.unique_idx[t]..self.unique_idx[t + 1] {
                        let h = self.sorted_idx[j as usize] as usize;
                        counts[labels[h] as usize] += 1;
                    }
                    first_max_index(&counts) as f32
                })
                .collect();
        }

        if self.info.has_displace() && self.normals.is_some() {
            let children = &self.children[dd];
            let normals_avg = &self.avg_normals[dd];

            let cells: Vec<Option<([f32; 3], f32)>> = (0..nnum)
                .into_par_iter()
                .map(|i| {
                    let t = children[i];
                    if is_leaf(t) {
                        return None;
                    }
                    let t = t as usize;
                    let mut avg_pt = [0.0f32; 3];
                    for j in self.unique_idx[t]..self.unique_idx[t + 1] {
                        let h = self.sorted_idx[j as usize] as usize;
                        for c in 0..3 {
                            avg_pt[c] += self.pts_scaled[3 * h + c];
                        }
                    }
                    let factor = (self.unique_idx[t + 1] - self.unique_idx[t]) as f32 + ESP;
                    let mut dis = 0.0;
                    for c in 0..3 {
                        avg_pt[c] /= factor;
                        // signed offset of the cell mean from the cell center,
                        // projected on the averaged normal
                        dis += (avg_pt[c].fract() - 0.5) * normals_avg[c * nnum + i];
                    }
                    Some((avg_pt, dis * DIS_FACTOR))
                })
                .collect();

            let mut avg_pts = vec![0.0f32; 3 * nnum];
            let mut displacement = vec![0.0f32; nnum];
            for (i, cell) in cells.iter().enumerate() {
                if let Some((pt, dis)) = cell {
                    for c in 0..3 {
                        avg_pts[c * nnum + i] = pt[c];
                    }
                    displacement[i] = *dis;
                }
            }
            self.avg_pts[dd] = avg_pts;
            self.displacement[dd] = displacement;
        }
    }

    /// Channel-major average of one attribute over the finest layer. Unit
    /// normalization renormalizes the summed vector, otherwise the sum is
    /// divided by the cell's point count.
    fn average_attr(&self, attr: &[f32], channel: usize, unit_normalize: bool) -> Vec<f32> {
        let depth = self.info.depth();
        let nnum = self.info.nnum(depth) as usize;
        let children = &self.children[depth as usize];

        let node_avg: Vec<Vec<f32>> = (0..nnum)
            .into_par_iter()
            .map(|i| {
                let t = children[i];
                if is_leaf(t) {
                    return Vec::new();
                }
                let t = t as usize;
                let mut avg = vec![0.0f32; channel];
                for j in self.unique_idx[t]..self.unique_idx[t + 1] {
                    let h = self.sorted_idx[j as usize] as usize;
                    for c in 0..channel {
                        avg[c] += attr[channel * h + c];
                    }
                }
                let factor = if unit_normalize {
                    let mut len = ESP;
                    for &v in &avg {
                        len += v * v;
                    }
                    len.sqrt()
                } else {
                    (self.unique_idx[t + 1] - self.unique_idx[t]) as f32 + ESP
                };
                for v in &mut avg {
                    *v /= factor;
                }
                avg
            })
            .collect();

        let mut out = vec![0.0f32; channel * nnum];
        for (i, avg) in node_avg.iter().enumerate() {
            for (c, &v) in avg.iter().enumerate() {
                out[c * nnum + i] = v;
            }
        }
        out
    }

    /// For every layer, record how many finest-layer nodes each node covers
    /// and where its coverage starts
    pub(super) fn covered_depth_nodes(&mut self) {
        let depth = self.info.depth();
        let dd = depth as usize;

        for d in 0..=dd {
            let nnum = self.info.nnum(d as i32) as usize;
            self.dnum[d] = vec![0; nnum];
            self.didx[d] = vec![-1; nnum];
        }

        // the finest layer covers itself
        for i in 0..self.info.nnum(depth) as usize {
            self.dnum[dd][i] = 1;
            self.didx[dd][i] = i as i32;
        }

        // one level up, every occupied node covers its complete 8-block
        for i in 0..self.info.nnum(depth - 1) as usize {
            let t = self.children[dd - 1][i];
            if is_leaf(t) {
                continue;
            }
            self.dnum[dd - 1][i] = 8;
            self.didx[dd - 1][i] = t * 8;
        }

        // sum coverage up the remaining layers
        for d in (0..dd.saturating_sub(1)).rev() {
            let nnum = self.info.nnum(d as i32) as usize;
            let (dnum_head, dnum_tail) = self.dnum.split_at_mut(d + 1);
            let (didx_head, didx_tail) = self.didx.split_at_mut(d + 1);
            let children_d = &self.children[d];
            for i in 0..nnum {
                let t = children_d[i];
                if is_leaf(t) {
                    continue;
                }
                let t8 = (t * 8) as usize;
                for j in 0..8 {
                    dnum_head[d][i] += dnum_tail[0][t8 + j];
                }
                for j in 0..8 {
                    if didx_tail[0][t8 + j] != -1 {
                        didx_head[d][i] = didx_tail[0][t8 + j];
                        break;
                    }
                }
            }
        }
    }

    /// Average the finest-layer signals up the coarser layers, and annotate
    /// error estimates on the layers the adaptive trim may collapse
    pub(super) fn calc_signal_coarse(&mut self, calc_normal_err: bool, calc_dist_err: bool) {
        let depth = self.info.depth();
        let depth_adp = self.info.adaptive_layer();
        let nnum_depth = self.info.nnum(depth) as usize;
        let dd = depth as usize;

        // borrow the finest layer's data for the whole pass
        let children_depth = std::mem::take(&mut self.children[dd]);
        let normal_depth = std::mem::take(&mut self.avg_normals[dd]);
        let pt_depth = std::mem::take(&mut self.avg_pts[dd]);
        let feature_depth = std::mem::take(&mut self.avg_features[dd]);
        let fpfh_depth = std::mem::take(&mut self.avg_fpfh[dd]);
        let roughness_depth = std::mem::take(&mut self.avg_roughness[dd]);
        let label_depth = std::mem::take(&mut self.avg_labels[dd]);

        let channel_normal = normal_depth.len() / nnum_depth;
        let channel_pt = pt_depth.len() / nnum_depth;
        let channel_feature = feature_depth.len() / nnum_depth;
        let channel_fpfh = fpfh_depth.len() / nnum_depth;
        let channel_roughness = roughness_depth.len() / nnum_depth;
        let channel_label = label_depth.len() / nnum_depth;

        let has_normal = !normal_depth.is_empty();
        let has_pt = !pt_depth.is_empty();
        let has_feature = !feature_depth.is_empty();
        let has_fpfh = !fpfh_depth.is_empty();
        let has_roughness = !roughness_depth.is_empty();
        let has_label = !label_depth.is_empty();
        let has_dis = !self.displacement[dd].is_empty();

        if calc_normal_err {
            self.normal_err[dd] = vec![ERR_SENTINEL; nnum_depth];
        }
        if calc_dist_err {
            self.distance_err[dd] = vec![ERR_SENTINEL; nnum_depth];
        }

        for d in (0..depth).rev() {
            let du = d as usize;
            let nnum_d = self.info.nnum(d) as usize;
            let scale = (1i32 << (depth - d)) as f32;

            if has_normal {
                self.avg_normals[du] = vec![0.0; nnum_d * channel_normal];
            }
            if has_pt {
                self.avg_pts[du] = vec![0.0; nnum_d * channel_pt];
            }
            if has_feature {
                self.avg_features[du] = vec![0.0; nnum_d * channel_feature];
            }
            if has_fpfh {
                self.avg_fpfh[du] = vec![0.0; nnum_d * channel_fpfh];
            }
            if has_roughness {
                self.avg_roughness[du] = vec![0.0; nnum_d * channel_roughness];
            }
            if has_label {
                self.avg_labels[du] = vec![-1.0; nnum_d * channel_label];
            }
            if has_dis {
                self.displacement[du] = vec![0.0; nnum_d];
            }
            if calc_normal_err {
                self.normal_err[du] = vec![ERR_SENTINEL; nnum_d];
            }
            if calc_dist_err {
                self.distance_err[du] = vec![ERR_SENTINEL; nnum_d];
            }

            for i in 0..nnum_d {
                if is_leaf(self.children[du][i]) {
                    continue;
                }
                let first = self.didx[du][i] as usize;
                let last = first + self.dnum[du][i] as usize;

                // non-empty finest nodes under this one
                let mut count = ESP;
                for j in first..last {
                    if !is_leaf(children_depth[j]) {
                        count += 1.0;
                    }
                }

                let mut n_avg = vec![0.0f32; channel_normal];
                if has_normal {
                    for j in first..last {
                        if is_leaf(children_depth[j]) {
                            continue;
                        }
                        for c in 0..channel_normal {
                            n_avg[c] += normal_depth[c * nnum_depth + j];
                        }
                    }
                    let mut len = ESP;
                    for &v in &n_avg {
                        len += v * v;
                    }
                    let len = len.sqrt();
                    for c in 0..channel_normal {
                        n_avg[c] /= len;
                        self.avg_normals[du][c * nnum_d + i] = n_avg[c];
                    }
                }

                let mut pt_avg = vec![0.0f32; channel_pt];
                if has_pt {
                    for j in first..last {
                        if is_leaf(children_depth[j]) {
                            continue;
                        }
                        for c in 0..channel_pt {
                            pt_avg[c] += pt_depth[c * nnum_depth + j];
                        }
                    }
                    for c in 0..channel_pt {
                        // keep the average in this layer's own cell units
                        pt_avg[c] /= count * scale;
                        self.avg_pts[du][c * nnum_d + i] = pt_avg[c];
                    }
                }

                if has_feature {
                    for c in 0..channel_feature {
                        let mut f_avg = 0.0;
                        for j in first..last {
                            if is_leaf(children_depth[j]) {
                                continue;
                            }
                            f_avg += feature_depth[c * nnum_depth + j];
                        }
                        self.avg_features[du][c * nnum_d + i] = f_avg / count;
                    }
                }

                if has_fpfh {
                    for c in 0..channel_fpfh {
                        let mut f_avg = 0.0;
                        for j in first..last {
                            if is_leaf(children_depth[j]) {
                                continue;
                            }
                            f_avg += fpfh_depth[c * nnum_depth + j];
                        }
                        self.avg_fpfh[du][c * nnum_d + i] = f_avg / count;
                    }
                }

                if has_roughness {
                    for c in 0..channel_roughness {
                        let mut r_avg = 0.0;
                        for j in first..last {
                            if is_leaf(children_depth[j]) {
                                continue;
                            }
                            r_avg += roughness_depth[c * nnum_depth + j];
                        }
                        self.avg_roughness[du][c * nnum_d + i] = r_avg / count;
                    }
                }

                if has_label {
                    let mut l_avg = vec![0i32; self.max_label.max(0) as usize];
                    for j in first..last {
                        if is_leaf(children_depth[j]) {
                            continue;
                        }
                        l_avg[label_depth[j] as usize] += 1;
                    }
                    self.avg_labels[du][i] = first_max_index(&l_avg) as f32;
                }

                let pt_base = morton::compute_pt(self.keys[du][i], d);
                if has_dis {
                    let mut dis_avg = 0.0;
                    for c in 0..3 {
                        let fract = pt_avg[c] - pt_base[c] as f32;
                        dis_avg += (fract - 0.5) * n_avg[c];
                    }
                    self.displacement[du][i] = dis_avg * DIS_FACTOR;
                }

                if calc_normal_err && has_normal && d >= depth_adp {
                    let mut nm_err = 0.0;
                    for j in first..last {
                        if is_leaf(children_depth[j]) {
                            continue;
                        }
                        for c in 0..3 {
                            let diff = normal_depth[c * nnum_depth + j] - n_avg[c];
                            nm_err += diff * diff;
                        }
                    }
                    self.normal_err[du][i] = nm_err / count;
                }

                if calc_dist_err && has_pt && d >= depth_adp {
                    // forward: farthest fine point from the averaged plane
                    let mut distance_max1 = -1.0f32;
                    let pt_avg1 = [pt_avg[0] * scale, pt_avg[1] * scale, pt_avg[2] * scale];
                    for j in first..last {
                        if is_leaf(children_depth[j]) {
                            continue;
                        }
                        let mut dis = 0.0;
                        for c in 0..3 {
                            dis += (pt_depth[c * nnum_depth + j] - pt_avg1[c]) * n_avg[c];
                        }
                        let dis = dis.abs();
                        if dis > distance_max1 {
                            distance_max1 = dis;
                        }
                    }

                    // reverse: farthest plane/cube vertex from the fine points
                    let mut distance_max2 = -1.0f32;
                    let vtx = intersect_cube(
                        Vec3::new(pt_avg[0], pt_avg[1], pt_avg[2]),
                        Vec3::new(pt_base[0] as f32, pt_base[1] as f32, pt_base[2] as f32),
                        Vec3::new(n_avg[0], n_avg[1], n_avg[2]),
                    );
                    if vtx.is_empty() {
                        distance_max2 = DEGENERATE_DIST;
                    }
                    for v in &vtx {
                        let sv = *v * scale;
                        let mut distance_min = 1.0e30f32;
                        for j in first..last {
                            if is_leaf(children_depth[j]) {
                                continue;
                            }
                            let mut dis = 0.0;
                            for c in 0..3 {
                                let diff = pt_depth[c * nnum_depth + j] - sv[c];
                                dis += diff * diff;
                            }
                            let dis = dis.sqrt();
                            if dis < distance_min {
                                distance_min = dis;
                            }
                        }
                        if distance_min > distance_max2 {
                            distance_max2 = distance_min;
                        }
                    }

                    self.distance_err[du][i] = distance_max2.max(distance_max1);
                }
            }
        }

        self.children[dd] = children_depth;
        self.avg_normals[dd] = normal_depth;
        self.avg_pts[dd] = pt_depth;
        self.avg_features[dd] = feature_depth;
        self.avg_fpfh[dd] = fpfh_depth;
        self.avg_roughness[dd] = roughness_depth;
        self.avg_labels[dd] = label_depth;
    }

    /// Per-node split labels: 1 for occupied internal nodes, 0 for empty
    /// leaves, 2 for adaptive leaves whose averaged normal witnesses a
    /// well-approximated surface
    pub(super) fn calc_split_label(&mut self) {
        let depth = self.info.depth();
        let adaptive = self.info.is_adaptive();

        for d in 0..=depth {
            let du = d as usize;
            let nnum = self.info.nnum(d) as usize;
            let has_normal = !self.avg_normals[du].is_empty();
            let mut split = vec![1.0f32; nnum];
            for (i, s) in split.iter_mut().enumerate() {
                if is_leaf(self.children[du][i]) {
                    *s = 0.0;
                    if adaptive && has_normal {
                        let normals = &self.avg_normals[du];
                        let t = normals[i].abs()
                            + normals[nnum + i].abs()
                            + normals[2 * nnum + i].abs();
                        if t != 0.0 {
                            *s = 2.0;
                        }
                    }
                }
            }
            self.split_labels[du] = split;
        }
    }
}
