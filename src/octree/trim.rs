//! Adaptive octree trimming
//!
//! Top-down over the adaptive layers, a node whose subtree approximates the
//! surface within the configured thresholds keeps its averaged signal and
//! drops its children; descendants of dropped nodes are removed outright.
//! Every touched layer is then rewritten: keys filtered, child indices
//! renumbered, and each signal re-gathered into channel-major order over the
//! reduced node count.

use crate::octree::builder::OctreeBuilder;
use crate::octree::info::OctProp;
use crate::octree::is_leaf;

/// Per-node trim state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trim {
    /// Remove the node entirely
    Drop,
    /// Keep the node but turn it into a leaf
    DropChildren,
    Keep,
}

impl<'a> OctreeBuilder<'a> {
    /// Collapse well-approximated subtrees and rewrite the affected layers.
    /// Guarantees at least one internal node survives in every adaptive
    /// layer.
    pub(super) fn trim_octree(&mut self) {
        let depth = self.info.depth();
        // the flag pass walks parents at depth_adp - 1, so the root layer
        // itself is never collapsed
        let depth_adp = self.info.adaptive_layer().max(1);
        let th_dist = self.info.threshold_distance();
        let th_norm = self.info.threshold_normal();
        let has_dis = self.info.has_displace();
        let total_before = self.info.total_nnum();

        // flag pass, top-down
        let mut drop: Vec<Vec<Trim>> = (0..=depth)
            .map(|d| vec![Trim::Keep; self.info.nnum(d) as usize])
            .collect();

        for d in depth_adp..=depth {
            let dd = d as usize;
            let nnum_dp = self.info.nnum(d - 1) as usize;
            let children_d = &self.children[dd];
            let children_dp = &self.children[dd - 1];
            let (head, tail) = drop.split_at_mut(dd);
            let drop_dp = &head[dd - 1];
            let drop_d = &mut tail[0];

            let mut all_drop = true;
            for i in 0..nnum_dp {
                let t = children_dp[i];
                if is_leaf(t) {
                    continue;
                }

                for j in 0..8 {
                    let idx = (t * 8) as usize + j;
                    if drop_dp[i] == Trim::Keep {
                        // leaves and finest-layer nodes hold the 1e20 error
                        // sentinel, so only internal nodes can pass this test
                        if (!has_dis || self.distance_err[dd][idx] < th_dist)
                            && self.normal_err[dd][idx] < th_norm
                        {
                            drop_d[idx] = Trim::DropChildren;
                        }
                    } else {
                        drop_d[idx] = Trim::Drop;
                    }

                    if all_drop {
                        all_drop = !(drop_d[idx] == Trim::Keep && !is_leaf(children_d[idx]));
                    }
                }
            }

            // keep the worst-approximated internal node so the layer stays
            // non-empty
            if all_drop {
                let mut max_idx = 0usize;
                let mut max_err = -1.0f32;
                for i in 0..nnum_dp {
                    let t = children_dp[i];
                    if is_leaf(t) || drop_dp[i] != Trim::Keep {
                        continue;
                    }
                    for j in 0..8 {
                        let idx = (t * 8) as usize + j;
                        if !is_leaf(children_d[idx]) && self.normal_err[dd][idx] > max_err {
                            max_err = self.normal_err[dd][idx];
                            max_idx = idx;
                        }
                    }
                }
                drop_d[max_idx] = Trim::Keep;
            }
        }

        // rewrite the trimmed layers
        for d in depth_adp..=depth {
            let dd = d as usize;
            let nnum_d = self.info.nnum(d) as usize;
            let drop_d = &drop[dd];

            let mut keys = Vec::new();
            for i in 0..nnum_d {
                if drop_d[i] != Trim::Drop {
                    keys.push(self.keys[dd][i]);
                }
            }
            self.keys[dd] = keys;

            let mut children = Vec::new();
            let mut id = 0i32;
            for i in 0..nnum_d {
                if drop_d[i] == Trim::Drop {
                    continue;
                }
                let ch = if drop_d[i] == Trim::Keep && !is_leaf(self.children[dd][i]) {
                    let c = id;
                    id += 1;
                    c
                } else {
                    -1
                };
                children.push(ch);
            }
            self.children[dd] = children;

            trim_signal(&mut self.displacement[dd], nnum_d, drop_d);
            trim_signal(&mut self.avg_normals[dd], nnum_d, drop_d);
            trim_signal(&mut self.avg_features[dd], nnum_d, drop_d);
            trim_signal(&mut self.avg_fpfh[dd], nnum_d, drop_d);
            trim_signal(&mut self.avg_roughness[dd], nnum_d, drop_d);
            trim_signal(&mut self.avg_labels[dd], nnum_d, drop_d);
        }

        self.calc_node_num();
        if self.info.has_property(OctProp::Split) {
            self.calc_split_label();
        }

        log::debug!(
            "adaptive trim: {} -> {} nodes",
            total_before,
            self.info.total_nnum()
        );
    }
}

/// Filter a channel-major signal by the drop flags, then rebuild the
/// channel-major layout over the reduced node count
fn trim_signal(signal: &mut Vec<f32>, nnum: usize, drop: &[Trim]) {
    if signal.is_empty() {
        return;
    }
    let channel = signal.len() / nnum;

    // gather the kept nodes in node-major order
    let mut data = Vec::new();
    for i in 0..nnum {
        if drop[i] == Trim::Drop {
            continue;
        }
        for c in 0..channel {
            data.push(signal[c * nnum + i]);
        }
    }

    // transpose back to channel-major
    let num = data.len() / channel;
    signal.clear();
    signal.resize(data.len(), 0.0);
    for i in 0..num {
        for c in 0..channel {
            signal[c * num + i] = data[i * channel + c];
        }
    }
}
