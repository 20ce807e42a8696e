//! Octree build configuration

use serde::{Deserialize, Serialize};

/// Parameters controlling an octree build.
///
/// `OctreeInfo::initialize` turns these into the header's property table;
/// the defaults mirror the common learning-pipeline setup: depth-6 octree,
/// two dense layers, no adaptive trimming.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildParams {
    /// Target octree depth (1-8)
    pub depth: i32,
    /// Layers [0, full_layer] are stored as complete octrees
    pub full_layer: i32,
    /// Collapse well-approximated subtrees below `adaptive_layer`
    pub adaptive: bool,
    /// Shallowest layer the adaptive trim may collapse
    pub adaptive_layer: i32,
    /// Store a per-node signed displacement along the averaged normal
    pub node_displacement: bool,
    /// Store averaged signals on every layer, not only the finest
    pub node_feature: bool,
    /// Store per-node split labels (empty / split / surface leaf)
    pub split_label: bool,
    /// Serialize keys as packed xyz coordinates instead of Morton codes
    pub key2xyz: bool,
    /// Adaptive trim: max tolerated point-to-plane distance error, in units
    /// of the finest cells
    pub th_distance: f32,
    /// Adaptive trim: max tolerated mean squared normal deviation
    pub th_normal: f32,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            depth: 6,
            full_layer: 2,
            adaptive: false,
            adaptive_layer: 4,
            node_displacement: false,
            node_feature: false,
            split_label: false,
            key2xyz: false,
            th_distance: 0.866,
            th_normal: 0.2,
        }
    }
}
