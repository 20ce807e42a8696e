//! Cloudtree - point-cloud to octree conversion
//!
//! Converts an unordered 3D point cloud (with optional normals, features,
//! FPFH descriptors, roughness and labels) into a compact serialized octree:
//! Morton keying, a sort-driven bottom-up structure build, per-layer signal
//! averaging, optional error-driven adaptive trimming, and a single
//! contiguous output buffer described by a fixed binary header.

pub mod core;
pub mod math;
pub mod octree;
pub mod points;
