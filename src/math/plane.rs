//! Plane / cube intersection
//!
//! Supports the reverse half of the octree distance-error metric: the plane
//! carried by a coarse node (averaged point + averaged normal) is clipped
//! against the node's unit cube, and the resulting vertices are measured
//! against the fine geometry.

use glam::Vec3;

/// Cube corner `i` has coordinates `(i & 1, (i >> 1) & 1, (i >> 2) & 1)`.
const EDGES: [(usize, usize); 12] = [
    (0, 1), (2, 3), (4, 5), (6, 7), // x-aligned
    (0, 2), (1, 3), (4, 6), (5, 7), // y-aligned
    (0, 4), (1, 5), (2, 6), (3, 7), // z-aligned
];

/// Intersect the plane through `pt` with normal `normal` against the unit
/// cube `[base, base + 1]^3`.
///
/// Returns one vertex per crossed cube edge (3 to 6 for a proper crossing).
/// A zero normal, or a plane that misses the cube, yields no vertices.
pub fn intersect_cube(pt: Vec3, base: Vec3, normal: Vec3) -> Vec<Vec3> {
    let corners: [Vec3; 8] = std::array::from_fn(|i| {
        base + Vec3::new(
            (i & 1) as f32,
            ((i >> 1) & 1) as f32,
            ((i >> 2) & 1) as f32,
        )
    });

    let dist: [f32; 8] = std::array::from_fn(|i| (corners[i] - pt).dot(normal));

    let mut vertices = Vec::new();
    for &(a, b) in EDGES.iter() {
        let (da, db) = (dist[a], dist[b]);
        if da * db < 0.0 {
            let t = da / (da - db);
            vertices.push(corners[a] + t * (corners[b] - corners[a]));
        }
    }
    vertices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_aligned_crossing() {
        // plane x = 0.5 through the unit cube at the origin
        let vtx = intersect_cube(Vec3::new(0.5, 0.5, 0.5), Vec3::ZERO, Vec3::X);
        assert_eq!(vtx.len(), 4);
        for v in &vtx {
            assert!((v.x - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_diagonal_crossing() {
        let n = Vec3::ONE.normalize();
        let vtx = intersect_cube(Vec3::new(0.5, 0.5, 0.5), Vec3::ZERO, n);
        assert!((3..=6).contains(&vtx.len()), "got {} vertices", vtx.len());
        for v in &vtx {
            let d = (*v - Vec3::new(0.5, 0.5, 0.5)).dot(n);
            assert!(d.abs() < 1e-5);
            assert!(v.min_element() >= -1e-5 && v.max_element() <= 1.0 + 1e-5);
        }
    }

    #[test]
    fn test_degenerate_normal() {
        let vtx = intersect_cube(Vec3::new(0.5, 0.5, 0.5), Vec3::ZERO, Vec3::ZERO);
        assert!(vtx.is_empty());
    }

    #[test]
    fn test_plane_outside_cube() {
        let vtx = intersect_cube(Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO, Vec3::X);
        assert!(vtx.is_empty());
    }

    #[test]
    fn test_offset_base() {
        // same plane, cube shifted one cell along x: no crossing
        let vtx = intersect_cube(Vec3::new(0.5, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0), Vec3::X);
        assert!(vtx.is_empty());

        // plane x = 1.5 crosses the shifted cube
        let vtx = intersect_cube(Vec3::new(1.5, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0), Vec3::X);
        assert_eq!(vtx.len(), 4);
    }
}
