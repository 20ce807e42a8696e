//! Error types for cloudtree

use thiserror::Error;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid point cloud: {0}")]
    Points(String),

    #[error("Invalid octree format: {0}")]
    Format(String),
}
