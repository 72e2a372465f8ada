use thiserror::Error;

use crate::Coord;

/// Failures reported by the kernel builders and convolution routines.
///
/// Every variant is raised synchronously by the offending call; nothing in
/// this crate retries or recovers locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Invalid or unset radius, `r2 < r1`, an even kernel extent, or smoothing
    /// requested on the nuclear-stain channel.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Mismatched volume/kernel dimensionality or mismatched dual-volume shapes.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// A query coordinate plus the kernel footprint leaves the volume.
    #[error(
        "coordinate {coord:?} with kernel half-extent {half:?} falls outside volume of shape {shape:?}"
    )]
    Bounds {
        coord: Coord,
        half: [usize; 3],
        shape: [usize; 3],
    },
    /// The caller-supplied volume carries less padding than the kernel needs.
    #[error("volume of shape {shape:?} is padded by {applied:?} but the kernel needs {required:?}")]
    Padding {
        shape: [usize; 3],
        applied: [usize; 3],
        required: [usize; 3],
    },
    /// The owning job was cancelled while the computation was in flight.
    #[error("computation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, FilterError>;
