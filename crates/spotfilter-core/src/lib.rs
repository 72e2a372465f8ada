//! Numeric core for band-pass filtering of microscopy volumes.
//!
//! # Overview
//!
//! - [`kernel`] – the zero-sum difference-of-Hann band-pass kernel (1-D
//!   profile and its rotationally symmetric 2-D/3-D expansion) and the flat
//!   disk footprint used for the nuclear-stain top-hat.
//! - [`boundary`] – the padding contract between a volume and a kernel.
//! - [`sparse`] – convolution evaluated only at a list of coordinates,
//!   optionally over two co-registered volumes in one pass.
//! - [`dense`] – whole-volume convolution, white top-hat and mean smoothing.
//! - [`neighbours`] – positive/negative voxel counts around spots.
//! - [`config`] – the resolved [`FilterConfig`] and radius resolution.
//!
//! Volumes are [`ndarray::Array3`] indexed `(y, x, z)`. 2-D data is carried
//! with a z extent of 1, so every routine handles both cases uniformly.
//! Kernel weights are integers (see [`kernel::PROFILE_SCALE`]) and all
//! accumulation is exact `i64` arithmetic.
//!
//! # Features
//!
//! - `tracing` *(default)* – emits spans for the dense and sparse entry points
//!   and a warning when a kernel extent has to be corrected.
//! - `rayon` – distributes output rows (dense) or query points (sparse)
//!   across threads. Results are bit-identical to the sequential path.

pub mod boundary;
pub mod cancel;
pub mod config;
pub mod dense;
pub mod error;
pub mod kernel;
pub mod neighbours;
pub mod sparse;

/// Integer `(y, x, z)` location in a volume's index space.
pub type Coord = [usize; 3];

pub use crate::boundary::{required_padding, validate, PaddedVolume};
pub use crate::cancel::CancelToken;
pub use crate::config::{default_r2, resolve_radius_pixels, FilterConfig};
pub use crate::dense::{convolve_dense, smooth_mean, white_tophat};
pub use crate::error::{FilterError, Result};
pub use crate::kernel::{
    build_bandpass, build_radial_profile, build_tophat, ensure_odd, expand_to_nd, Kernel,
    RadialProfile,
};
pub use crate::neighbours::{count_spot_neighbours, NeighbourCounts};
pub use crate::sparse::{convolve_at_points, convolve_padded, PointResponses};
