//! Dense filtering pipeline for tiled multi-round microscopy data.
//!
//! This crate builds on [`spotfilter_core`] and adds:
//!
//! - [`pipeline`] – the per-channel `Raw -> Convolved -> Smoothed` stages,
//!   band-pass vs. top-hat selection, and the stateless [`recompute`].
//! - [`io`] – loader/store collaborator traits and a binary volume store.
//! - [`image`] – raw volumes from per-plane 16-bit images.
//! - [`batch`] – the worker pool over (tile, round, channel) jobs.
//! - [`app`] – JSON configuration and the end-to-end extract run.
//!
//! Features `rayon` and `tracing` are forwarded to the core crate.

pub mod app;
pub mod batch;
pub mod error;
pub mod image;
pub mod io;
pub mod pipeline;

pub use spotfilter_core::*;

pub use crate::batch::{
    estimate_scale, run_batch, BatchIo, BatchOptions, BatchPlan, BatchSummary, JobOutcome,
    JobStatus,
};
pub use crate::error::PipelineError;
pub use crate::io::{BinVolumeStore, FilteredStore, JobKey, VolumeLoader};
pub use crate::pipeline::{
    recompute, ChannelRole, FilterPipeline, Filtered, FocusStacker, MaxIntensityProjection, Stage,
    ValueHistogram,
};
