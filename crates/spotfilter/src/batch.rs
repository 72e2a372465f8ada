//! Batch execution over independent (tile, round, channel) jobs.
//!
//! Jobs share nothing mutable: each one loads its raw volume, derives its
//! terminal stage and hands the result to the store. With the `rayon`
//! feature they run on the global thread pool.

use std::path::PathBuf;

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::Serialize;
use spotfilter_core::{CancelToken, FilterError};
#[cfg(feature = "tracing")]
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::io::{FilteredStore, JobKey, VolumeLoader};
use crate::pipeline::{
    auto_threshold, value_histogram, ChannelRole, FilterPipeline, FocusStacker, Stage,
    ValueHistogram, PIXEL_VALUE_SHIFT,
};

/// Which jobs to run and which channel is the nuclear stain.
#[derive(Clone, Debug, Default)]
pub struct BatchPlan {
    pub tiles: Vec<usize>,
    /// Imaging rounds; every listed channel is processed.
    pub rounds: Vec<usize>,
    pub channels: Vec<usize>,
    /// Extra round that only carries the anchor and nuclear-stain channels.
    pub anchor_round: Option<usize>,
    pub anchor_channel: Option<usize>,
    pub dapi_channel: Option<usize>,
}

impl BatchPlan {
    /// Channels processed in the anchor round, sorted.
    pub fn anchor_channels(&self) -> Vec<usize> {
        let mut chans: Vec<usize> = [self.dapi_channel, self.anchor_channel]
            .into_iter()
            .flatten()
            .collect();
        chans.sort_unstable();
        chans.dedup();
        chans
    }

    /// The nuclear-stain channel is top-hat filtered in the anchor round only.
    pub fn role_of(&self, key: JobKey) -> ChannelRole {
        if self.anchor_round == Some(key.round) && self.dapi_channel == Some(key.channel) {
            ChannelRole::NuclearStain
        } else {
            ChannelRole::BandPass
        }
    }

    fn is_anchor_round(&self, round: usize) -> bool {
        self.anchor_round == Some(round)
    }

    /// Volumes an imaging-round scale is estimated from: every channel of
    /// the first tile in the first imaging round.
    pub fn imaging_scale_refs(&self) -> Vec<JobKey> {
        let round = self.rounds.iter().copied().find(|&r| !self.is_anchor_round(r));
        match (self.tiles.first(), round) {
            (Some(&tile), Some(round)) => self
                .channels
                .iter()
                .map(|&c| JobKey::new(tile, round, c))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Volume the anchor-round scale is estimated from: the anchor channel
    /// of the first tile.
    pub fn anchor_scale_refs(&self) -> Vec<JobKey> {
        match (self.tiles.first(), self.anchor_round, self.anchor_channel) {
            (Some(&tile), Some(round), Some(channel)) => vec![JobKey::new(tile, round, channel)],
            _ => Vec::new(),
        }
    }

    /// Every job, imaging rounds first and the anchor round last.
    pub fn jobs(&self) -> Vec<JobKey> {
        let anchor_channels = self.anchor_channels();
        let imaging = self
            .rounds
            .iter()
            .filter(|&&r| Some(r) != self.anchor_round)
            .map(|&r| (r, self.channels.as_slice()));
        let anchor = self.anchor_round.map(|r| (r, anchor_channels.as_slice()));

        let mut jobs = Vec::new();
        for (round, channels) in imaging.chain(anchor) {
            for &tile in &self.tiles {
                for &channel in channels {
                    jobs.push(JobKey::new(tile, round, channel));
                }
            }
        }
        jobs
    }
}

/// Target peak of the brightest reference volume when a scale is estimated.
pub const DEFAULT_SCALE_NORM: f32 = 35_000.0;

#[derive(Clone, Copy, Debug)]
pub struct BatchOptions {
    /// Recompute jobs whose output already exists.
    pub overwrite: bool,
    pub auto_thresh_multiplier: f32,
    /// Band-pass scale for imaging rounds; estimated when `None`.
    pub scale: Option<f32>,
    /// Band-pass scale for the anchor round; estimated when `None`.
    pub scale_anchor: Option<f32>,
    pub scale_norm: f32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            auto_thresh_multiplier: 10.0,
            scale: None,
            scale_anchor: None,
            scale_norm: DEFAULT_SCALE_NORM,
        }
    }
}

/// Fail unless the brightest filtered value `scale_norm` maps to is a
/// significant fraction of the shifted `u16` range.
pub fn check_scale_norm(scale_norm: f32) -> std::result::Result<(), FilterError> {
    let max = f32::from(u16::MAX) - PIXEL_VALUE_SHIFT as f32;
    let min = max / 5.0;
    if (min..=max).contains(&scale_norm) {
        Ok(())
    } else {
        Err(FilterError::Config(format!(
            "scale_norm {scale_norm} outside [{min}, {max}]"
        )))
    }
}

/// Scale mapping the largest band-pass response among `refs` to
/// `scale_norm`.
pub fn estimate_scale(
    pipeline: &FilterPipeline,
    io: BatchIo<'_>,
    refs: &[JobKey],
    scale_norm: f32,
    cancel: &CancelToken,
) -> Result<f32> {
    check_scale_norm(scale_norm)?;
    let mut peak = 0i32;
    for &key in refs {
        let raw = io.loader.load_volume(key)?;
        let filtered = pipeline.run_scaled(
            Stage::Convolved,
            raw.view(),
            ChannelRole::BandPass,
            io.stacker,
            1.0,
            cancel,
        )?;
        peak = peak.max(filtered.volume.iter().copied().max().unwrap_or(0));
    }
    if peak <= 0 {
        return Err(FilterError::Config(format!(
            "no positive band-pass response in {refs:?} to derive a scale from"
        ))
        .into());
    }
    Ok(scale_norm / peak as f32)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    /// `auto_thresh`, `scale` and `histogram` are absent for the
    /// nuclear-stain channel.
    Written {
        path: PathBuf,
        auto_thresh: Option<f32>,
        scale: Option<f32>,
        histogram: Option<ValueHistogram>,
    },
    Skipped,
    Cancelled,
    Failed {
        error: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobOutcome {
    #[serde(flatten)]
    pub key: JobKey,
    #[serde(flatten)]
    pub status: JobStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    /// Band-pass scales the batch ran with, when any job needed them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_anchor: Option<f32>,
    pub written: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub jobs: Vec<JobOutcome>,
}

impl BatchSummary {
    pub fn from_outcomes(jobs: Vec<JobOutcome>) -> Self {
        let mut summary = Self::default();
        for job in &jobs {
            match job.status {
                JobStatus::Written { .. } => summary.written += 1,
                JobStatus::Skipped => summary.skipped += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
                JobStatus::Failed { .. } => summary.failed += 1,
            }
        }
        summary.jobs = jobs;
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Collaborators a batch reads from and writes to.
#[derive(Clone, Copy)]
pub struct BatchIo<'a> {
    pub loader: &'a dyn VolumeLoader,
    pub store: &'a dyn FilteredStore,
    pub stacker: &'a dyn FocusStacker,
}

/// Scale for one group of jobs: fixed, estimated, or the estimation error.
type ResolvedScale = Option<std::result::Result<f32, String>>;

fn run_job(
    pipeline: &FilterPipeline,
    plan: &BatchPlan,
    io: BatchIo<'_>,
    opts: &BatchOptions,
    scale: &ResolvedScale,
    key: JobKey,
    cancel: &CancelToken,
) -> Result<JobStatus> {
    if cancel.is_cancelled() {
        return Ok(JobStatus::Cancelled);
    }
    if !opts.overwrite && io.store.exists(key) {
        return Ok(JobStatus::Skipped);
    }
    let role = plan.role_of(key);
    let scale = match (role, scale) {
        (ChannelRole::NuclearStain, _) => None,
        (ChannelRole::BandPass, Some(Ok(s))) => Some(*s),
        (ChannelRole::BandPass, Some(Err(e))) => {
            return Ok(JobStatus::Failed { error: e.clone() })
        }
        (ChannelRole::BandPass, None) => {
            return Ok(JobStatus::Failed {
                error: format!("no band-pass scale resolved for round {}", key.round),
            })
        }
    };
    let raw = io.loader.load_volume(key)?;
    let stage = pipeline.terminal_stage(role);
    let filtered = pipeline.run_scaled(
        stage,
        raw.view(),
        role,
        io.stacker,
        scale.unwrap_or(1.0),
        cancel,
    )?;
    let (auto_thresh, histogram) = match role {
        ChannelRole::BandPass => (
            Some(auto_threshold(
                filtered.volume.view(),
                opts.auto_thresh_multiplier,
            )),
            Some(value_histogram(
                filtered.volume.view(),
                &filtered.bad_columns,
            )),
        ),
        ChannelRole::NuclearStain => (None, None),
    };
    // a cancel that landed after the last row check still wins
    cancel.check()?;
    let path = io.store.save_filtered_volume(key, filtered.volume.view())?;
    Ok(JobStatus::Written {
        path,
        auto_thresh,
        scale,
        histogram,
    })
}

fn outcome(
    pipeline: &FilterPipeline,
    plan: &BatchPlan,
    io: BatchIo<'_>,
    opts: &BatchOptions,
    scale: &ResolvedScale,
    key: JobKey,
    cancel: &CancelToken,
) -> JobOutcome {
    let status = match run_job(pipeline, plan, io, opts, scale, key, cancel) {
        Ok(status) => status,
        Err(e) if e.is_cancelled() => JobStatus::Cancelled,
        Err(e) => {
            #[cfg(feature = "tracing")]
            warn!(%key, error = %e, "job failed");
            JobStatus::Failed {
                error: e.to_string(),
            }
        }
    };
    JobOutcome { key, status }
}

/// Use `fixed` when given; otherwise estimate from `refs`, but only when
/// some band-pass job in the group will actually run.
fn resolve_scale(
    pipeline: &FilterPipeline,
    io: BatchIo<'_>,
    fixed: Option<f32>,
    refs: &[JobKey],
    needed: bool,
    scale_norm: f32,
    cancel: &CancelToken,
) -> ResolvedScale {
    if let Some(scale) = fixed {
        return Some(Ok(scale));
    }
    if !needed || cancel.is_cancelled() {
        return None;
    }
    let estimated = estimate_scale(pipeline, io, refs, scale_norm, cancel)
        .map_err(|e| format!("estimating scale: {e}"));
    #[cfg(feature = "tracing")]
    match &estimated {
        Ok(scale) => info!(scale, ?refs, "estimated band-pass scale"),
        Err(error) => warn!(%error, ?refs, "scale estimation failed"),
    }
    Some(estimated)
}

/// Run every job of `plan`, returning one outcome per job in plan order.
///
/// A failing job does not stop the others. Once `cancel` fires, in-flight
/// jobs abandon their convolution and remaining jobs are reported as
/// cancelled; nothing partial is saved.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(tiles = plan.tiles.len(), rounds = plan.rounds.len()))
)]
pub fn run_batch(
    pipeline: &FilterPipeline,
    plan: &BatchPlan,
    io: BatchIo<'_>,
    opts: &BatchOptions,
    cancel: &CancelToken,
) -> BatchSummary {
    let jobs = plan.jobs();
    let needs_scale = |anchor: bool| {
        jobs.iter().any(|&k| {
            plan.is_anchor_round(k.round) == anchor
                && plan.role_of(k) == ChannelRole::BandPass
                && (opts.overwrite || !io.store.exists(k))
        })
    };
    let imaging = resolve_scale(
        pipeline,
        io,
        opts.scale,
        &plan.imaging_scale_refs(),
        needs_scale(false),
        opts.scale_norm,
        cancel,
    );
    let anchor = resolve_scale(
        pipeline,
        io,
        opts.scale_anchor,
        &plan.anchor_scale_refs(),
        needs_scale(true),
        opts.scale_norm,
        cancel,
    );
    let scale_for = |key: JobKey| {
        if plan.is_anchor_round(key.round) {
            &anchor
        } else {
            &imaging
        }
    };

    #[cfg(feature = "rayon")]
    let outcomes: Vec<JobOutcome> = jobs
        .par_iter()
        .map(|&key| outcome(pipeline, plan, io, opts, scale_for(key), key, cancel))
        .collect();
    #[cfg(not(feature = "rayon"))]
    let outcomes: Vec<JobOutcome> = jobs
        .iter()
        .map(|&key| outcome(pipeline, plan, io, opts, scale_for(key), key, cancel))
        .collect();

    let mut summary = BatchSummary::from_outcomes(outcomes);
    summary.scale = imaging.and_then(|s| s.ok());
    summary.scale_anchor = anchor.and_then(|s| s.ok());
    #[cfg(feature = "tracing")]
    info!(
        written = summary.written,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        failed = summary.failed,
        "batch finished"
    );
    summary
}
