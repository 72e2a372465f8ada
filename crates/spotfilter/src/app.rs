//! Application-level helpers shared by the CLI and integration tests.
//!
//! These functions wire the JSON configuration, the PNG plane loader and the
//! binary store around [`run_batch`] so every front-end behaves the same.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spotfilter_core::{default_r2, resolve_radius_pixels, CancelToken, FilterConfig};

use crate::batch::{check_scale_norm, run_batch, BatchIo, BatchOptions, BatchPlan, BatchSummary};
use crate::image::PngPlaneLoader;
use crate::io::BinVolumeStore;
use crate::pipeline::{FilterPipeline, MaxIntensityProjection};

/// Physical inner radius used when neither `r1` nor `r1_auto_microns` is set.
pub const DEFAULT_R1_MICRONS: f64 = 0.5;
/// Physical top-hat radius used when neither `r_dapi` nor
/// `r_dapi_auto_microns` is set and a nuclear-stain channel is configured.
pub const DEFAULT_R_DAPI_MICRONS: f64 = 2.0;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExtractConfig {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub tiles: Option<Vec<usize>>,
    pub rounds: Option<Vec<usize>>,
    pub channels: Option<Vec<usize>>,
    pub n_z: Option<usize>,
    pub dapi_channel: Option<usize>,
    pub anchor_channel: Option<usize>,
    pub anchor_round: Option<usize>,
    pub pixel_size_xy: Option<f64>,
    pub r1: Option<usize>,
    pub r1_auto_microns: Option<f64>,
    pub r2: Option<usize>,
    pub r_smooth: Option<[usize; 3]>,
    pub r_dapi: Option<usize>,
    pub r_dapi_auto_microns: Option<f64>,
    pub is_3d: Option<bool>,
    /// Band-pass scale for imaging rounds; estimated from the data when unset.
    pub scale: Option<f32>,
    /// Band-pass scale for the anchor round; estimated when unset.
    pub scale_anchor: Option<f32>,
    /// Peak value an estimated scale maps the reference volume to.
    pub scale_norm: Option<f32>,
    pub auto_thresh_multiplier: Option<f32>,
    pub overwrite: Option<bool>,
    pub summary_json: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ExtractConfig {
    /// Resolve every radius to pixels and validate the result.
    ///
    /// `r1` comes from `r1_auto_microns / pixel_size_xy` when unset, `r2`
    /// defaults to `2 * r1`, and `r_dapi` is resolved the same way as `r1`
    /// but only when a nuclear-stain channel is configured.
    pub fn resolve(&self) -> Result<FilterConfig> {
        let pixel_size = self.pixel_size_xy.unwrap_or(1.0);
        let r1 = resolve_radius_pixels(
            self.r1,
            Some(self.r1_auto_microns.unwrap_or(DEFAULT_R1_MICRONS)),
            pixel_size,
        )
        .context("resolving r1")?;
        let r2 = self.r2.unwrap_or_else(|| default_r2(r1));

        let mut cfg = FilterConfig::new(r1, Some(r2))
            .context("band-pass radii")?
            .with_3d(self.is_3d.unwrap_or(false))
            .with_scale(self.scale.unwrap_or(1.0));
        if let Some(r_smooth) = self.r_smooth {
            cfg = cfg.with_smoothing(r_smooth);
        }
        if self.dapi_channel.is_some() || self.r_dapi.is_some() {
            let r_dapi = resolve_radius_pixels(
                self.r_dapi,
                Some(self.r_dapi_auto_microns.unwrap_or(DEFAULT_R_DAPI_MICRONS)),
                pixel_size,
            )
            .context("resolving r_dapi")?;
            cfg = cfg.with_dapi_radius(r_dapi);
        }
        cfg.validate().context("filter configuration")?;
        if self.scale.is_none() || self.scale_anchor.is_none() {
            check_scale_norm(self.options().scale_norm).context("scale estimation")?;
        }
        Ok(cfg)
    }

    pub fn plan(&self) -> BatchPlan {
        BatchPlan {
            tiles: self.tiles.clone().unwrap_or_else(|| vec![0]),
            rounds: self.rounds.clone().unwrap_or_else(|| vec![0]),
            channels: self.channels.clone().unwrap_or_else(|| vec![0]),
            anchor_round: self.anchor_round,
            anchor_channel: self.anchor_channel,
            dapi_channel: self.dapi_channel,
        }
    }

    pub fn options(&self) -> BatchOptions {
        let defaults = BatchOptions::default();
        BatchOptions {
            overwrite: self.overwrite.unwrap_or(defaults.overwrite),
            auto_thresh_multiplier: self
                .auto_thresh_multiplier
                .unwrap_or(defaults.auto_thresh_multiplier),
            scale: self.scale,
            scale_anchor: self.scale_anchor,
            scale_norm: self.scale_norm.unwrap_or(defaults.scale_norm),
        }
    }
}

/// Load raw planes from `input_dir`, filter every job and write results to
/// `output_dir`. Writes the summary JSON when `summary_json` is set.
pub fn run_extract(cfg: &ExtractConfig, cancel: &CancelToken) -> Result<BatchSummary> {
    let input_dir = cfg
        .input_dir
        .as_deref()
        .context("input_dir is not configured")?;
    let output_dir = cfg
        .output_dir
        .as_deref()
        .context("output_dir is not configured")?;

    let filter = cfg.resolve()?;
    let pipeline = FilterPipeline::new(filter).context("building kernels")?;
    let loader = PngPlaneLoader::new(input_dir, cfg.n_z.unwrap_or(1));
    let store = BinVolumeStore::new(output_dir);
    let io = BatchIo {
        loader: &loader,
        store: &store,
        stacker: &MaxIntensityProjection,
    };

    let summary = run_batch(&pipeline, &cfg.plan(), io, &cfg.options(), cancel);
    if let Some(path) = &cfg.summary_json {
        write_json(path, &summary)?;
    }
    Ok(summary)
}

/// Pretty-print `value` to `path`, creating missing parent directories so a
/// summary can land next to a fresh output tree.
pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

/// Parse an [`ExtractConfig`]. Relative `input_dir`, `output_dir` and
/// `summary_json` are taken relative to the config file's directory.
pub fn load_config(path: &Path) -> Result<ExtractConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let mut cfg: ExtractConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    if let Some(base) = path.parent() {
        for dir in [&mut cfg.input_dir, &mut cfg.output_dir, &mut cfg.summary_json]
            .into_iter()
            .flatten()
        {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
    Ok(cfg)
}
