//! Per-channel dense filter stages: `Raw -> Convolved -> Smoothed`.
//!
//! Each stage is derived from the raw volume and a [`FilterConfig`] only, so
//! a viewer can re-derive any stage with new parameters through
//! [`recompute`] without touching the rest of the batch.

use std::collections::BTreeMap;

use ndarray::{Array3, ArrayView3, Axis};
use serde::Serialize;
use spotfilter_core::{
    build_bandpass, build_tophat, convolve_dense, smooth_mean, white_tophat, CancelToken,
    FilterConfig, FilterError, Kernel,
};
#[cfg(feature = "tracing")]
use tracing::{debug, debug_span, instrument};

use crate::error::Result;

/// Dense pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Raw,
    Convolved,
    Smoothed,
}

/// Which kernel a channel is filtered with. The two are mutually exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Point-like spots: difference-of-Hann band-pass.
    BandPass,
    /// Nuclear stain: white top-hat with a disk of radius `r_dapi`.
    NuclearStain,
}

/// Collapses a `(y, x, z)` stack to a single `(y, x, 1)` plane.
pub trait FocusStacker: Sync {
    fn stack(&self, volume: ArrayView3<'_, u16>) -> Array3<u16>;
}

/// Per-pixel maximum over z.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaxIntensityProjection;

impl FocusStacker for MaxIntensityProjection {
    fn stack(&self, volume: ArrayView3<'_, u16>) -> Array3<u16> {
        volume
            .fold_axis(Axis(2), 0u16, |acc, &v| (*acc).max(v))
            .insert_axis(Axis(2))
    }
}

/// Output of one stage together with the sensor columns zeroed in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filtered {
    pub volume: Array3<i32>,
    pub bad_columns: Vec<usize>,
}

/// Kernels built once from a [`FilterConfig`] and reused for every job.
#[derive(Clone, Debug)]
pub struct FilterPipeline {
    config: FilterConfig,
    bandpass: Kernel,
    tophat: Option<Kernel>,
}

impl FilterPipeline {
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        let bandpass = build_bandpass(config.r1, config.r2, config.is_3d)?;
        let tophat = config.r_dapi.map(build_tophat).transpose()?;
        Ok(Self {
            config,
            bandpass,
            tophat,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn bandpass(&self) -> &Kernel {
        &self.bandpass
    }

    pub fn tophat(&self) -> Option<&Kernel> {
        self.tophat.as_ref()
    }

    /// Last stage a channel goes through in a batch run.
    pub fn terminal_stage(&self, role: ChannelRole) -> Stage {
        match role {
            ChannelRole::NuclearStain => Stage::Convolved,
            ChannelRole::BandPass if self.config.smoothing_requested() => Stage::Smoothed,
            ChannelRole::BandPass => Stage::Convolved,
        }
    }

    /// Derive `stage` from `raw` with the configured scale.
    ///
    /// `Raw` returns the raw volume widened to `i32`. `Convolved` focus-stacks
    /// first unless the config is 3-D, filters with the kernel selected by
    /// `role`, scales band-pass output and zeroes bad sensor columns.
    /// `Smoothed` additionally applies the mean filter; asking for it with
    /// non-unit smoothing on a nuclear-stain channel is a config error.
    pub fn run(
        &self,
        stage: Stage,
        raw: ArrayView3<'_, u16>,
        role: ChannelRole,
        stacker: &dyn FocusStacker,
        cancel: &CancelToken,
    ) -> Result<Array3<i32>> {
        self.run_scaled(stage, raw, role, stacker, self.config.scale, cancel)
            .map(|f| f.volume)
    }

    /// [`run`](Self::run) with an explicit band-pass `scale`, also reporting
    /// the columns that were zeroed.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, raw, stacker, cancel), fields(shape = ?raw.dim()))
    )]
    pub fn run_scaled(
        &self,
        stage: Stage,
        raw: ArrayView3<'_, u16>,
        role: ChannelRole,
        stacker: &dyn FocusStacker,
        scale: f32,
        cancel: &CancelToken,
    ) -> Result<Filtered> {
        match stage {
            Stage::Raw => Ok(Filtered {
                volume: raw.mapv(i32::from),
                bad_columns: Vec::new(),
            }),
            Stage::Convolved => self.convolved(raw, role, stacker, scale, cancel),
            Stage::Smoothed => {
                if role == ChannelRole::NuclearStain && self.config.smoothing_requested() {
                    return Err(FilterError::Config(
                        "smoothing is not applied to the nuclear-stain channel".into(),
                    )
                    .into());
                }
                let convolved = self.convolved(raw, role, stacker, scale, cancel)?;
                if !self.config.smoothing_requested() {
                    return Ok(convolved);
                }
                #[cfg(feature = "tracing")]
                let _span = debug_span!("smooth", radius = ?self.config.r_smooth).entered();
                let smoothed = smooth_mean(convolved.volume.view(), self.config.r_smooth, cancel)?;
                Ok(Filtered {
                    volume: smoothed.mapv(saturate_i64),
                    bad_columns: convolved.bad_columns,
                })
            }
        }
    }

    fn convolved(
        &self,
        raw: ArrayView3<'_, u16>,
        role: ChannelRole,
        stacker: &dyn FocusStacker,
        scale: f32,
        cancel: &CancelToken,
    ) -> Result<Filtered> {
        let stacked;
        let plane = if self.config.is_3d {
            raw.view()
        } else {
            stacked = stacker.stack(raw);
            stacked.view()
        };
        let bad_columns = find_bad_columns(plane);
        #[cfg(feature = "tracing")]
        if !bad_columns.is_empty() {
            debug!(?bad_columns, "zeroing constant sensor columns");
        }

        let mut volume = match role {
            ChannelRole::BandPass => {
                #[cfg(feature = "tracing")]
                let _span = debug_span!("bandpass", r1 = self.config.r1, r2 = self.config.r2).entered();
                let response = convolve_dense(plane, &self.bandpass, cancel)?;
                let gain = f64::from(scale) / self.bandpass.scale();
                response.mapv(|v| saturate_f64(v as f64 * gain))
            }
            ChannelRole::NuclearStain => {
                let footprint = self.tophat.as_ref().ok_or_else(|| {
                    FilterError::Config("nuclear-stain channel needs r_dapi".into())
                })?;
                #[cfg(feature = "tracing")]
                let _span = debug_span!("tophat", r_dapi = ?self.config.r_dapi).entered();
                white_tophat(plane, footprint, cancel)?.mapv(saturate_i64)
            }
        };
        zero_columns(&mut volume, &bad_columns);
        Ok(Filtered {
            volume,
            bad_columns,
        })
    }
}

/// Build a [`FilterPipeline`] for `params` and derive `stage` from `raw`.
///
/// Holds no state between calls, so an interactive caller can invoke it
/// repeatedly with different parameters.
pub fn recompute(
    stage: Stage,
    params: &FilterConfig,
    raw: ArrayView3<'_, u16>,
    role: ChannelRole,
    stacker: &dyn FocusStacker,
) -> Result<Array3<i32>> {
    FilterPipeline::new(params.clone())?.run(stage, raw, role, stacker, &CancelToken::new())
}

/// Columns (fixed x) whose value is constant along y in every z plane.
///
/// These come from faulty sensor columns and are zeroed after filtering.
pub fn find_bad_columns(volume: ArrayView3<'_, u16>) -> Vec<usize> {
    let (ny, nx, nz) = volume.dim();
    if ny < 2 {
        return Vec::new();
    }
    (0..nx)
        .filter(|&x| {
            (0..nz).all(|z| {
                let first = volume[[0, x, z]];
                (1..ny).all(|y| volume[[y, x, z]] == first)
            })
        })
        .collect()
}

pub fn zero_columns(volume: &mut Array3<i32>, columns: &[usize]) {
    for &x in columns {
        volume.index_axis_mut(Axis(1), x).fill(0);
    }
}

/// `median(|v|)` over the middle z plane times `multiplier`.
pub fn auto_threshold(filtered: ArrayView3<'_, i32>, multiplier: f32) -> f32 {
    let (_, _, nz) = filtered.dim();
    if filtered.is_empty() {
        return 0.0;
    }
    let mut mags: Vec<u32> = filtered
        .index_axis(Axis(2), nz / 2)
        .iter()
        .map(|v| v.unsigned_abs())
        .collect();
    mags.sort_unstable();
    let n = mags.len();
    let median = if n % 2 == 1 {
        f64::from(mags[n / 2])
    } else {
        (f64::from(mags[n / 2 - 1]) + f64::from(mags[n / 2])) / 2.0
    };
    (median * f64::from(multiplier)) as f32
}

/// Offset added to filtered values when they are stored as `u16` tiles, so
/// the representable range is `[-PIXEL_VALUE_SHIFT, u16::MAX - PIXEL_VALUE_SHIFT]`.
pub const PIXEL_VALUE_SHIFT: i32 = 15_000;

/// Counts of filtered values over the `u16`-representable range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValueHistogram {
    /// Non-empty bins keyed by value.
    pub counts: BTreeMap<i32, u64>,
    /// Values outside the representable range.
    pub clipped: u64,
}

impl ValueHistogram {
    pub fn total(&self) -> u64 {
        self.counts.values().sum::<u64>() + self.clipped
    }
}

/// Histogram of `filtered`, leaving out the zeroed `bad_columns`.
pub fn value_histogram(filtered: ArrayView3<'_, i32>, bad_columns: &[usize]) -> ValueHistogram {
    let lo = -PIXEL_VALUE_SHIFT;
    let hi = i32::from(u16::MAX) - PIXEL_VALUE_SHIFT;
    let mut hist = ValueHistogram::default();
    for ((_, x, _), &v) in filtered.indexed_iter() {
        if bad_columns.contains(&x) {
            continue;
        }
        if (lo..=hi).contains(&v) {
            *hist.counts.entry(v).or_insert(0) += 1;
        } else {
            hist.clipped += 1;
        }
    }
    hist
}

#[inline]
fn saturate_f64(v: f64) -> i32 {
    // `as` saturates at the i32 range and maps NaN to 0
    v.round() as i32
}

#[inline]
fn saturate_i64(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
