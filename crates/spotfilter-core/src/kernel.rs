//! Band-pass and top-hat kernel construction.
//!
//! The band-pass kernel is a difference of two concentric Hann windows
//! (positive inner radius `r1`, negative outer radius `r2`). It is designed
//! as a 1-D profile and then expanded into a rotationally symmetric 2-D or
//! 3-D kernel by evaluating the profile at each cell's distance from the
//! centre.
//!
//! Weights are stored as integers scaled by [`PROFILE_SCALE`]. Rounding is
//! half away from zero and the integer residual is folded into the centre
//! cell, so both the 1-D profile and every expanded kernel sum to exactly 0.

use std::f64::consts::PI;

use ndarray::{s, Array3, Axis};
#[cfg(feature = "tracing")]
use tracing::{instrument, warn};

use crate::boundary::{required_padding, shape_of};
use crate::error::{FilterError, Result};

/// Fixed-point scale applied to the real-valued kernel design.
pub const PROFILE_SCALE: f64 = 4096.0;

/// Immutable N-D kernel with odd extent on every axis.
///
/// Axes are `(y, x, z)`; 2-D kernels have z extent 1. `scale` records the
/// factor the real-valued design was multiplied by before rounding, so a
/// dense response divided by `scale` is back in sample units.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    weights: Array3<i32>,
    scale: f64,
}

impl Kernel {
    /// Wrap a weight array. Every axis extent must be odd and non-zero.
    pub fn new(weights: Array3<i32>, scale: f64) -> Result<Self> {
        let shape = shape_of(&weights);
        if shape.contains(&0) {
            return Err(FilterError::Config(format!(
                "kernel extent {shape:?} has an empty axis"
            )));
        }
        if shape.iter().any(|e| e % 2 == 0) {
            return Err(FilterError::Config(format!(
                "kernel extent {shape:?} must be odd on every axis"
            )));
        }
        if !(scale.is_finite() && scale > 0.0) {
            return Err(FilterError::Config(format!(
                "kernel scale must be positive, got {scale}"
            )));
        }
        Ok(Self { weights, scale })
    }

    /// Like [`Kernel::new`], but pads even axes with a leading row of zeros
    /// instead of failing. The correction is logged as a warning.
    pub fn new_padded_odd(weights: Array3<i32>, scale: f64) -> Result<Self> {
        let shape = shape_of(&weights);
        let odd = ensure_odd(shape)?;
        if odd == shape {
            return Self::new(weights, scale);
        }
        let mut padded = Array3::<i32>::zeros((odd[0], odd[1], odd[2]));
        padded
            .slice_mut(s![odd[0] - shape[0].., odd[1] - shape[1].., odd[2] - shape[2]..])
            .assign(&weights);
        Self::new(padded, scale)
    }

    #[inline]
    pub fn weights(&self) -> &Array3<i32> {
        &self.weights
    }

    #[inline]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        shape_of(&self.weights)
    }

    /// Per-axis half extent, `(extent - 1) / 2`.
    #[inline]
    pub fn half_extent(&self) -> [usize; 3] {
        required_padding(self.shape())
    }

    /// Number of cells.
    #[inline]
    pub fn volume(&self) -> usize {
        self.weights.len()
    }

    pub fn sum(&self) -> i64 {
        self.weights.iter().map(|&w| i64::from(w)).sum()
    }

    /// True when every weight is 0 or 1.
    pub fn is_binary(&self) -> bool {
        self.weights.iter().all(|&w| w == 0 || w == 1)
    }

    /// The kernel mirrored through its centre on every axis.
    ///
    /// Convolving with the flipped kernel is correlation with the original.
    pub fn flipped(&self) -> Self {
        let mut weights = self.weights.clone();
        for axis in 0..3 {
            weights.invert_axis(Axis(axis));
        }
        Self {
            weights: weights.as_standard_layout().into_owned(),
            scale: self.scale,
        }
    }
}

/// 1-D difference-of-Hann profile of length `2 * r2 + 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct RadialProfile {
    r1: usize,
    r2: usize,
    values: Vec<f64>,
    taps: Vec<i32>,
}

impl RadialProfile {
    #[inline]
    pub fn r1(&self) -> usize {
        self.r1
    }

    #[inline]
    pub fn r2(&self) -> usize {
        self.r2
    }

    /// Real-valued design before quantisation.
    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Quantised taps, scaled by [`PROFILE_SCALE`].
    #[inline]
    pub fn taps(&self) -> &[i32] {
        &self.taps
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.taps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub fn sum(&self) -> i64 {
        self.taps.iter().map(|&t| i64::from(t)).sum()
    }

    /// Real-valued profile at radial distance `d`, linearly interpolated
    /// between taps and 0 beyond `r2`.
    pub fn value_at(&self, d: f64) -> f64 {
        let r2 = self.r2 as f64;
        if d < 0.0 || d > r2 + 1e-9 {
            return 0.0;
        }
        let pos = (r2 + d).min(2.0 * r2);
        let i = pos.floor() as usize;
        let frac = pos - i as f64;
        match self.values.get(i + 1) {
            Some(&next) => self.values[i] * (1.0 - frac) + next * frac,
            None => self.values[i],
        }
    }
}

/// `np.hanning(2r + 3)` with its two zero end taps removed.
fn hann_window(radius: usize) -> Vec<f64> {
    let n = 2 * radius + 3;
    let denom = (n - 1) as f64;
    (1..n - 1)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / denom).cos())
        .collect()
}

fn quantise_zero_sum(values: &[f64], centre: usize) -> Vec<i32> {
    let mut taps: Vec<i32> = values
        .iter()
        .map(|v| (v * PROFILE_SCALE).round() as i32)
        .collect();
    let residual: i64 = taps.iter().map(|&t| i64::from(t)).sum();
    taps[centre] -= residual as i32;
    taps
}

/// Build the 1-D band-pass profile for inner radius `r1` and outer radius `r2`.
///
/// Fails with [`FilterError::Config`] if either radius is 0 or `r2 < r1`.
pub fn build_radial_profile(r1: usize, r2: usize) -> Result<RadialProfile> {
    if r1 == 0 || r2 == 0 {
        return Err(FilterError::Config(format!(
            "band-pass radii must be positive, got r1={r1} r2={r2}"
        )));
    }
    if r2 < r1 {
        return Err(FilterError::Config(format!(
            "outer radius r2={r2} is smaller than inner radius r1={r1}"
        )));
    }

    let outer = hann_window(r2);
    let outer_sum: f64 = outer.iter().sum();
    let inner = hann_window(r1);
    let inner_sum: f64 = inner.iter().sum();

    let mut values: Vec<f64> = outer.iter().map(|v| -v / outer_sum).collect();
    for (i, v) in inner.iter().enumerate() {
        values[r2 - r1 + i] += v / inner_sum;
    }
    let taps = quantise_zero_sum(&values, r2);

    Ok(RadialProfile {
        r1,
        r2,
        values,
        taps,
    })
}

/// Validate a requested kernel extent.
///
/// A zero extent is a [`FilterError::Config`]. Even extents are rounded up
/// to the next odd value and a warning is logged; callers are expected to
/// size radii so this never happens.
pub fn ensure_odd(extent: [usize; 3]) -> Result<[usize; 3]> {
    if extent.contains(&0) {
        return Err(FilterError::Config(format!(
            "kernel extent {extent:?} has an empty axis"
        )));
    }
    let odd = extent.map(|e| e | 1);
    #[cfg(feature = "tracing")]
    if odd != extent {
        warn!(?extent, corrected = ?odd, "even kernel extent rounded up to odd");
    }
    Ok(odd)
}

/// Expand a 1-D profile into a rotationally symmetric kernel.
///
/// `ndims` is 2 (extent `(2r2+1, 2r2+1, 1)`) or 3 (a cube). After
/// evaluation the negative lobe is rescaled to balance the positive lobe,
/// then weights are quantised and the residual folded into the centre.
#[cfg_attr(feature = "tracing", instrument(level = "debug", skip(profile), fields(r1 = profile.r1(), r2 = profile.r2())))]
pub fn expand_to_nd(profile: &RadialProfile, ndims: usize) -> Result<Kernel> {
    let r = profile.r2();
    let extent = match ndims {
        2 => [2 * r + 1, 2 * r + 1, 1],
        3 => [2 * r + 1; 3],
        other => {
            return Err(FilterError::Shape(format!(
                "kernels are 2-D or 3-D, got {other} dimensions"
            )))
        }
    };
    let extent = ensure_odd(extent)?;
    let centre = required_padding(extent);

    let mut design = Array3::<f64>::zeros((extent[0], extent[1], extent[2]));
    for ((y, x, z), v) in design.indexed_iter_mut() {
        let dy = y as f64 - centre[0] as f64;
        let dx = x as f64 - centre[1] as f64;
        let dz = z as f64 - centre[2] as f64;
        *v = profile.value_at((dy * dy + dx * dx + dz * dz).sqrt());
    }
    balance_lobes(&mut design);

    let mut weights = design.mapv(|v| (v * PROFILE_SCALE).round() as i32);
    let residual: i64 = weights.iter().map(|&w| i64::from(w)).sum();
    weights[[centre[0], centre[1], centre[2]]] -= residual as i32;

    Kernel::new(weights, PROFILE_SCALE)
}

fn balance_lobes(design: &mut Array3<f64>) {
    let positive: f64 = design.iter().filter(|v| **v > 0.0).sum();
    let negative: f64 = -design.iter().filter(|v| **v < 0.0).sum::<f64>();
    if positive > 0.0 && negative > 0.0 {
        let gain = positive / negative;
        design.mapv_inplace(|v| if v < 0.0 { v * gain } else { v });
    }
}

/// Band-pass kernel for `r1`/`r2`, 2-D or 3-D.
pub fn build_bandpass(r1: usize, r2: usize, is_3d: bool) -> Result<Kernel> {
    let profile = build_radial_profile(r1, r2)?;
    expand_to_nd(&profile, if is_3d { 3 } else { 2 })
}

/// Flat disk footprint `y^2 + x^2 <= r^2` with extent `(2r+1, 2r+1, 1)`.
pub fn build_tophat(radius: usize) -> Result<Kernel> {
    if radius == 0 {
        return Err(FilterError::Config("top-hat radius must be positive".into()));
    }
    let n = 2 * radius + 1;
    let r = radius as i64;
    let weights = Array3::from_shape_fn((n, n, 1), |(y, x, _)| {
        let dy = y as i64 - r;
        let dx = x as i64 - r;
        i32::from(dy * dy + dx * dx <= r * r)
    });
    Kernel::new(weights, 1.0)
}
