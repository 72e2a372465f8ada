//! Convolution evaluated only at an explicit list of coordinates.

use ndarray::{Array3, ArrayView3};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::boundary::{check_coord, shape_of, PaddedVolume};
use crate::error::{FilterError, Result};
use crate::kernel::Kernel;
use crate::Coord;

/// Responses at each query point; `secondary` is present when a second
/// volume was convolved in the same pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointResponses {
    pub primary: Vec<i64>,
    pub secondary: Option<Vec<i64>>,
}

/// Kernel offsets per axis, from `+(e-1)/2` down to `-(e-1)/2`.
///
/// Walking kernel cells in index order while reading the volume at these
/// descending offsets flips the kernel, which is what makes this a
/// convolution rather than a correlation.
pub(crate) struct KernelOffsets {
    axes: [Vec<isize>; 3],
}

impl KernelOffsets {
    pub(crate) fn new(shape: [usize; 3]) -> Self {
        Self {
            axes: shape.map(descending_offsets),
        }
    }
}

/// `[h, h-1, ..., -h]` for an odd `extent = 2h + 1`.
pub fn descending_offsets(extent: usize) -> Vec<isize> {
    let h = (extent.saturating_sub(1) / 2) as isize;
    (0..extent).map(|i| h - i as isize).collect()
}

#[inline]
fn shift(base: usize, delta: isize) -> usize {
    base.wrapping_add_signed(delta)
}

/// Full-kernel response at `at`. The footprint must already be known to lie
/// inside `volume`.
#[inline]
pub(crate) fn accumulate<T: Copy + Into<i64>>(
    volume: &ArrayView3<'_, T>,
    weights: &Array3<i32>,
    offsets: &KernelOffsets,
    at: Coord,
) -> i64 {
    let mut acc = 0i64;
    for (i, &oy) in offsets.axes[0].iter().enumerate() {
        let y = shift(at[0], oy);
        for (j, &ox) in offsets.axes[1].iter().enumerate() {
            let x = shift(at[1], ox);
            for (k, &oz) in offsets.axes[2].iter().enumerate() {
                let z = shift(at[2], oz);
                acc += volume[[y, x, z]].into() * i64::from(weights[[i, j, k]]);
            }
        }
    }
    acc
}

#[inline]
fn accumulate_pair<T: Copy + Into<i64>>(
    first: &ArrayView3<'_, T>,
    second: &ArrayView3<'_, T>,
    weights: &Array3<i32>,
    offsets: &KernelOffsets,
    at: Coord,
) -> (i64, i64) {
    let (mut acc_a, mut acc_b) = (0i64, 0i64);
    for (i, &oy) in offsets.axes[0].iter().enumerate() {
        let y = shift(at[0], oy);
        for (j, &ox) in offsets.axes[1].iter().enumerate() {
            let x = shift(at[1], ox);
            for (k, &oz) in offsets.axes[2].iter().enumerate() {
                let z = shift(at[2], oz);
                let w = i64::from(weights[[i, j, k]]);
                acc_a += first[[y, x, z]].into() * w;
                acc_b += second[[y, x, z]].into() * w;
            }
        }
    }
    (acc_a, acc_b)
}

fn map_points<R, F>(coords: &[Coord], f: F) -> Vec<R>
where
    R: Send,
    F: Fn(Coord) -> R + Sync + Send,
{
    #[cfg(feature = "rayon")]
    {
        coords.par_iter().map(|&c| f(c)).collect()
    }
    #[cfg(not(feature = "rayon"))]
    {
        coords.iter().map(|&c| f(c)).collect()
    }
}

/// Evaluate `volume * kernel` at each coordinate of `coords`.
///
/// Coordinates are in the padded volume's index space. Every coordinate is
/// checked before any accumulation: a footprint that would leave the volume
/// is a [`FilterError::Bounds`], never a clamped or wrapped read. When
/// `second` is given it must have the same shape as `volume`; both are
/// accumulated against the same kernel cell in one loop.
///
/// Accumulators are `i64`. With `u16` samples, weights below `2^15` and
/// kernels below `2^24` cells the worst case stays under `2^55`. Integer
/// addition is associative, so the result does not depend on how points are
/// split across workers.
#[cfg_attr(
    feature = "tracing",
    instrument(
        level = "debug",
        skip_all,
        fields(points = coords.len(), kernel = ?kernel.shape(), dual = second.is_some())
    )
)]
pub fn convolve_at_points<T>(
    volume: ArrayView3<'_, T>,
    kernel: &Kernel,
    coords: &[Coord],
    second: Option<ArrayView3<'_, T>>,
) -> Result<PointResponses>
where
    T: Copy + Into<i64> + Sync,
{
    let shape = shape_of(&volume);
    if let Some(other) = &second {
        let other_shape = shape_of(other);
        if other_shape != shape {
            return Err(FilterError::Shape(format!(
                "second volume {other_shape:?} does not match {shape:?}"
            )));
        }
    }
    let half = kernel.half_extent();
    for &c in coords {
        check_coord(shape, c, half)?;
    }

    let offsets = KernelOffsets::new(kernel.shape());
    let weights = kernel.weights();

    match second {
        None => {
            let primary = map_points(coords, |c| accumulate(&volume, weights, &offsets, c));
            Ok(PointResponses {
                primary,
                secondary: None,
            })
        }
        Some(other) => {
            let pairs = map_points(coords, |c| {
                accumulate_pair(&volume, &other, weights, &offsets, c)
            });
            let (primary, secondary): (Vec<i64>, Vec<i64>) = pairs.into_iter().unzip();
            Ok(PointResponses {
                primary,
                secondary: Some(secondary),
            })
        }
    }
}

/// [`convolve_at_points`] over a [`PaddedVolume`], with `coords` given in the
/// unpadded region.
///
/// The padding is re-validated against `kernel` before any point is read, so
/// a volume padded for a smaller kernel is a [`FilterError::Padding`]. A
/// coordinate outside the unpadded region is a [`FilterError::Bounds`] in
/// unpadded coordinates. `second` must share the padding of `volume`.
pub fn convolve_padded<T>(
    volume: &PaddedVolume<'_, T>,
    kernel: &Kernel,
    coords: &[Coord],
    second: Option<&PaddedVolume<'_, T>>,
) -> Result<PointResponses>
where
    T: Copy + Into<i64> + Sync,
{
    volume.check_kernel(kernel)?;
    if let Some(other) = second {
        if other.padding() != volume.padding() {
            return Err(FilterError::Shape(format!(
                "second volume padding {:?} does not match {:?}",
                other.padding(),
                volume.padding()
            )));
        }
    }
    let padded_coords = volume.to_padded_all(coords)?;
    convolve_at_points(
        volume.view(),
        kernel,
        &padded_coords,
        second.map(PaddedVolume::view),
    )
}
