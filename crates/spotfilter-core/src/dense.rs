//! Whole-volume primitives used by the dense filter stages.
//!
//! Every routine here pads its input by replicating border voxels, so the
//! output has the input's shape. Output rows (the y axis) are the unit of
//! work: they are distributed across rayon workers when the `rayon` feature
//! is enabled, and the [`CancelToken`] is polled once per row.
//!
//! - [`convolve_dense`] – full convolution with a [`Kernel`].
//! - [`white_tophat`] – `volume - opening(volume)` with a flat footprint.
//! - [`smooth_mean`] – separable box mean with extent `2r - 1` per axis.

use ndarray::{Array3, ArrayView3, ArrayViewMut2, Axis};
#[cfg(feature = "rayon")]
use ndarray::parallel::prelude::*;
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::boundary::{pad_replicate, shape_of, PaddedVolume};
use crate::cancel::CancelToken;
use crate::error::{FilterError, Result};
use crate::kernel::Kernel;
use crate::sparse::{accumulate, KernelOffsets};

fn fill_rows<V, F>(out: &mut Array3<V>, cancel: &CancelToken, fill: F) -> Result<()>
where
    V: Send + Sync,
    F: Fn(usize, ArrayViewMut2<'_, V>) + Sync + Send,
{
    #[cfg(feature = "rayon")]
    {
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .try_for_each(|(y, row)| {
                cancel.check()?;
                fill(y, row);
                Ok(())
            })
    }
    #[cfg(not(feature = "rayon"))]
    {
        for (y, row) in out.axis_iter_mut(Axis(0)).enumerate() {
            cancel.check()?;
            fill(y, row);
        }
        Ok(())
    }
}

/// Convolve `volume` with `kernel` at every voxel.
///
/// Equivalent to padding by the kernel's half extent with replicated borders
/// and calling [`convolve_at_points`](crate::sparse::convolve_at_points) at
/// every interior coordinate.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip_all, fields(shape = ?shape_of(&volume), kernel = ?kernel.shape()))
)]
pub fn convolve_dense<T>(
    volume: ArrayView3<'_, T>,
    kernel: &Kernel,
    cancel: &CancelToken,
) -> Result<Array3<i64>>
where
    T: Copy + Into<i64> + Send + Sync,
{
    let [ny, nx, nz] = shape_of(&volume);
    let half = kernel.half_extent();
    let padded = pad_replicate(volume, half)?;
    let padded = PaddedVolume::new(padded.view(), half, kernel)?.view();
    let offsets = KernelOffsets::new(kernel.shape());
    let weights = kernel.weights();

    let mut out = Array3::<i64>::zeros((ny, nx, nz));
    fill_rows(&mut out, cancel, |y, mut row| {
        for ((x, z), v) in row.indexed_iter_mut() {
            *v = accumulate(
                &padded,
                weights,
                &offsets,
                [y + half[0], x + half[1], z + half[2]],
            );
        }
    })?;
    Ok(out)
}

/// Offsets of the non-zero cells of a flat footprint, relative to its centre.
fn footprint_offsets(footprint: &Kernel) -> Vec<[isize; 3]> {
    let half = footprint.half_extent().map(|h| h as isize);
    footprint
        .weights()
        .indexed_iter()
        .filter(|(_, &w)| w != 0)
        .map(|((y, x, z), _)| {
            [
                y as isize - half[0],
                x as isize - half[1],
                z as isize - half[2],
            ]
        })
        .collect()
}

/// Min (erosion) or max (dilation) of `volume` over `offsets` at each voxel.
fn flat_extreme(
    volume: ArrayView3<'_, i64>,
    offsets: &[[isize; 3]],
    half: [usize; 3],
    take_max: bool,
    cancel: &CancelToken,
) -> Result<Array3<i64>> {
    let [ny, nx, nz] = shape_of(&volume);
    let padded = pad_replicate(volume, half)?;
    let mut out = Array3::<i64>::zeros((ny, nx, nz));
    fill_rows(&mut out, cancel, |y, mut row| {
        for ((x, z), v) in row.indexed_iter_mut() {
            let centre = [y + half[0], x + half[1], z + half[2]];
            let samples = offsets.iter().map(|o| {
                padded[[
                    centre[0].wrapping_add_signed(o[0]),
                    centre[1].wrapping_add_signed(o[1]),
                    centre[2].wrapping_add_signed(o[2]),
                ]]
            });
            let extreme = if take_max { samples.max() } else { samples.min() };
            if let Some(e) = extreme {
                *v = e;
            }
        }
    })?;
    Ok(out)
}

/// White top-hat: `volume - dilate(erode(volume))` with a flat footprint.
///
/// `footprint` must be binary and non-empty. Bright structures smaller than
/// the footprint survive; the smooth background is removed. The result is
/// never negative.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip_all, fields(shape = ?shape_of(&volume), footprint = ?footprint.shape()))
)]
pub fn white_tophat<T>(
    volume: ArrayView3<'_, T>,
    footprint: &Kernel,
    cancel: &CancelToken,
) -> Result<Array3<i64>>
where
    T: Copy + Into<i64>,
{
    if !footprint.is_binary() {
        return Err(FilterError::Config(
            "morphological footprint must contain only 0 and 1".into(),
        ));
    }
    let offsets = footprint_offsets(footprint);
    if offsets.is_empty() {
        return Err(FilterError::Config("morphological footprint is empty".into()));
    }
    let reflected: Vec<[isize; 3]> = offsets.iter().map(|o| o.map(|d| -d)).collect();
    let half = footprint.half_extent();

    let wide: Array3<i64> = volume.mapv(|v| v.into());
    let eroded = flat_extreme(wide.view(), &offsets, half, false, cancel)?;
    let opened = flat_extreme(eroded.view(), &reflected, half, true, cancel)?;
    Ok(wide - opened)
}

/// Box mean with extent `2 * r - 1` along each axis, rounded to the nearest
/// integer. `[1, 1, 1]` returns the input unchanged.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip_all, fields(shape = ?shape_of(&volume), radius = ?radius))
)]
pub fn smooth_mean<T>(
    volume: ArrayView3<'_, T>,
    radius: [usize; 3],
    cancel: &CancelToken,
) -> Result<Array3<i64>>
where
    T: Copy + Into<i64>,
{
    if radius.contains(&0) {
        return Err(FilterError::Config(format!(
            "smoothing radii must be positive, got {radius:?}"
        )));
    }
    let shape = shape_of(&volume);
    if shape.contains(&0) {
        return Err(FilterError::Shape(format!(
            "cannot smooth empty volume {shape:?}"
        )));
    }

    let mut sums = volume.mapv(|v| Into::<i64>::into(v) as f64);
    for (axis, &r) in radius.iter().enumerate() {
        if r > 1 {
            sums = box_sum_along(sums.view(), axis, r - 1, cancel)?;
        }
    }
    let divisor: f64 = radius.iter().map(|&r| (2 * r - 1) as f64).product();
    Ok(sums.mapv(|s| (s / divisor).round() as i64))
}

/// Sum over `[i - half, i + half]` along `axis`, clamping indices to the
/// volume.
fn box_sum_along(
    src: ArrayView3<'_, f64>,
    axis: usize,
    half: usize,
    cancel: &CancelToken,
) -> Result<Array3<f64>> {
    let shape = shape_of(&src);
    let last = shape[axis] - 1;
    let mut out = Array3::<f64>::zeros((shape[0], shape[1], shape[2]));
    fill_rows(&mut out, cancel, |y, mut row| {
        for ((x, z), v) in row.indexed_iter_mut() {
            let mut at = [y, x, z];
            let centre = at[axis];
            let mut acc = 0.0;
            for d in 0..=2 * half {
                at[axis] = (centre + d).saturating_sub(half).min(last);
                acc += src[at];
            }
            *v = acc;
        }
    })?;
    Ok(out)
}
