//! Padding contract between a volume and a kernel.
//!
//! Point-wise convolution reads `kernel.half_extent()` cells on each side of
//! a query coordinate. Callers pre-pad their volumes by at least that much;
//! this module makes the requirement explicit and checked.

use ndarray::{s, Array3, ArrayBase, ArrayView3, Ix3, RawData};

use crate::error::{FilterError, Result};
use crate::kernel::Kernel;
use crate::Coord;

/// `(y, x, z)` extent of a 3-D array.
#[inline]
pub fn shape_of<A, S: RawData<Elem = A>>(a: &ArrayBase<S, Ix3>) -> [usize; 3] {
    let (y, x, z) = a.dim();
    [y, x, z]
}

/// Cells of padding needed on each side of each axis, `(extent - 1) / 2`.
#[inline]
pub fn required_padding(kernel_shape: [usize; 3]) -> [usize; 3] {
    kernel_shape.map(|e| e.saturating_sub(1) / 2)
}

/// Confirm that a volume padded by `padding_applied` cells per side can be
/// queried anywhere in its logical region with a kernel of `kernel_shape`.
pub fn validate(
    volume_shape: [usize; 3],
    padding_applied: [usize; 3],
    kernel_shape: [usize; 3],
) -> Result<()> {
    if kernel_shape.iter().any(|e| e % 2 == 0) {
        return Err(FilterError::Shape(format!(
            "kernel extent {kernel_shape:?} must be odd on every axis"
        )));
    }
    let required = required_padding(kernel_shape);
    if padding_applied
        .iter()
        .zip(required.iter())
        .any(|(applied, needed)| applied < needed)
    {
        return Err(FilterError::Padding {
            shape: volume_shape,
            applied: padding_applied,
            required,
        });
    }
    if (0..3).any(|a| volume_shape[a] < 2 * padding_applied[a] + 1) {
        return Err(FilterError::Shape(format!(
            "volume {volume_shape:?} cannot hold padding {padding_applied:?} around a non-empty region"
        )));
    }
    Ok(())
}

/// Fail with [`FilterError::Bounds`] unless the full footprint of half
/// extent `half` around `coord` lies inside `shape`.
#[inline]
pub fn check_coord(shape: [usize; 3], coord: Coord, half: [usize; 3]) -> Result<()> {
    let inside = (0..3).all(|a| coord[a] >= half[a] && coord[a] < shape[a].saturating_sub(half[a]));
    if inside {
        Ok(())
    } else {
        Err(FilterError::Bounds { coord, half, shape })
    }
}

/// A volume view whose padding has been validated against a kernel.
#[derive(Clone, Copy, Debug)]
pub struct PaddedVolume<'a, T> {
    view: ArrayView3<'a, T>,
    padding: [usize; 3],
}

impl<'a, T> PaddedVolume<'a, T> {
    pub fn new(view: ArrayView3<'a, T>, padding: [usize; 3], kernel: &Kernel) -> Result<Self> {
        validate(shape_of(&view), padding, kernel.shape())?;
        Ok(Self { view, padding })
    }

    #[inline]
    pub fn view(&self) -> ArrayView3<'a, T> {
        self.view.clone()
    }

    #[inline]
    pub fn padding(&self) -> [usize; 3] {
        self.padding
    }

    /// Extent of the unpadded region.
    pub fn logical_shape(&self) -> [usize; 3] {
        let shape = shape_of(&self.view);
        [0, 1, 2].map(|a| shape[a] - 2 * self.padding[a])
    }

    /// Map a coordinate of the unpadded region into padded index space.
    pub fn to_padded(&self, logical: Coord) -> Result<Coord> {
        let shape = self.logical_shape();
        if (0..3).any(|a| logical[a] >= shape[a]) {
            return Err(FilterError::Bounds {
                coord: logical,
                half: [0; 3],
                shape,
            });
        }
        Ok([0, 1, 2].map(|a| logical[a] + self.padding[a]))
    }

    /// [`to_padded`](Self::to_padded) for every coordinate, failing on the
    /// first one outside the unpadded region.
    pub fn to_padded_all(&self, logical: &[Coord]) -> Result<Vec<Coord>> {
        logical.iter().map(|&c| self.to_padded(c)).collect()
    }

    /// Re-check the padding against another kernel.
    pub fn check_kernel(&self, kernel: &Kernel) -> Result<()> {
        validate(shape_of(&self.view), self.padding, kernel.shape())
    }
}

/// Surround `volume` with `padding` cells of `value` on every side.
pub fn pad_constant<T: Clone>(volume: ArrayView3<'_, T>, padding: [usize; 3], value: T) -> Array3<T> {
    let [ny, nx, nz] = shape_of(&volume);
    let [py, px, pz] = padding;
    let mut out = Array3::from_elem((ny + 2 * py, nx + 2 * px, nz + 2 * pz), value);
    out.slice_mut(s![py..py + ny, px..px + nx, pz..pz + nz])
        .assign(&volume);
    out
}

/// Surround `volume` with `padding` cells per side, repeating border values.
pub fn pad_replicate<T: Clone>(volume: ArrayView3<'_, T>, padding: [usize; 3]) -> Result<Array3<T>> {
    let shape = shape_of(&volume);
    if shape.contains(&0) {
        return Err(FilterError::Shape(format!(
            "cannot replicate the border of empty volume {shape:?}"
        )));
    }
    let clamp = |i: usize, a: usize| i.saturating_sub(padding[a]).min(shape[a] - 1);
    let padded_dim = (
        shape[0] + 2 * padding[0],
        shape[1] + 2 * padding[1],
        shape[2] + 2 * padding[2],
    );
    Ok(Array3::from_shape_fn(padded_dim, |(y, x, z)| {
        volume[[clamp(y, 0), clamp(x, 1), clamp(z, 2)]].clone()
    }))
}
