//! Counting positive and negative voxels around detected spots.

use ndarray::{Array3, ArrayView3};

use crate::boundary::{pad_constant, PaddedVolume};
use crate::error::{FilterError, Result};
use crate::kernel::Kernel;
use crate::sparse::convolve_padded;
use crate::Coord;

/// Per-spot neighbour counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighbourCounts {
    pub positive: Vec<usize>,
    pub negative: Option<Vec<usize>>,
}

fn require_binary(filter: &Kernel, name: &str) -> Result<()> {
    if filter.is_binary() {
        Ok(())
    } else {
        Err(FilterError::Config(format!(
            "{name} contains values other than 0 or 1"
        )))
    }
}

fn indicator<T, F>(image: &ArrayView3<'_, T>, pad: [usize; 3], pred: F) -> Array3<i8>
where
    T: Copy,
    F: Fn(T) -> bool,
{
    let marks = image.mapv(|v| i8::from(pred(v)));
    pad_constant(marks.view(), pad, 0)
}

fn to_counts(raw: Vec<i64>) -> Vec<usize> {
    raw.into_iter()
        .map(|c| usize::try_from(c).unwrap_or(0))
        .collect()
}

/// Count voxels with `image > 0` inside `pos_filter` centred on each spot,
/// and, when `neg_filter` is given, voxels with `image < 0` inside it.
///
/// Spots are in unpadded `image` coordinates and must lie inside the image
/// (otherwise [`FilterError::Bounds`]). Filters must contain only 0 and 1
/// (otherwise [`FilterError::Config`]). Outside the image counts as neither
/// positive nor negative. When both filters are identical the two indicator
/// volumes share one dual-volume pass.
pub fn count_spot_neighbours<T>(
    image: ArrayView3<'_, T>,
    spots: &[Coord],
    pos_filter: &Kernel,
    neg_filter: Option<&Kernel>,
) -> Result<NeighbourCounts>
where
    T: Copy + PartialOrd + Default,
{
    require_binary(pos_filter, "pos_filter")?;
    if let Some(neg) = neg_filter {
        require_binary(neg, "neg_filter")?;
    }

    let mut pad = pos_filter.half_extent();
    if let Some(neg) = neg_filter {
        let neg_half = neg.half_extent();
        for a in 0..3 {
            pad[a] = pad[a].max(neg_half[a]);
        }
    }

    let zero = T::default();
    let positive = indicator(&image, pad, |v| v > zero);
    let positive = PaddedVolume::new(positive.view(), pad, pos_filter)?;
    // the filters are neighbourhood masks, so undo the flip convolution applies
    let pos_kernel = pos_filter.flipped();

    match neg_filter {
        None => {
            let r = convolve_padded(&positive, &pos_kernel, spots, None)?;
            Ok(NeighbourCounts {
                positive: to_counts(r.primary),
                negative: None,
            })
        }
        Some(neg) => {
            let negative = indicator(&image, pad, |v| v < zero);
            let negative = PaddedVolume::new(negative.view(), pad, neg)?;
            if neg == pos_filter {
                let r = convolve_padded(&positive, &pos_kernel, spots, Some(&negative))?;
                Ok(NeighbourCounts {
                    positive: to_counts(r.primary),
                    negative: r.secondary.map(to_counts),
                })
            } else {
                let pos = convolve_padded(&positive, &pos_kernel, spots, None)?;
                let neg = convolve_padded(&negative, &neg.flipped(), spots, None)?;
                Ok(NeighbourCounts {
                    positive: to_counts(pos.primary),
                    negative: Some(to_counts(neg.primary)),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::build_tophat;

    fn sign_image() -> Array3<i32> {
        // rows: + + 0 - -
        Array3::from_shape_fn((3, 5, 1), |(_, x, _)| match x {
            0 | 1 => 7,
            2 => 0,
            _ => -3,
        })
    }

    #[test]
    fn counts_positive_and_negative_neighbours() {
        let img = sign_image();
        let filter = Kernel::new(Array3::from_elem((3, 3, 1), 1), 1.0).unwrap();
        let counts = count_spot_neighbours(
            img.view(),
            &[[1, 2, 0], [0, 0, 0]],
            &filter,
            Some(&filter),
        )
        .unwrap();
        assert_eq!(counts.positive, vec![3, 4]);
        assert_eq!(counts.negative, Some(vec![3, 0]));
    }

    #[test]
    fn asymmetric_filter_is_applied_as_a_mask() {
        let img = sign_image();
        // only the left neighbour
        let mut w = Array3::zeros((1, 3, 1));
        w[[0, 0, 0]] = 1;
        let left = Kernel::new(w, 1.0).unwrap();
        let counts = count_spot_neighbours(img.view(), &[[1, 2, 0], [1, 3, 0]], &left, None).unwrap();
        assert_eq!(counts.positive, vec![1, 0]);
        assert!(counts.negative.is_none());
    }

    #[test]
    fn different_filters_are_counted_separately() {
        let img = sign_image();
        let pos = build_tophat(1).unwrap();
        let neg = Kernel::new(Array3::from_elem((1, 5, 1), 1), 1.0).unwrap();
        let counts = count_spot_neighbours(img.view(), &[[1, 2, 0]], &pos, Some(&neg)).unwrap();
        assert_eq!(counts.positive, vec![1]);
        assert_eq!(counts.negative, Some(vec![2]));
    }

    #[test]
    fn rejects_non_binary_filters_and_outside_spots() {
        let img = sign_image();
        let weighted = Kernel::new(Array3::from_elem((3, 3, 1), 2), 1.0).unwrap();
        assert!(matches!(
            count_spot_neighbours(img.view(), &[[1, 1, 0]], &weighted, None),
            Err(FilterError::Config(_))
        ));
        let filter = build_tophat(1).unwrap();
        assert!(matches!(
            count_spot_neighbours(img.view(), &[[3, 1, 0]], &filter, None),
            Err(FilterError::Bounds { .. })
        ));
        assert!(matches!(
            count_spot_neighbours(img.view(), &[[1, usize::MAX, 0]], &filter, Some(&filter)),
            Err(FilterError::Bounds { .. })
        ));
    }
}
