//! Resolved filter parameters and radius resolution helpers.

use crate::error::{FilterError, Result};

/// Filter parameters for one pipeline run, with every radius already
/// resolved to pixels.
///
/// Build it with [`FilterConfig::new`] (which applies the `r2 = 2 * r1`
/// default) and the `with_*` builders, then treat it as immutable.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterConfig {
    /// Radius in pixels of the positive inner window.
    pub r1: usize,
    /// Radius in pixels of the negative outer window.
    pub r2: usize,
    /// Smoothing radii `(yx, yx, z)`; `[1, 1, 1]` disables smoothing.
    pub r_smooth: [usize; 3],
    /// Top-hat radius for the nuclear-stain channel, if there is one.
    pub r_dapi: Option<usize>,
    /// Filter the full 3-D stack instead of a focus-stacked plane.
    pub is_3d: bool,
    /// Multiplier applied to the band-pass output before rounding.
    pub scale: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            r1: 3,
            r2: 6,
            r_smooth: [1, 1, 1],
            r_dapi: None,
            is_3d: false,
            scale: 1.0,
        }
    }
}

impl FilterConfig {
    /// Create a config from the band-pass radii. `r2` defaults to `2 * r1`.
    pub fn new(r1: usize, r2: Option<usize>) -> Result<Self> {
        let cfg = Self {
            r1,
            r2: r2.unwrap_or_else(|| default_r2(r1)),
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_smoothing(mut self, r_smooth: [usize; 3]) -> Self {
        self.r_smooth = r_smooth;
        self
    }

    pub fn with_dapi_radius(mut self, r_dapi: usize) -> Self {
        self.r_dapi = Some(r_dapi);
        self
    }

    pub fn with_3d(mut self, is_3d: bool) -> Self {
        self.is_3d = is_3d;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Number of spatial dimensions the band-pass kernel is built for.
    #[inline]
    pub fn ndims(&self) -> usize {
        if self.is_3d {
            3
        } else {
            2
        }
    }

    #[inline]
    pub fn smoothing_requested(&self) -> bool {
        self.r_smooth != [1, 1, 1]
    }

    /// Check that every radius is a positive integer and `r2 >= r1`.
    pub fn validate(&self) -> Result<()> {
        if self.r1 == 0 || self.r2 == 0 {
            return Err(FilterError::Config(format!(
                "band-pass radii must be positive, got r1={} r2={}",
                self.r1, self.r2
            )));
        }
        if self.r2 < self.r1 {
            return Err(FilterError::Config(format!(
                "outer radius r2={} is smaller than inner radius r1={}",
                self.r2, self.r1
            )));
        }
        if self.r_smooth.contains(&0) {
            return Err(FilterError::Config(format!(
                "smoothing radii must be positive, got {:?}",
                self.r_smooth
            )));
        }
        if self.r_dapi == Some(0) {
            return Err(FilterError::Config("r_dapi must be positive".into()));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(FilterError::Config(format!(
                "scale must be a positive finite number, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Outer radius used when `r2` is not configured.
#[inline]
pub fn default_r2(r1: usize) -> usize {
    2 * r1
}

/// Resolve a pixel radius from either an explicit value or a physical
/// radius in microns.
///
/// An explicit `radius` wins. Otherwise the result is
/// `round(auto_microns / pixel_size_microns)`. A resolved radius of 0, or a
/// missing/non-positive input, is a [`FilterError::Config`].
pub fn resolve_radius_pixels(
    radius: Option<usize>,
    auto_microns: Option<f64>,
    pixel_size_microns: f64,
) -> Result<usize> {
    if let Some(r) = radius {
        if r == 0 {
            return Err(FilterError::Config("radius must be positive".into()));
        }
        return Ok(r);
    }
    let microns = auto_microns.ok_or_else(|| {
        FilterError::Config("radius is unset and no physical radius was given".into())
    })?;
    if !(pixel_size_microns.is_finite() && pixel_size_microns > 0.0) {
        return Err(FilterError::Config(format!(
            "pixel size must be positive, got {pixel_size_microns}"
        )));
    }
    let pixels = (microns / pixel_size_microns).round();
    if !(pixels.is_finite() && pixels >= 1.0) {
        return Err(FilterError::Config(format!(
            "{microns} um at {pixel_size_microns} um/px resolves to {pixels} px"
        )));
    }
    Ok(pixels as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r2_defaults_to_twice_r1() {
        let cfg = FilterConfig::new(4, None).unwrap();
        assert_eq!(cfg.r2, 8);
        let cfg = FilterConfig::new(4, Some(5)).unwrap();
        assert_eq!(cfg.r2, 5);
    }

    #[test]
    fn rejects_inverted_and_zero_radii() {
        assert!(matches!(
            FilterConfig::new(4, Some(3)),
            Err(FilterError::Config(_))
        ));
        assert!(matches!(FilterConfig::new(0, None), Err(FilterError::Config(_))));
        let cfg = FilterConfig::default().with_smoothing([2, 2, 0]);
        assert!(matches!(cfg.validate(), Err(FilterError::Config(_))));
    }

    #[test]
    fn resolves_physical_radius() {
        assert_eq!(resolve_radius_pixels(None, Some(0.5), 0.1).unwrap(), 5);
        assert_eq!(resolve_radius_pixels(None, Some(0.26), 0.1).unwrap(), 3);
        assert_eq!(resolve_radius_pixels(Some(7), Some(0.5), 0.1).unwrap(), 7);
    }

    #[test]
    fn physical_radius_below_half_a_pixel_is_rejected() {
        assert!(matches!(
            resolve_radius_pixels(None, Some(0.04), 0.1),
            Err(FilterError::Config(_))
        ));
        assert!(matches!(
            resolve_radius_pixels(None, None, 0.1),
            Err(FilterError::Config(_))
        ));
        assert!(matches!(
            resolve_radius_pixels(Some(0), None, 0.1),
            Err(FilterError::Config(_))
        ));
    }

    #[test]
    fn smoothing_of_ones_is_not_requested() {
        let cfg = FilterConfig::default();
        assert!(!cfg.smoothing_requested());
        assert!(cfg.with_smoothing([2, 2, 1]).smoothing_requested());
    }
}
