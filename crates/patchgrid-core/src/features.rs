//! Patch feature extraction: fuse two backbone depths into per-location
//! descriptors on a common spatial grid.
//!
//! Each map is smoothed with a small stride-1 box filter, resampled by
//! adaptive average pooling to the grid of the first (higher-resolution)
//! map, concatenated along channels, and flattened in raster order. The
//! raster-order invariant is what lets the scorer reshape per-location
//! distances back into a 2D grid.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::backbone::FeatureMap;

/// Configuration for patch extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Side of the stride-1 mean filter applied to each feature map
    /// before resampling. Must be odd-sized in spirit but any value ≥ 1
    /// that fits inside both maps is accepted; 1 disables smoothing.
    pub smooth_window: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self { smooth_window: 3 }
    }
}

/// Per-location descriptors for one image.
///
/// `features` has one row per spatial location of the common grid, in
/// raster (row-major) order: row `m` describes location
/// `(m / grid[1], m % grid[1])`.
#[derive(Debug, Clone)]
pub struct PatchSet {
    /// `(grid_h * grid_w, dim)` descriptor matrix.
    pub features: Array2<f32>,
    /// Common grid `[height, width]` the rows flatten.
    pub grid: [usize; 2],
}

impl PatchSet {
    /// Number of patch vectors (grid locations).
    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    /// True when the set holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.features.nrows() == 0
    }

    /// Descriptor length (summed channel count of the fused maps).
    pub fn dim(&self) -> usize {
        self.features.ncols()
    }
}

/// Errors indicating a backbone/adapter misconfiguration.
///
/// The two tapped depths are fixed at adapter construction, so none of
/// these are expected at runtime with a correctly wired backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The smoothing window is zero.
    ZeroWindow,
    /// A feature map has an empty channel or spatial extent.
    EmptyFeatureMap { index: usize },
    /// A feature map is smaller than the smoothing window.
    WindowExceedsMap {
        index: usize,
        height: usize,
        width: usize,
        window: usize,
    },
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroWindow => write!(f, "smoothing window must be at least 1"),
            Self::EmptyFeatureMap { index } => {
                write!(f, "feature map {} is empty", index)
            }
            Self::WindowExceedsMap {
                index,
                height,
                width,
                window,
            } => write!(
                f,
                "feature map {} ({}x{}) is smaller than the {}x{} smoothing window",
                index, height, width, window, window
            ),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Mean-filter a map with a `window x window` kernel at stride 1.
///
/// Only fully covered (valid) positions are produced, so the spatial
/// extent shrinks by `window - 1` on each side. `window` must be ≥ 1 and
/// no larger than either spatial side.
pub fn box_filter(map: &FeatureMap, window: usize) -> FeatureMap {
    let (c, h, w) = map.dim();
    debug_assert!(window >= 1 && window <= h && window <= w);
    let out_h = h - window + 1;
    let out_w = w - window + 1;
    let norm = 1.0 / (window * window) as f32;
    let mut out = Array3::<f32>::zeros((c, out_h, out_w));
    for ch in 0..c {
        for y in 0..out_h {
            for x in 0..out_w {
                let mut acc = 0.0f32;
                for dy in 0..window {
                    for dx in 0..window {
                        acc += map[[ch, y + dy, x + dx]];
                    }
                }
                out[[ch, y, x]] = acc * norm;
            }
        }
    }
    out
}

/// Resample a map to `out_h x out_w` by adaptive average pooling.
///
/// Output bin `i` averages input rows `[floor(i*h/out_h),
/// ceil((i+1)*h/out_h))` (likewise for columns), so the whole input
/// contributes regardless of whether the map shrinks or grows.
pub fn adaptive_avg_pool(map: &FeatureMap, out_h: usize, out_w: usize) -> FeatureMap {
    let (c, h, w) = map.dim();
    debug_assert!(h > 0 && w > 0 && out_h > 0 && out_w > 0);
    let mut out = Array3::<f32>::zeros((c, out_h, out_w));
    for ch in 0..c {
        for i in 0..out_h {
            let y0 = i * h / out_h;
            let y1 = ((i + 1) * h).div_ceil(out_h);
            for j in 0..out_w {
                let x0 = j * w / out_w;
                let x1 = ((j + 1) * w).div_ceil(out_w);
                let mut acc = 0.0f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        acc += map[[ch, y, x]];
                    }
                }
                out[[ch, i, j]] = acc / ((y1 - y0) * (x1 - x0)) as f32;
            }
        }
    }
    out
}

/// Fuse two tapped feature maps into per-location patch descriptors.
///
/// The common grid is the spatial size of the first map before
/// smoothing; the first map is the shallower, higher-resolution tap by
/// the [`crate::backbone::FeatureBackbone`] contract.
pub fn to_patches(
    maps: &[FeatureMap; 2],
    config: &PatchConfig,
) -> Result<PatchSet, ConfigurationError> {
    if config.smooth_window == 0 {
        return Err(ConfigurationError::ZeroWindow);
    }
    for (index, map) in maps.iter().enumerate() {
        let (c, h, w) = map.dim();
        if c == 0 || h == 0 || w == 0 {
            return Err(ConfigurationError::EmptyFeatureMap { index });
        }
        if h < config.smooth_window || w < config.smooth_window {
            return Err(ConfigurationError::WindowExceedsMap {
                index,
                height: h,
                width: w,
                window: config.smooth_window,
            });
        }
    }

    let (_, grid_h, grid_w) = maps[0].dim();
    let dim: usize = maps.iter().map(|m| m.dim().0).sum();
    let mut features = Array2::<f32>::zeros((grid_h * grid_w, dim));

    let mut channel_base = 0usize;
    for map in maps {
        let smoothed = box_filter(map, config.smooth_window);
        let resized = adaptive_avg_pool(&smoothed, grid_h, grid_w);
        let c = resized.dim().0;
        for ch in 0..c {
            for y in 0..grid_h {
                for x in 0..grid_w {
                    features[[y * grid_w + x, channel_base + ch]] = resized[[ch, y, x]];
                }
            }
        }
        channel_base += c;
    }

    Ok(PatchSet {
        features,
        grid: [grid_h, grid_w],
    })
}
