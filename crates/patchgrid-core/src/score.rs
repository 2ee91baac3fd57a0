//! Anomaly scoring: nearest-neighbor distances against the memory bank
//! and spatial anomaly-map synthesis.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::backbone::BackboneError;
use crate::bank::ReferenceModel;
use crate::features::{ConfigurationError, PatchSet};

// ── Types ──────────────────────────────────────────────────────────────────

/// Image-level classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Score below the calibrated threshold.
    Ok,
    /// Score at or above the calibrated threshold.
    Nok,
}

impl Verdict {
    /// Classify a score against a threshold. The comparison is
    /// inclusive: a score exactly at the threshold is `Nok`.
    pub fn from_score(score: f32, threshold: f32) -> Self {
        if score >= threshold {
            Self::Nok
        } else {
            Self::Ok
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Nok => write!(f, "NOK"),
        }
    }
}

/// Per-query scoring output. Ephemeral; nothing here is retained by the
/// detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    /// Nearest-neighbor distance map upsampled to the query image's own
    /// resolution `(height, width)`.
    pub distance_map: Array2<f32>,
    /// Locations whose upsampled distance exceeds
    /// `threshold * mask_margin`, same shape as `distance_map`.
    pub mask: Array2<bool>,
    /// Image-level anomaly score: the maximum per-location distance.
    pub score: f32,
    /// `score / threshold` of the model the query was scored against.
    pub normalized: f32,
    /// Classification against the calibrated threshold.
    pub verdict: Verdict,
    /// Internal grid resolution `[height, width]` the distances were
    /// computed on, for diagnostics.
    pub grid: [usize; 2],
    /// Revision of the reference model used.
    pub revision: u64,
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Errors raised on the scoring path.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreError {
    /// No successful build has published a reference model yet.
    BankNotBuilt,
    /// Query descriptors and bank descriptors disagree in length.
    DimensionMismatch { bank: usize, query: usize },
    /// The backbone failed while extracting the query's feature maps.
    Backbone(BackboneError),
    /// The query's feature maps were malformed.
    Patch(ConfigurationError),
}

impl std::fmt::Display for ScoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BankNotBuilt => {
                write!(f, "no memory bank built yet; fit normal images first")
            }
            Self::DimensionMismatch { bank, query } => write!(
                f,
                "descriptor length mismatch: bank {}, query {}",
                bank, query
            ),
            Self::Backbone(err) => write!(f, "{}", err),
            Self::Patch(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ScoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backbone(err) => Some(err),
            Self::Patch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackboneError> for ScoreError {
    fn from(err: BackboneError) -> Self {
        Self::Backbone(err)
    }
}

impl From<ConfigurationError> for ScoreError {
    fn from(err: ConfigurationError) -> Self {
        Self::Patch(err)
    }
}

// ── Scoring kernels ────────────────────────────────────────────────────────

/// Euclidean distance from every query descriptor to its nearest bank
/// descriptor (k = 1), in the query's row order.
///
/// Distances are compared squared and rooted once per query row.
pub fn nearest_distances(patches: &Array2<f32>, bank: &Array2<f32>) -> Vec<f32> {
    debug_assert_eq!(patches.ncols(), bank.ncols());
    let mut out = Vec::with_capacity(patches.nrows());
    for p in patches.rows() {
        let mut best = f32::INFINITY;
        for b in bank.rows() {
            let mut acc = 0.0f32;
            for (pv, bv) in p.iter().zip(b.iter()) {
                let d = pv - bv;
                acc += d * d;
            }
            if acc < best {
                best = acc;
            }
        }
        out.push(best.sqrt());
    }
    out
}

/// Image-level score: the worst (largest) per-location distance.
///
/// The maximum rather than the mean, so a single small defect cannot be
/// averaged away by an otherwise normal image.
pub fn image_score(distances: &[f32]) -> f32 {
    distances.iter().copied().fold(0.0f32, f32::max)
}

/// Sample a 2D grid at a sub-cell position using bilinear interpolation.
/// Coordinates are clamped to the grid's corner centers.
#[inline]
pub fn bilinear_sample_grid(grid: &Array2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = grid.dim();
    let x0 = (x.floor() as usize).min(w - 1);
    let y0 = (y.floor() as usize).min(h - 1);
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = (x - x0 as f32).clamp(0.0, 1.0);
    let fy = (y - y0 as f32).clamp(0.0, 1.0);
    let p00 = grid[[y0, x0]];
    let p10 = grid[[y0, x1]];
    let p01 = grid[[y1, x0]];
    let p11 = grid[[y1, x1]];
    (1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11
}

/// Upsample a grid to `out_h x out_w` by bilinear interpolation with the
/// half-pixel-center convention: destination pixel centers map to
/// `src = (dst + 0.5) * scale - 0.5`, clamped at the edges.
pub fn upsample_bilinear(grid: &Array2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (h, w) = grid.dim();
    debug_assert!(h > 0 && w > 0 && out_h > 0 && out_w > 0);
    let scale_y = h as f32 / out_h as f32;
    let scale_x = w as f32 / out_w as f32;
    let mut out = Array2::<f32>::zeros((out_h, out_w));
    for i in 0..out_h {
        let src_y = ((i as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (h - 1) as f32);
        for j in 0..out_w {
            let src_x = ((j as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (w - 1) as f32);
            out[[i, j]] = bilinear_sample_grid(grid, src_x, src_y);
        }
    }
    out
}

/// Score an extracted patch set against a reference model.
///
/// `out_h`/`out_w` is the query image's spatial resolution, the target
/// of the distance-map upsampling. The mask flags locations strictly
/// above `threshold * mask_margin`; the verdict uses the inclusive
/// comparison of [`Verdict::from_score`].
pub fn score_patches(
    patches: &PatchSet,
    model: &ReferenceModel,
    mask_margin: f32,
    out_h: usize,
    out_w: usize,
) -> Result<AnomalyResult, ScoreError> {
    if patches.dim() != model.bank.dim() {
        return Err(ScoreError::DimensionMismatch {
            bank: model.bank.dim(),
            query: patches.dim(),
        });
    }

    let distances = nearest_distances(&patches.features, model.bank.vectors());
    let score = image_score(&distances);

    let [grid_h, grid_w] = patches.grid;
    // Row-major reshape is exact by the PatchSet raster-order invariant.
    let grid = Array2::from_shape_vec((grid_h, grid_w), distances)
        .expect("distance count matches the patch grid");
    let distance_map = upsample_bilinear(&grid, out_h, out_w);

    let cutoff = model.threshold * mask_margin;
    let mask = distance_map.mapv(|v| v > cutoff);

    Ok(AnomalyResult {
        distance_map,
        mask,
        score,
        normalized: score / model.threshold,
        verdict: Verdict::from_score(score, model.threshold),
        grid: [grid_h, grid_w],
        revision: model.revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::MemoryBank;
    use ndarray::{arr2, Array2};

    #[test]
    fn nearest_distance_exact_values() {
        let bank = arr2(&[[0.0, 0.0], [3.0, 4.0]]);
        let patches = arr2(&[[0.0, 0.0], [3.0, 3.0], [6.0, 8.0]]);
        let d = nearest_distances(&patches, &bank);
        assert_eq!(d, vec![0.0, 1.0, 5.0]);
    }

    #[test]
    fn image_score_is_max() {
        assert_eq!(image_score(&[0.5, 2.0, 1.0]), 2.0);
        assert_eq!(image_score(&[]), 0.0);
    }

    #[test]
    fn verdict_boundary_is_inclusive() {
        assert_eq!(Verdict::from_score(1.0, 1.0), Verdict::Nok);
        assert_eq!(Verdict::from_score(0.999, 1.0), Verdict::Ok);
        assert_eq!(Verdict::from_score(1.001, 1.0), Verdict::Nok);
    }

    #[test]
    fn verdict_labels() {
        assert_eq!(Verdict::Ok.to_string(), "OK");
        assert_eq!(Verdict::Nok.to_string(), "NOK");
    }

    #[test]
    fn upsample_two_to_four_half_pixel_centers() {
        let grid = arr2(&[[0.0, 1.0], [2.0, 3.0]]);
        let up = upsample_bilinear(&grid, 4, 4);
        assert_eq!(up.dim(), (4, 4));
        // First row samples y = -0.25 (clamped to the top edge).
        assert_eq!(up[[0, 0]], 0.0);
        assert!((up[[0, 1]] - 0.25).abs() < 1e-6);
        assert!((up[[0, 2]] - 0.75).abs() < 1e-6);
        assert_eq!(up[[0, 3]], 1.0);
        // Corners stay exact.
        assert_eq!(up[[3, 0]], 2.0);
        assert_eq!(up[[3, 3]], 3.0);
    }

    #[test]
    fn upsample_preserves_constant_grids() {
        let grid = Array2::from_elem((3, 5), 1.25);
        let up = upsample_bilinear(&grid, 17, 23);
        assert_eq!(up.dim(), (17, 23));
        assert!(up.iter().all(|&v| (v - 1.25).abs() < 1e-6));
    }

    fn model_with_threshold(threshold: f32) -> ReferenceModel {
        ReferenceModel {
            bank: MemoryBank::new(arr2(&[[0.0, 0.0]])).unwrap(),
            threshold,
            revision: 1,
        }
    }

    fn unit_patches() -> PatchSet {
        PatchSet {
            features: arr2(&[[3.0, 4.0], [0.0, 0.0], [0.0, 1.0], [1.0, 0.0]]),
            grid: [2, 2],
        }
    }

    #[test]
    fn score_patches_bundles_all_outputs() {
        let model = model_with_threshold(2.0);
        let res = score_patches(&unit_patches(), &model, 1.25, 8, 8).unwrap();
        assert_eq!(res.score, 5.0);
        assert_eq!(res.normalized, 2.5);
        assert_eq!(res.verdict, Verdict::Nok);
        assert_eq!(res.grid, [2, 2]);
        assert_eq!(res.distance_map.dim(), (8, 8));
        assert_eq!(res.mask.dim(), (8, 8));
        assert_eq!(res.revision, 1);
    }

    #[test]
    fn mask_margin_is_strictly_above() {
        // threshold * margin = 5.0 exactly matches the peak distance, so
        // even the peak cell stays unmasked under the strict comparison.
        let model = model_with_threshold(4.0);
        let res = score_patches(&unit_patches(), &model, 1.25, 2, 2).unwrap();
        assert_eq!(res.score, 5.0);
        assert!(res.mask.iter().all(|&m| !m));

        let model = model_with_threshold(3.9);
        let res = score_patches(&unit_patches(), &model, 1.25, 2, 2).unwrap();
        assert!(res.mask.iter().any(|&m| m));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let model = model_with_threshold(1.0);
        let patches = PatchSet {
            features: arr2(&[[1.0, 2.0, 3.0]]),
            grid: [1, 1],
        };
        let err = score_patches(&patches, &model, 1.25, 4, 4).unwrap_err();
        assert_eq!(err, ScoreError::DimensionMismatch { bank: 2, query: 3 });
    }
}
