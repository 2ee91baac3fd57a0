//! High-level inspection API.
//!
//! [`AnomalyDetector`] is the primary entry point. It owns the frozen
//! backbone and the extraction/bank configuration, and coordinates the
//! two-phase lifecycle of the reference state: unfitted (scoring
//! refused) → fitted (scoring enabled) → refit (a fresh model replaces
//! the previous one wholesale, never merges into it).

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::backbone::{BackboneError, FeatureBackbone};
use crate::bank::{BankConfig, MemoryBank, ReferenceModel};
use crate::calibrate::calibrate_threshold;
use crate::features::{to_patches, ConfigurationError, PatchConfig, PatchSet};
use crate::score::{self, AnomalyResult, ScoreError};

/// Configuration for the full inspection pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Patch feature extraction parameters.
    pub patch: PatchConfig,
    /// Memory-bank subsampling parameters.
    pub bank: BankConfig,
    /// Multiplier on the decision threshold above which a location is
    /// flagged in the segmentation mask. Suppresses near-boundary noise
    /// in the rendered mask; distinct from the classification threshold.
    pub mask_margin: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            patch: PatchConfig::default(),
            bank: BankConfig::default(),
            mask_margin: 1.25,
        }
    }
}

/// Errors raised while building the memory bank.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildError {
    /// No normal images were supplied; the previous model, if any, is
    /// left untouched.
    EmptyImageSet,
    /// Descriptor lengths diverged between images, which indicates the
    /// backbone changed its output layout between calls.
    InconsistentPatchDim { expected: usize, got: usize },
    /// The backbone failed on one of the normal images.
    Backbone(BackboneError),
    /// A normal image produced malformed feature maps.
    Patch(ConfigurationError),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyImageSet => write!(f, "at least one normal image is required"),
            Self::InconsistentPatchDim { expected, got } => write!(
                f,
                "inconsistent descriptor length across images: {} then {}",
                expected, got
            ),
            Self::Backbone(err) => write!(f, "{}", err),
            Self::Patch(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backbone(err) => Some(err),
            Self::Patch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackboneError> for BuildError {
    fn from(err: BackboneError) -> Self {
        Self::Backbone(err)
    }
}

impl From<ConfigurationError> for BuildError {
    fn from(err: ConfigurationError) -> Self {
        Self::Patch(err)
    }
}

/// Summary of one completed bank build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSummary {
    /// Number of normal images consumed.
    pub n_images: usize,
    /// Pooled descriptor count before subsampling.
    pub pooled_vectors: usize,
    /// Descriptors kept in the bank.
    pub kept_vectors: usize,
    /// Descriptor length.
    pub patch_dim: usize,
    /// Common patch grid `[height, width]` of the first image.
    pub grid: [usize; 2],
    /// Calibrated decision threshold.
    pub threshold: f32,
    /// Revision of the published model.
    pub revision: u64,
}

/// Memory-bank anomaly detector over a frozen feature backbone.
///
/// Create once, fit on normal images, score many queries. Scoring reads
/// the reference model through a versioned pointer: a concurrent refit
/// publishes its replacement atomically, and scorers that already hold
/// the previous model simply finish against it.
pub struct AnomalyDetector<B> {
    backbone: B,
    config: DetectorConfig,
    model: RwLock<Option<Arc<ReferenceModel>>>,
    fit_guard: Mutex<()>,
}

impl<B: FeatureBackbone> AnomalyDetector<B> {
    /// Create a detector with default configuration.
    pub fn new(backbone: B) -> Self {
        Self::with_config(backbone, DetectorConfig::default())
    }

    /// Create with full config control.
    pub fn with_config(backbone: B, config: DetectorConfig) -> Self {
        Self {
            backbone,
            config,
            model: RwLock::new(None),
            fit_guard: Mutex::new(()),
        }
    }

    /// Access the current configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Mutable access to configuration for post-construction tuning.
    /// Takes effect on the next fit or score call.
    pub fn config_mut(&mut self) -> &mut DetectorConfig {
        &mut self.config
    }

    /// The currently published reference model, if any.
    pub fn model(&self) -> Option<Arc<ReferenceModel>> {
        recover(self.model.read()).clone()
    }

    /// True once a fit has published a model.
    pub fn is_fitted(&self) -> bool {
        self.model().is_some()
    }

    /// Build the memory bank and calibrate the threshold from normal
    /// images, then publish both as one new model revision.
    ///
    /// Fails without touching the published model if `normal` is empty
    /// or any image cannot be processed. At most one fit runs at a
    /// time; concurrent scoring keeps reading the previous revision
    /// until the new one is published.
    pub fn fit(&self, normal: &[Array3<f32>]) -> Result<FitSummary, BuildError> {
        if normal.is_empty() {
            return Err(BuildError::EmptyImageSet);
        }
        let _serialize_fits: MutexGuard<'_, ()> = recover_mutex(self.fit_guard.lock());

        // Extract every image first; any failure aborts the build with
        // the previous model still in place.
        let mut sets: Vec<PatchSet> = Vec::with_capacity(normal.len());
        for image in normal {
            let maps = self.backbone.feature_maps(image)?;
            sets.push(to_patches(&maps, &self.config.patch)?);
        }

        let dim = sets[0].dim();
        for set in &sets[1..] {
            if set.dim() != dim {
                return Err(BuildError::InconsistentPatchDim {
                    expected: dim,
                    got: set.dim(),
                });
            }
        }

        // Pool all descriptors with no per-image grouping.
        let pooled_vectors: usize = sets.iter().map(PatchSet::len).sum();
        let mut pooled = Array2::<f32>::zeros((pooled_vectors, dim));
        let mut row = 0usize;
        for set in &sets {
            let n = set.len();
            pooled.slice_mut(s![row..row + n, ..]).assign(&set.features);
            row += n;
        }

        let bank = MemoryBank::subsample(pooled, &self.config.bank);

        // Calibrate against the freshly built bank. Extraction is
        // deterministic, so the descriptors pooled above are reused
        // instead of running the backbone a second time per image.
        let mut scores = Vec::with_capacity(sets.len());
        for (i, set) in sets.iter().enumerate() {
            let d = score::nearest_distances(&set.features, bank.vectors());
            let s = score::image_score(&d);
            tracing::debug!("calibration image {}: score {:.6}", i, s);
            scores.push(s);
        }
        let threshold = calibrate_threshold(&scores);

        let mut slot = recover_write(self.model.write());
        let revision = slot.as_ref().map_or(1, |m| m.revision + 1);
        let summary = FitSummary {
            n_images: normal.len(),
            pooled_vectors,
            kept_vectors: bank.len(),
            patch_dim: dim,
            grid: sets[0].grid,
            threshold,
            revision,
        };
        *slot = Some(Arc::new(ReferenceModel {
            bank,
            threshold,
            revision,
        }));
        drop(slot);

        tracing::info!(
            "memory bank rebuilt: {} images, {} of {} descriptors kept, threshold {:.6} (revision {})",
            summary.n_images,
            summary.kept_vectors,
            summary.pooled_vectors,
            summary.threshold,
            summary.revision,
        );
        Ok(summary)
    }

    /// Score a query image against the published reference model.
    ///
    /// Refuses with [`ScoreError::BankNotBuilt`] before the first
    /// successful fit; otherwise deterministic for a fixed image and
    /// model revision.
    pub fn score(&self, image: &Array3<f32>) -> Result<AnomalyResult, ScoreError> {
        let model = self.model().ok_or(ScoreError::BankNotBuilt)?;
        let maps = self.backbone.feature_maps(image)?;
        let patches = to_patches(&maps, &self.config.patch)?;
        let (_, height, width) = image.dim();
        score::score_patches(&patches, &model, self.config.mask_margin, height, width)
    }
}

// The guarded slot is swapped as a whole pointer, so a poisoned lock
// still holds a consistent value and is recovered rather than propagated.
fn recover<'a, T>(
    result: Result<std::sync::RwLockReadGuard<'a, T>, std::sync::PoisonError<std::sync::RwLockReadGuard<'a, T>>>,
) -> std::sync::RwLockReadGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn recover_write<'a, T>(
    result: Result<std::sync::RwLockWriteGuard<'a, T>, std::sync::PoisonError<std::sync::RwLockWriteGuard<'a, T>>>,
) -> std::sync::RwLockWriteGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn recover_mutex<'a, T>(
    result: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::FeatureMap;
    use crate::features::adaptive_avg_pool;
    use ndarray::Array3;

    /// Content-dependent stand-in for a pretrained network: each tap is
    /// the image pooled to a fixed grid with per-channel scaling.
    struct PoolingBackbone;

    impl PoolingBackbone {
        fn tap(image: &Array3<f32>, channels: usize, grid: usize) -> FeatureMap {
            let pooled = adaptive_avg_pool(image, grid, grid);
            Array3::from_shape_fn((channels, grid, grid), |(c, y, x)| {
                pooled[[c % 3, y, x]] * (1.0 + 0.25 * c as f32)
            })
        }
    }

    impl FeatureBackbone for PoolingBackbone {
        fn feature_maps(&self, image: &Array3<f32>) -> Result<[FeatureMap; 2], BackboneError> {
            Ok([Self::tap(image, 4, 14), Self::tap(image, 6, 7)])
        }
    }

    fn flat_image(value: f32) -> Array3<f32> {
        Array3::from_elem((3, 56, 56), value)
    }

    #[test]
    fn fit_rejects_empty_set() {
        let det = AnomalyDetector::new(PoolingBackbone);
        assert_eq!(det.fit(&[]).unwrap_err(), BuildError::EmptyImageSet);
        assert!(!det.is_fitted());
    }

    #[test]
    fn score_before_fit_is_a_state_error() {
        let det = AnomalyDetector::new(PoolingBackbone);
        let err = det.score(&flat_image(0.5)).unwrap_err();
        assert_eq!(err, ScoreError::BankNotBuilt);
    }

    #[test]
    fn fit_publishes_bank_and_threshold_together() {
        let det = AnomalyDetector::new(PoolingBackbone);
        let summary = det.fit(&[flat_image(0.25), flat_image(0.5)]).unwrap();
        assert_eq!(summary.n_images, 2);
        assert_eq!(summary.pooled_vectors, 2 * 14 * 14);
        assert_eq!(summary.kept_vectors, 39);
        assert_eq!(summary.patch_dim, 10);
        assert_eq!(summary.grid, [14, 14]);
        assert!(summary.threshold.is_finite());
        assert!(summary.threshold >= 0.0);

        let model = det.model().unwrap();
        assert_eq!(model.revision, 1);
        assert_eq!(model.threshold, summary.threshold);
        assert_eq!(model.bank.len(), summary.kept_vectors);
    }

    #[test]
    fn failed_refit_keeps_previous_model() {
        let det = AnomalyDetector::new(PoolingBackbone);
        det.fit(&[flat_image(0.25)]).unwrap();
        let before = det.model().unwrap();
        assert_eq!(det.fit(&[]).unwrap_err(), BuildError::EmptyImageSet);
        let after = det.model().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }
}
