//! patchgrid-core — memory-bank anomaly detection from pretrained patch features.
//!
//! Detects visual anomalies in manufactured parts by comparing a query
//! image's local feature descriptors against a reference set built from
//! known-good images only. The pipeline stages are:
//!
//! 1. **Backbone** – a frozen pretrained network, consumed as a black box
//!    that maps a preprocessed image tensor to feature maps at two fixed
//!    intermediate depths.
//! 2. **Features** – per-map smoothing, resampling to a common grid, and
//!    channel fusion into one descriptor per spatial location.
//! 3. **Bank** – patch descriptors pooled over all normal images and
//!    subsampled into the stored reference set.
//! 4. **Calibrate** – decision threshold derived from the score
//!    distribution of the normal set itself.
//! 5. **Score** – nearest-neighbor distances against the bank, an
//!    image-level score, and a full-resolution anomaly map.
//!
//! # Public API
//! [`AnomalyDetector`] is the primary entry point: construct it over a
//! [`FeatureBackbone`], call [`fit`](AnomalyDetector::fit) with normal
//! images, then [`score`](AnomalyDetector::score) queries. The stage
//! modules stay public for callers that need the primitives directly.
//!
//! Image tensors are `ndarray::Array3<f32>` in `(channel, height, width)`
//! order, already resized to the backbone's working resolution and scaled
//! to `[0, 1]`; decoding and resizing rasters is the caller's concern.

pub mod backbone;
pub mod bank;
pub mod calibrate;
pub mod detector;
pub mod features;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod score;

pub use backbone::{BackboneError, FeatureBackbone, FeatureMap};
pub use bank::{BankConfig, MemoryBank, ReferenceModel};
pub use detector::{AnomalyDetector, BuildError, DetectorConfig, FitSummary};
pub use features::{ConfigurationError, PatchConfig, PatchSet};
pub use score::{AnomalyResult, ScoreError, Verdict};

#[cfg(feature = "onnx")]
pub use onnx::{LoadError, OnnxBackbone, OnnxConfig};
