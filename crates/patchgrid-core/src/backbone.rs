//! Backbone seam: frozen pretrained networks as two-output feature extractors.

use ndarray::Array3;

/// One feature map captured at a fixed backbone depth, `(channel, height,
/// width)`. Owned transiently by a single extraction call.
pub type FeatureMap = Array3<f32>;

/// Errors surfaced by a backbone during inference.
///
/// Loading failures are constructor errors of the concrete backbone (see
/// [`crate::onnx::LoadError`]) and never show up per request.
#[derive(Debug, Clone, PartialEq)]
pub enum BackboneError {
    /// The underlying runtime failed to execute the forward pass.
    Inference(String),
    /// A configured feature output was absent from the runtime result.
    MissingOutput(String),
    /// A feature output did not decode to a `(C, H, W)` map.
    UnexpectedShape { name: String, dims: Vec<usize> },
}

impl std::fmt::Display for BackboneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inference(msg) => write!(f, "backbone inference failed: {}", msg),
            Self::MissingOutput(name) => write!(f, "backbone output '{}' missing", name),
            Self::UnexpectedShape { name, dims } => {
                write!(f, "backbone output '{}' has unexpected shape {:?}", name, dims)
            }
        }
    }
}

impl std::error::Error for BackboneError {}

/// A frozen pretrained network exposed as an explicit two-output function.
///
/// Implementations return the feature maps captured at two fixed
/// intermediate depths, shallower (higher-resolution) first. The forward
/// pass must be deterministic for a given image and fixed weights; no
/// gradient computation, no weight updates, no state mutation across
/// calls.
///
/// The input tensor is `(3, H, W)`, already resized to the network's
/// expected resolution and scaled to `[0, 1]`.
pub trait FeatureBackbone {
    /// Run the forward pass and return the two tapped feature maps.
    fn feature_maps(&self, image: &Array3<f32>) -> Result<[FeatureMap; 2], BackboneError>;
}
