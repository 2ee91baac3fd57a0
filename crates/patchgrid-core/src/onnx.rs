//! ONNX Runtime backbone: a frozen pretrained network loaded once at
//! startup and queried for two named intermediate outputs.
//!
//! The model is expected to expose the two feature taps as graph
//! outputs (e.g. a ResNet-50 exported with `layer2` and `layer3`
//! outputs alongside or instead of the classification head). Loading
//! failures are fatal for the whole system and are reported from the
//! constructor; per-request inference failures surface as
//! [`BackboneError`].

use std::path::PathBuf;
use std::sync::Mutex;

use ndarray::Array3;
use ort::session::Session;
use serde::{Deserialize, Serialize};

use crate::backbone::{BackboneError, FeatureBackbone, FeatureMap};

/// Configuration for the ONNX backbone session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxConfig {
    /// Path to the exported model file.
    pub model_path: PathBuf,
    /// Name of the image input.
    pub input_name: String,
    /// Names of the two feature outputs, shallower (higher-resolution)
    /// tap first.
    pub feature_outputs: [String; 2],
    /// Intra-op thread count for the runtime; 0 leaves the choice to
    /// ONNX Runtime.
    pub intra_threads: usize,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("resnet50-features.onnx"),
            input_name: "input".to_string(),
            feature_outputs: ["layer2".to_string(), "layer3".to_string()],
            intra_threads: 0,
        }
    }
}

/// Errors while loading the backbone. Fatal at startup; none of these
/// are recoverable per request.
#[derive(Debug)]
pub enum LoadError {
    /// The model file does not exist or could not be read.
    ModelFile { path: PathBuf, message: String },
    /// The runtime session could not be created.
    Session(String),
    /// The configured input name is not an input of the loaded graph.
    MissingInput {
        expected: String,
        available: Vec<String>,
    },
    /// A configured feature output is not an output of the loaded graph.
    MissingOutput {
        expected: String,
        available: Vec<String>,
    },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelFile { path, message } => {
                write!(f, "cannot load model '{}': {}", path.display(), message)
            }
            Self::Session(msg) => write!(f, "cannot create inference session: {}", msg),
            Self::MissingInput {
                expected,
                available,
            } => write!(
                f,
                "model has no input '{}' (available: {:?})",
                expected, available
            ),
            Self::MissingOutput {
                expected,
                available,
            } => write!(
                f,
                "model has no output '{}' (available: {:?})",
                expected, available
            ),
        }
    }
}

impl std::error::Error for LoadError {}

/// Frozen pretrained backbone served by ONNX Runtime.
///
/// The session is created once and shared; `run` needs exclusive access
/// to the runtime, so calls are serialized behind a mutex. All other
/// state is immutable.
pub struct OnnxBackbone {
    session: Mutex<Session>,
    config: OnnxConfig,
}

impl OnnxBackbone {
    /// Load the model and validate that the configured input and both
    /// feature outputs exist in the graph.
    pub fn load(config: OnnxConfig) -> Result<Self, LoadError> {
        if !config.model_path.is_file() {
            return Err(LoadError::ModelFile {
                path: config.model_path.clone(),
                message: "no such file".to_string(),
            });
        }

        let mut builder = Session::builder().map_err(|e| LoadError::Session(e.to_string()))?;
        if config.intra_threads > 0 {
            builder = builder
                .with_intra_threads(config.intra_threads)
                .map_err(|e| LoadError::Session(e.to_string()))?;
        }
        let session = builder
            .commit_from_file(&config.model_path)
            .map_err(|e| LoadError::ModelFile {
                path: config.model_path.clone(),
                message: e.to_string(),
            })?;

        let input_names: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        if !input_names.iter().any(|n| *n == config.input_name) {
            return Err(LoadError::MissingInput {
                expected: config.input_name.clone(),
                available: input_names,
            });
        }
        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        for expected in &config.feature_outputs {
            if !output_names.iter().any(|n| n == expected) {
                return Err(LoadError::MissingOutput {
                    expected: expected.clone(),
                    available: output_names,
                });
            }
        }

        tracing::info!(
            "backbone loaded from '{}' (outputs {:?})",
            config.model_path.display(),
            config.feature_outputs,
        );
        Ok(Self {
            session: Mutex::new(session),
            config,
        })
    }

    /// The configuration the backbone was loaded with.
    pub fn config(&self) -> &OnnxConfig {
        &self.config
    }
}

impl FeatureBackbone for OnnxBackbone {
    fn feature_maps(&self, image: &Array3<f32>) -> Result<[FeatureMap; 2], BackboneError> {
        let (c, h, w) = image.dim();
        // The runtime expects a leading batch axis; the crate is
        // single-image throughout, so the batch is always 1.
        let shape = vec![1usize, c, h, w];
        let data: Vec<f32> = image.iter().copied().collect();
        let input = ort::value::Value::from_array((shape.as_slice(), data))
            .map_err(|e| BackboneError::Inference(e.to_string()))?;

        let mut session = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let outputs = session
            .run(ort::inputs![self.config.input_name.as_str() => input])
            .map_err(|e| BackboneError::Inference(e.to_string()))?;

        let mut maps: Vec<FeatureMap> = Vec::with_capacity(2);
        for name in &self.config.feature_outputs {
            let value = outputs
                .get(name.as_str())
                .ok_or_else(|| BackboneError::MissingOutput(name.clone()))?;
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| BackboneError::Inference(e.to_string()))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            let (mc, mh, mw) = match dims.as_slice() {
                [1, mc, mh, mw] => (*mc, *mh, *mw),
                [mc, mh, mw] => (*mc, *mh, *mw),
                _ => {
                    return Err(BackboneError::UnexpectedShape {
                        name: name.clone(),
                        dims,
                    })
                }
            };
            let map = Array3::from_shape_vec((mc, mh, mw), data.to_vec()).map_err(|_| {
                BackboneError::UnexpectedShape {
                    name: name.clone(),
                    dims,
                }
            })?;
            maps.push(map);
        }
        drop(outputs);

        let maps: [FeatureMap; 2] = maps
            .try_into()
            .map_err(|_| BackboneError::Inference("expected exactly two feature maps".into()))?;
        Ok(maps)
    }
}
