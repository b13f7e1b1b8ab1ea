//! ResNet-50 v1 built from the layer primitives.
//!
//! The topology is described statically by a [`ModelConfig`]. Before any
//! weight is allocated the configuration is resolved into a [`ShapePlan`]
//! holding every layer's input and output size, so a window that does not
//! fit or a residual sum with mismatched operands fails at construction.

pub mod block;
pub mod config;
pub mod resnet;

pub use block::{Bottleneck, BottleneckTrace, Shortcut};
pub use config::{
    BlockPlan, ModelConfig, ShapePlan, ShortcutKind, StageConfig, StemConfig, StridePlacement,
};
pub use resnet::{ResNet, Trace};

use crate::nn::LayerError;
use crate::tensor::TensorError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
    /// A kernel or pooling window is larger than its (padded) input.
    #[error("{layer}: window does not fit input {h}x{w}")]
    WindowTooLarge { layer: String, h: usize, w: usize },
    #[error("Input shape {got:?} does not match the planned {expected:?}")]
    InputShape { expected: Vec<usize>, got: Vec<usize> },
    #[error("Trace does not belong to this model: {0}")]
    TraceMismatch(String),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
