//! Per-replica optimizers.
//!
//! A replica owns one optimizer and feeds it the averaged gradient of each of
//! its parameters. State (accumulators, moments) is keyed by the parameter's
//! slot, so an optimizer never sees another replica's weights.

pub mod adagrad;
pub mod adamw;
pub mod sgd;

pub use adagrad::Adagrad;
pub use adamw::AdamW;
pub use sgd::Sgd;

use crate::tensor::{self, Result, TensorElem, TensorError};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Updates parameters in place from their gradients.
pub trait Optimizer<T: TensorElem>: Send {
    /// Applies one update to the parameter stored at `slot`.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if `param` and `grad` differ in length.
    fn update(&mut self, slot: usize, param: &mut [T], grad: &[T]) -> Result<()>;

    fn name(&self) -> &'static str;
}

pub(crate) fn check_len<T>(param: &[T], grad: &[T]) -> Result<()> {
    if param.len() != grad.len() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![param.len()],
            got: vec![grad.len()],
        });
    }
    Ok(())
}

/// Optimizer selected in the training configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adagrad,
    Momentum,
    Sgd,
    Adamw,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptimizerKind::Adagrad => "adagrad",
            OptimizerKind::Momentum => "momentum",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adamw => "adamw",
        })
    }
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adagrad" => Ok(OptimizerKind::Adagrad),
            "momentum" => Ok(OptimizerKind::Momentum),
            "sgd" => Ok(OptimizerKind::Sgd),
            "adamw" | "adam" => Ok(OptimizerKind::Adamw),
            other => Err(format!(
                "unknown optimizer `{other}` (expected adagrad, momentum, sgd or adamw)"
            )),
        }
    }
}

/// Builds the optimizer for `kind`. `momentum` is only read by
/// [`OptimizerKind::Momentum`].
pub fn build_optimizer<T: TensorElem + Float + 'static>(
    kind: OptimizerKind,
    learning_rate: f64,
    momentum: f64,
) -> Result<Box<dyn Optimizer<T>>> {
    let lr = tensor::elem::<T>(learning_rate)?;
    Ok(match kind {
        OptimizerKind::Adagrad => Box::new(Adagrad::new(lr)?),
        OptimizerKind::Momentum => Box::new(Sgd::new(lr).with_momentum(tensor::elem(momentum)?)),
        OptimizerKind::Sgd => Box::new(Sgd::new(lr)),
        OptimizerKind::Adamw => Box::new(AdamW::new(lr)?),
    })
}
