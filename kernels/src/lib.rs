//! CPU kernels for the ResNet replica trainer.
//!
//! Every kernel works on flat, row-major slices plus explicit shapes so the
//! tensor crate can swap in another backend without touching layer code.
//! Each forward kernel used in training has a matching backward kernel.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_conv2d;
pub mod cpu_lrn;
pub mod cpu_matmul;
pub mod cpu_pool;
pub mod cpu_transpose;

pub use cpu_conv2d::{
    cpu_conv2d, cpu_conv2d_backward_filter, cpu_conv2d_backward_input, Conv2dGeometry,
};
pub use cpu_lrn::{cpu_lrn, cpu_lrn_backward, LrnParams};
pub use cpu_matmul::cpu_matmul;
pub use cpu_pool::{
    cpu_avg_pool2d, cpu_avg_pool2d_backward, cpu_max_pool2d, cpu_max_pool2d_backward,
    PoolGeometry,
};
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// Window, stride or padding cannot be applied to the given input.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
    /// A hyperparameter does not fit into the element type.
    #[error("Value {0} is not representable in the element type")]
    Unrepresentable(f64),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Converts an `f64` hyperparameter into the kernel element type.
pub fn cast<T: KernelElem>(value: f64) -> Result<T> {
    T::from_f64(value).ok_or(KernelError::Unrepresentable(value))
}

/// Checks that `data` holds exactly `shape.iter().product()` elements.
pub(crate) fn check_len<T>(data: &[T], shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(KernelError::ShapeMismatch {
            expected: vec![expected],
            got: vec![data.len()],
        });
    }
    Ok(())
}

/// Checks that `shape` is rank 4 (NCHW) and returns it as an array.
pub(crate) fn nchw(shape: &[usize]) -> Result<[usize; 4]> {
    match shape {
        &[n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(KernelError::ShapeMismatch {
            expected: vec![4],
            got: vec![shape.len()],
        }),
    }
}
