//! Local response normalisation.
//!
//! $$ y_c = x_c \cdot \left(k + \alpha \sum_{|j - c| \le r} x_j^2\right)^{-\beta} $$
//!
//! with `r = 4`, `k = 1.0`, `alpha = 0.001 / 9`, `beta = 0.75`. The layer is
//! parameter-free.

use super::Result;
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;
use resnet_replica_kernels::LrnParams;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalResponseNorm {
    pub params: LrnParams,
}

impl LocalResponseNorm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward<T: TensorElem + Float>(&self, input: &Tensor<T, 4>) -> Result<Tensor<T, 4>> {
        Ok(input.lrn(&self.params)?)
    }

    pub fn backward<T: TensorElem + Float>(
        &self,
        input: &Tensor<T, 4>,
        grad_out: &Tensor<T, 4>,
    ) -> Result<Tensor<T, 4>> {
        Ok(input.lrn_backward(grad_out, &self.params)?)
    }
}
