use super::{Gradients, Result};
use crate::registry::{ParamId, ParamStore, ParamValue, Scope};
use crate::tensor::{Tensor, TensorElem};
use serde::{Deserialize, Serialize};

/// Static description of a square convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvSpec {
    pub const fn new(out_channels: usize, kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            out_channels,
            kernel,
            stride,
            padding,
        }
    }

    /// Output height/width for an input of `size`, or `None` if the kernel
    /// does not fit the padded input.
    pub fn output_size(&self, size: usize) -> Option<usize> {
        let padded = size + 2 * self.padding;
        if self.kernel == 0 || self.stride == 0 || padded < self.kernel {
            return None;
        }
        Some((padded - self.kernel) / self.stride + 1)
    }
}

/// 2D Convolution Layer.
///
/// Symmetric zero padding followed by a strided "valid" convolution against a
/// registry-allocated `[out, in, k, k]` filter. There is no bias.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: ParamId,
    pub in_channels: usize,
    pub spec: ConvSpec,
}

impl Conv2d {
    /// Allocates the filter as `<scope>/weights`.
    pub fn new<T: TensorElem>(
        store: &mut ParamStore<T>,
        scope: &Scope,
        in_channels: usize,
        spec: ConvSpec,
    ) -> Result<Self> {
        let shape = [spec.out_channels, in_channels, spec.kernel, spec.kernel];
        let weight = store.allocate(scope, "weights", &shape)?;
        Ok(Self {
            weight,
            in_channels,
            spec,
        })
    }

    fn stride(&self) -> [usize; 2] {
        [self.spec.stride; 2]
    }

    fn padding(&self) -> [usize; 2] {
        [self.spec.padding; 2]
    }

    pub fn forward<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        input: &Tensor<T, 4>,
    ) -> Result<Tensor<T, 4>> {
        let filter = store.filter(self.weight)?;
        Ok(input.conv2d(filter, self.stride(), self.padding())?)
    }

    /// Records the filter gradient and returns the input gradient.
    pub fn backward<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        input: &Tensor<T, 4>,
        grad_out: &Tensor<T, 4>,
        grads: &mut Gradients<T>,
    ) -> Result<Tensor<T, 4>> {
        let filter = store.filter(self.weight)?;
        let (dx, dw) = input.conv2d_backward(filter, grad_out, self.stride(), self.padding())?;
        grads.record(self.weight, ParamValue::Filter(dw))?;
        Ok(dx)
    }

    /// Records the filter gradient only.
    pub fn backward_filter<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        input: &Tensor<T, 4>,
        grad_out: &Tensor<T, 4>,
        grads: &mut Gradients<T>,
    ) -> Result<()> {
        let shape = *store.filter(self.weight)?.shape();
        let dw = input.conv2d_filter_grad(shape, grad_out, self.stride(), self.padding())?;
        grads.record(self.weight, ParamValue::Filter(dw))
    }
}
