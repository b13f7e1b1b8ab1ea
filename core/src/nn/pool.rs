use super::Result;
use crate::tensor::{Tensor, TensorElem};

fn pooled_size(size: usize, kernel: usize, stride: usize) -> Option<usize> {
    if kernel == 0 || stride == 0 || kernel > size {
        return None;
    }
    Some((size - kernel) / stride + 1)
}

/// 2D Max Pooling Layer. Square window, no padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool2d {
    pub kernel_size: usize,
    pub stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
        }
    }

    pub fn output_size(&self, size: usize) -> Option<usize> {
        pooled_size(size, self.kernel_size, self.stride)
    }

    pub fn forward<T: TensorElem>(&self, input: &Tensor<T, 4>) -> Result<Tensor<T, 4>> {
        Ok(input.max_pool2d([self.kernel_size; 2], [self.stride; 2])?)
    }

    /// Routes each output gradient to the maximum of its window in `input`.
    pub fn backward<T: TensorElem>(
        &self,
        input: &Tensor<T, 4>,
        grad_out: &Tensor<T, 4>,
    ) -> Result<Tensor<T, 4>> {
        Ok(input.max_pool2d_backward(grad_out, [self.kernel_size; 2], [self.stride; 2])?)
    }
}

/// 2D Average Pooling Layer. Square window, no padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvgPool2d {
    pub kernel_size: usize,
    pub stride: usize,
}

impl AvgPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
        }
    }

    pub fn output_size(&self, size: usize) -> Option<usize> {
        pooled_size(size, self.kernel_size, self.stride)
    }

    pub fn forward<T: TensorElem>(&self, input: &Tensor<T, 4>) -> Result<Tensor<T, 4>> {
        Ok(input.avg_pool2d([self.kernel_size; 2], [self.stride; 2])?)
    }

    /// Spreads each output gradient evenly over its window.
    pub fn backward<T: TensorElem>(
        &self,
        input_shape: [usize; 4],
        grad_out: &Tensor<T, 4>,
    ) -> Result<Tensor<T, 4>> {
        Ok(Tensor::avg_pool2d_backward(
            input_shape,
            grad_out,
            [self.kernel_size; 2],
            [self.stride; 2],
        )?)
    }
}
