//! Tensor operations.
//!
//! Element-wise arithmetic requires identical shapes (no broadcasting).
//! Convolution, pooling, normalisation and matrix products delegate to the
//! `resnet_replica_kernels` crate; each forward op used in training has its
//! backward counterpart here.

use super::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rayon::prelude::*;
use resnet_replica_kernels::{self as kernels, Conv2dGeometry, LrnParams, PoolGeometry};
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                self.zip_map(rhs, |a, b| a.$method(b))
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    fn check_same_shape(&self, rhs: &Self) -> Result<()> {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        Ok(())
    }

    /// Applies a function element-wise to the tensor.
    ///
    /// ```rust
    /// use resnet_replica::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Combines two same-shaped tensors element by element.
    pub fn zip_map<F>(&self, rhs: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        self.check_same_shape(rhs)?;
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .zip(rhs.data.par_iter())
            .for_each(|((o, a), b)| *o = f(*a, *b));
        Ok(out)
    }

    /// In-place `self += rhs`.
    pub fn add_assign(&mut self, rhs: &Self) -> Result<()> {
        self.check_same_shape(rhs)?;
        self.data
            .par_iter_mut()
            .zip(rhs.data.par_iter())
            .for_each(|(a, b)| *a += *b);
        Ok(())
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|v| v * factor)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &v| acc + v)
    }

    /// Swaps the last two dimensions.
    pub fn transpose(&self) -> Result<Self> {
        const { assert!(RANK >= 2, "Transpose requires rank >= 2") };
        let data = kernels::cpu_transpose(&self.data, &self.shape)?;
        let mut shape = self.shape;
        shape.swap(RANK - 1, RANK - 2);
        Tensor::new(data, shape)
    }

    /// Batched matrix multiplication over the last two dimensions:
    /// `[..., M, K] x [..., K, N] -> [..., M, N]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        let data = kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        let mut shape = self.shape;
        shape[RANK - 1] = rhs.shape[RANK - 1];
        Tensor::new(data, shape)
    }
}

impl<T: TensorElem> Tensor<T, 2> {
    /// Sums over the leading (batch) axis: `[B, N] -> [N]`.
    pub fn sum_rows(&self) -> Tensor<T, 1> {
        let cols = self.shape[1];
        let mut out = vec![T::zero(); cols];
        for row in self.data.chunks(cols.max(1)) {
            for (o, &v) in out.iter_mut().zip(row) {
                *o += v;
            }
        }
        Tensor {
            shape: [cols],
            strides: [1],
            data: out,
        }
    }
}

impl<T: TensorElem> Tensor<T, 4> {
    /// 2D convolution of an NCHW input with an `[out, in, k_h, k_w]` filter,
    /// after symmetric zero padding.
    pub fn conv2d(
        &self,
        filter: &Tensor<T, 4>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Tensor<T, 4>> {
        let geom = Conv2dGeometry::new(&self.shape, &filter.shape, stride, padding)?;
        let data = kernels::cpu_conv2d(&self.data, &filter.data, &geom)?;
        Tensor::new(data, geom.output_shape())
    }

    /// Gradients of [`Tensor::conv2d`] with respect to the input (`self`) and the filter.
    pub fn conv2d_backward(
        &self,
        filter: &Tensor<T, 4>,
        grad_out: &Tensor<T, 4>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<(Tensor<T, 4>, Tensor<T, 4>)> {
        let geom = Conv2dGeometry::new(&self.shape, &filter.shape, stride, padding)?;
        if grad_out.shape != geom.output_shape() {
            return Err(TensorError::ShapeMismatch {
                expected: geom.output_shape().to_vec(),
                got: grad_out.shape.to_vec(),
            });
        }
        let (dx, dw) = rayon::join(
            || kernels::cpu_conv2d_backward_input(&grad_out.data, &filter.data, &geom),
            || kernels::cpu_conv2d_backward_filter(&self.data, &grad_out.data, &geom),
        );
        Ok((
            Tensor::new(dx?, geom.input_shape())?,
            Tensor::new(dw?, geom.filter_shape())?,
        ))
    }

    /// Filter gradient of [`Tensor::conv2d`] alone, for layers whose input needs no gradient.
    pub fn conv2d_filter_grad(
        &self,
        filter_shape: [usize; 4],
        grad_out: &Tensor<T, 4>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Tensor<T, 4>> {
        let geom = Conv2dGeometry::new(&self.shape, &filter_shape, stride, padding)?;
        let dw = kernels::cpu_conv2d_backward_filter(&self.data, &grad_out.data, &geom)?;
        Tensor::new(dw, geom.filter_shape())
    }

    /// Unpadded strided max pooling.
    pub fn max_pool2d(&self, kernel: [usize; 2], stride: [usize; 2]) -> Result<Tensor<T, 4>> {
        let geom = PoolGeometry::new(&self.shape, kernel, stride)?;
        Tensor::new(kernels::cpu_max_pool2d(&self.data, &geom)?, geom.output_shape())
    }

    /// Gradient of [`Tensor::max_pool2d`] with respect to `self`.
    pub fn max_pool2d_backward(
        &self,
        grad_out: &Tensor<T, 4>,
        kernel: [usize; 2],
        stride: [usize; 2],
    ) -> Result<Tensor<T, 4>> {
        let geom = PoolGeometry::new(&self.shape, kernel, stride)?;
        let data = kernels::cpu_max_pool2d_backward(&self.data, &grad_out.data, &geom)?;
        Tensor::new(data, self.shape)
    }

    /// Unpadded strided average pooling.
    pub fn avg_pool2d(&self, kernel: [usize; 2], stride: [usize; 2]) -> Result<Tensor<T, 4>> {
        let geom = PoolGeometry::new(&self.shape, kernel, stride)?;
        Tensor::new(kernels::cpu_avg_pool2d(&self.data, &geom)?, geom.output_shape())
    }

    /// Gradient of [`Tensor::avg_pool2d`]; only the input shape is needed.
    pub fn avg_pool2d_backward(
        input_shape: [usize; 4],
        grad_out: &Tensor<T, 4>,
        kernel: [usize; 2],
        stride: [usize; 2],
    ) -> Result<Tensor<T, 4>> {
        let geom = PoolGeometry::new(&input_shape, kernel, stride)?;
        let data = kernels::cpu_avg_pool2d_backward(&grad_out.data, &geom)?;
        Tensor::new(data, input_shape)
    }
}

impl<T: TensorElem + Float> Tensor<T, 4> {
    /// Local response normalisation across channels.
    pub fn lrn(&self, params: &LrnParams) -> Result<Tensor<T, 4>> {
        Tensor::new(kernels::cpu_lrn(&self.data, &self.shape, params)?, self.shape)
    }

    /// Gradient of [`Tensor::lrn`] with respect to `self`.
    pub fn lrn_backward(&self, grad_out: &Tensor<T, 4>, params: &LrnParams) -> Result<Tensor<T, 4>> {
        let data = kernels::cpu_lrn_backward(&self.data, &grad_out.data, &self.shape, params)?;
        Tensor::new(data, self.shape)
    }
}
