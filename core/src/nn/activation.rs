//! Activation and reshaping helpers.
//!
//! - **ReLU**: $f(x) = \max(0, x)$, used after every convolution of the
//!   residual network.
//! - **Flatten**: `[B, C, H, W] -> [B, C * H * W]` in row-major order, used
//!   once in front of the classification head.

use super::Result;
use crate::tensor::{Tensor, TensorElem};
use rayon::prelude::*;

/// Applies ReLU element-wise.
pub fn relu<T: TensorElem, const RANK: usize>(x: &Tensor<T, RANK>) -> Tensor<T, RANK> {
    x.map(|v| if v > T::zero() { v } else { T::zero() })
}

/// Gradient of [`relu`].
///
/// `activated` may be either the ReLU input or its output: both are positive
/// at exactly the same positions.
pub fn relu_backward<T: TensorElem, const RANK: usize>(
    activated: &Tensor<T, RANK>,
    grad_out: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>> {
    Ok(activated.zip_map(grad_out, |a, g| if a > T::zero() { g } else { T::zero() })?)
}

/// Reshapes `[B, C, H, W]` to `[B, C * H * W]` without moving elements.
pub fn flatten<T: TensorElem>(x: Tensor<T, 4>) -> Result<Tensor<T, 2>> {
    let [b, c, h, w] = *x.shape();
    Ok(x.reshape([b, c * h * w])?)
}

/// Inverse of [`flatten`], used to route gradients back to the 4D activation.
pub fn unflatten<T: TensorElem>(x: Tensor<T, 2>, shape: [usize; 4]) -> Result<Tensor<T, 4>> {
    Ok(x.reshape(shape)?)
}

/// Adds a per-column `bias` to every row of `x`.
pub(crate) fn add_row_bias<T: TensorElem>(x: &mut Tensor<T, 2>, bias: &Tensor<T, 1>) {
    let cols = bias.data();
    x.data_mut()
        .par_chunks_mut(cols.len().max(1))
        .for_each(|row| {
            for (v, &b) in row.iter_mut().zip(cols) {
                *v += b;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_and_backward() {
        let x = Tensor::<f32, 1>::new(vec![-1.0, 0.0, 2.0], [3]).unwrap();
        let y = relu(&x);
        assert_eq!(y.data(), &[0.0, 0.0, 2.0]);

        let g = Tensor::<f32, 1>::new(vec![5.0, 5.0, 5.0], [3]).unwrap();
        assert_eq!(relu_backward(&y, &g).unwrap().data(), &[0.0, 0.0, 5.0]);
        assert_eq!(relu_backward(&x, &g).unwrap().data(), &[0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_flatten_preserves_row_major_order() {
        let data: Vec<f32> = (0..2 * 3 * 2 * 2).map(|v| v as f32).collect();
        let x = Tensor::<f32, 4>::new(data.clone(), [2, 3, 2, 2]).unwrap();
        let flat = flatten(x.clone()).unwrap();
        assert_eq!(flat.shape(), &[2, 12]);
        assert_eq!(flat.data(), &data[..]);
        assert_eq!(flat.get([1, 5]).unwrap(), x.get([1, 1, 0, 1]).unwrap());

        let back = unflatten(flat, [2, 3, 2, 2]).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn test_add_row_bias() {
        let mut x = Tensor::<f32, 2>::zeros([2, 3]);
        let b = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
        add_row_bias(&mut x, &b);
        assert_eq!(x.data(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }
}
