use super::activation::add_row_bias;
use super::{Gradients, Result};
use crate::registry::{ParamId, ParamStore, ParamValue, Scope};
use crate::tensor::{Tensor, TensorElem};

/// Fully connected layer: `y = x W + b`.
///
/// `W` is `[in, out]` and Glorot-initialised; `b` is `[out]` and starts at zero.
/// The input must already be flat (`[batch, in]`).
#[derive(Debug, Clone)]
pub struct Dense {
    pub weight: ParamId,
    pub bias: ParamId,
    pub in_features: usize,
    pub out_features: usize,
}

impl Dense {
    pub fn new<T: TensorElem>(
        store: &mut ParamStore<T>,
        scope: &Scope,
        in_features: usize,
        out_features: usize,
    ) -> Result<Self> {
        let weight = store.allocate(scope, "weights", &[in_features, out_features])?;
        let bias = store.zeros(scope, "bias", &[out_features])?;
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn forward<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        input: &Tensor<T, 2>,
    ) -> Result<Tensor<T, 2>> {
        let mut out = input.matmul(store.matrix(self.weight)?)?;
        add_row_bias(&mut out, store.vector(self.bias)?);
        Ok(out)
    }

    /// `dX = dY Wᵀ`, `dW = Xᵀ dY`, `db = Σ_batch dY`.
    pub fn backward<T: TensorElem>(
        &self,
        store: &ParamStore<T>,
        input: &Tensor<T, 2>,
        grad_out: &Tensor<T, 2>,
        grads: &mut Gradients<T>,
    ) -> Result<Tensor<T, 2>> {
        let weight = store.matrix(self.weight)?;
        let dx = grad_out.matmul(&weight.transpose()?)?;
        let dw = input.transpose()?.matmul(grad_out)?;
        grads.record(self.weight, ParamValue::Matrix(dw))?;
        grads.record(self.bias, ParamValue::Vector(grad_out.sum_rows()))?;
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::testutil::{dot, values};
    use crate::registry::ScopeId;

    #[test]
    fn test_dense_forward_with_bias() {
        let scope = Scope::device(0).child("logits");
        let mut store = ParamStore::<f32>::new(ScopeId(0), 0);
        let dense = Dense::new(&mut store, &scope, 3, 2).unwrap();
        assert_eq!(store.get(dense.bias).unwrap().name, "logits/bias");

        store
            .value_mut(dense.weight)
            .unwrap()
            .data_mut()
            .copy_from_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        store
            .value_mut(dense.bias)
            .unwrap()
            .data_mut()
            .copy_from_slice(&[0.5, -0.5]);

        let x = Tensor::new(vec![1.0, 2.0, 3.0], [1, 3]).unwrap();
        let y = dense.forward(&store, &x).unwrap();
        assert_eq!(y.data(), &[4.5, 4.5]);
    }

    #[test]
    fn test_dense_backward() {
        let scope = Scope::device(0);
        let mut store = ParamStore::<f64>::new(ScopeId(0), 1);
        let dense = Dense::new(&mut store, &scope, 4, 3).unwrap();
        let x = Tensor::new(values(2 * 4, 5), [2, 4]).unwrap();
        let dy = Tensor::new(values(2 * 3, 6), [2, 3]).unwrap();

        let mut grads = Gradients::new();
        let dx = dense.backward(&store, &x, &dy, &mut grads).unwrap();
        assert_eq!(dx.shape(), &[2, 4]);

        let db = grads.get(dense.bias).unwrap().data().to_vec();
        assert!((db[0] - (dy.data()[0] + dy.data()[3])).abs() < 1e-12);

        // The objective is linear in x, so a unit bump recovers dx exactly.
        let base = dot(dense.forward(&store, &x).unwrap().data(), dy.data());
        let mut bumped = x.clone();
        bumped.data_mut()[6] += 1.0;
        let moved = dot(dense.forward(&store, &bumped).unwrap().data(), dy.data());
        assert!((moved - base - dx.data()[6]).abs() < 1e-9);
    }
}
