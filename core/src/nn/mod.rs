//! Layer primitives over NCHW activations.
//!
//! Layers hold only their hyperparameters and the [`ParamId`]s of the weights
//! they allocated in a [`ParamStore`]; the values live in the store. Every
//! layer has a hand-written `backward` that consumes the cached forward input
//! and records parameter gradients into a [`Gradients`] collector.

pub mod activation;
pub mod conv;
pub mod dense;
pub mod norm;
pub mod pool;

pub use activation::{flatten, relu, relu_backward, unflatten};
pub use conv::{Conv2d, ConvSpec};
pub use dense::Dense;
pub use norm::LocalResponseNorm;
pub use pool::{AvgPool2d, MaxPool2d};

use crate::registry::{ParamId, ParamStore, ParamValue, RegistryError};
use crate::tensor::{TensorElem, TensorError};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Parameter gradients of one backward pass, ordered by [`ParamId`].
#[derive(Debug, Clone, Default)]
pub struct Gradients<T: TensorElem> {
    grads: BTreeMap<ParamId, ParamValue<T>>,
}

impl<T: TensorElem> Gradients<T> {
    pub fn new() -> Self {
        Self {
            grads: BTreeMap::new(),
        }
    }

    /// Records `grad` for `id`, accumulating if the parameter was already seen.
    pub fn record(&mut self, id: ParamId, grad: ParamValue<T>) -> Result<()> {
        match self.grads.get_mut(&id) {
            Some(existing) => {
                if existing.shape() != grad.shape() {
                    return Err(TensorError::ShapeMismatch {
                        expected: existing.shape(),
                        got: grad.shape(),
                    }
                    .into());
                }
                for (a, &b) in existing.data_mut().iter_mut().zip(grad.data()) {
                    *a += b;
                }
            }
            None => {
                self.grads.insert(id, grad);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: ParamId) -> Option<&ParamValue<T>> {
        self.grads.get(&id)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Takes the gradient of every parameter in `store`, in allocation order.
    /// Parameters that received no gradient get zeros.
    pub fn into_ordered(mut self, store: &ParamStore<T>) -> Vec<(ParamId, ParamValue<T>)> {
        store
            .iter()
            .map(|p| {
                let grad = self
                    .grads
                    .remove(&p.id)
                    .unwrap_or_else(|| p.value.zeros_like());
                (p.id, grad)
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Scope, ScopeId};
    use crate::tensor::Tensor;

    #[test]
    fn test_gradients_accumulate_and_order() {
        let root = Scope::device(0);
        let mut store = ParamStore::<f32>::new(ScopeId(0), 0);
        let a = store.zeros(&root, "a", &[2]).unwrap();
        let b = store.zeros(&root, "b", &[3]).unwrap();

        let mut grads = Gradients::new();
        grads
            .record(a, ParamValue::Vector(Tensor::ones([2])))
            .unwrap();
        grads
            .record(a, ParamValue::Vector(Tensor::ones([2])))
            .unwrap();
        assert!(grads
            .record(a, ParamValue::Vector(Tensor::ones([3])))
            .is_err());

        let ordered = grads.into_ordered(&store);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].0, a);
        assert_eq!(ordered[0].1.data(), &[2.0, 2.0]);
        assert_eq!(ordered[1].0, b);
        assert_eq!(ordered[1].1.data(), &[0.0; 3]);
    }

    #[test]
    fn test_values_are_seeded() {
        let a = testutil::values(64, 7);
        assert_eq!(a, testutil::values(64, 7));
        assert_ne!(a, testutil::values(64, 8));
        assert!(a.iter().all(|v| (-1.0..1.0).contains(v)));
    }
}
