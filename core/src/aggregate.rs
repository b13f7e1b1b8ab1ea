//! Cross-replica gradient averaging.
//!
//! A replica's backward pass yields a [`GradientBundle`]: one `(ParamId, name,
//! gradient)` record per parameter of its scope, in allocation order. Replicas
//! built from the same configuration allocate the same sequence of
//! parameters, so bundles pair up position by position. The pairing is
//! checked on slot, scope-relative name and shape rather than assumed.
//!
//! Averaging is `sum / N`. With a single replica the gradient passes through
//! untouched, so no rounding is introduced.

use crate::distributed::{Collective, CommError};
use crate::nn::Gradients;
use crate::registry::{ParamId, ParamStore, ParamValue, RegistryError, ScopeId};
use crate::tensor::{self, TensorElem, TensorError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("No gradient bundles to aggregate")]
    NoBundles,
    #[error("Gradient bundle of {scope} is misaligned at position {position}: {reason}")]
    Misaligned {
        scope: ScopeId,
        position: usize,
        reason: String,
    },
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, AggregateError>;

/// Gradient of one parameter, tagged with the parameter's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct GradEntry<T: TensorElem> {
    pub id: ParamId,
    /// Scope-relative name, identical across replicas.
    pub name: String,
    pub grad: ParamValue<T>,
}

/// All parameter gradients of one replica for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientBundle<T: TensorElem> {
    pub scope: ScopeId,
    pub entries: Vec<GradEntry<T>>,
}

impl<T: TensorElem> GradientBundle<T> {
    /// Orders `grads` by the parameters of `store`. Parameters that received no
    /// gradient contribute zeros; gradients for ids outside `store` are dropped.
    pub fn from_gradients(store: &ParamStore<T>, grads: Gradients<T>) -> Self {
        let entries = grads
            .into_ordered(store)
            .into_iter()
            .zip(store.iter())
            .map(|((id, grad), param)| GradEntry {
                id,
                name: param.name.clone(),
                grad,
            })
            .collect();
        Self {
            scope: store.scope(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of gradient elements.
    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|e| e.grad.len()).sum()
    }

    /// Checks that this bundle covers exactly the parameters of `store`, in order.
    pub fn check_owned_by(&self, store: &ParamStore<T>) -> Result<()> {
        if self.scope != store.scope() {
            return Err(self.misaligned(0, format!("bundle scope is not {}", store.scope())));
        }
        if self.len() != store.len() {
            return Err(self.misaligned(
                self.len().min(store.len()),
                format!("{} entries for {} parameters", self.len(), store.len()),
            ));
        }
        for (position, (entry, param)) in self.entries.iter().zip(store.iter()).enumerate() {
            if entry.id != param.id || entry.name != param.name {
                return Err(self.misaligned(
                    position,
                    format!("entry {} ({}) is not parameter {}", entry.id, entry.name, param.id),
                ));
            }
            if entry.grad.shape() != param.value.shape() {
                return Err(self.misaligned(
                    position,
                    format!(
                        "gradient shape {:?} for parameter shape {:?}",
                        entry.grad.shape(),
                        param.value.shape()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn misaligned(&self, position: usize, reason: String) -> AggregateError {
        AggregateError::Misaligned {
            scope: self.scope,
            position,
            reason,
        }
    }
}

/// Averaged gradient for the parameter at `slot` in every replica.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedGradient<T: TensorElem> {
    pub slot: usize,
    pub name: String,
    pub grad: ParamValue<T>,
}

/// Cross-replica mean of one step's gradients, ordered by slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedGradients<T: TensorElem> {
    entries: Vec<AveragedGradient<T>>,
}

impl<T: TensorElem> AveragedGradients<T> {
    fn from_bundle(bundle: GradientBundle<T>) -> Self {
        let entries = bundle
            .entries
            .into_iter()
            .map(|e| AveragedGradient {
                slot: e.id.slot,
                name: e.name,
                grad: e.grad,
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, slot: usize) -> Option<&AveragedGradient<T>> {
        self.entries
            .binary_search_by_key(&slot, |e| e.slot)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &AveragedGradient<T>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Checks that every bundle pairs the same slots with the same names and shapes.
pub fn check_alignment<T: TensorElem>(bundles: &[GradientBundle<T>]) -> Result<()> {
    let (reference, rest) = bundles.split_first().ok_or(AggregateError::NoBundles)?;
    for bundle in rest {
        if bundle.len() != reference.len() {
            return Err(bundle.misaligned(
                bundle.len().min(reference.len()),
                format!("{} entries, {} has {}", bundle.len(), reference.scope, reference.len()),
            ));
        }
        for (position, (a, b)) in reference.entries.iter().zip(&bundle.entries).enumerate() {
            if a.id.slot != b.id.slot || a.name != b.name {
                return Err(bundle.misaligned(
                    position,
                    format!("{} (slot {}) paired with {} (slot {})", b.name, b.id.slot, a.name, a.id.slot),
                ));
            }
            if a.grad.shape() != b.grad.shape() {
                return Err(bundle.misaligned(
                    position,
                    format!("shape {:?} paired with {:?}", b.grad.shape(), a.grad.shape()),
                ));
            }
        }
    }
    Ok(())
}

/// Checks that replica stores allocated the same parameters in the same order,
/// so that their bundles will align on every step.
pub fn check_store_alignment<T: TensorElem>(stores: &[&ParamStore<T>]) -> Result<()> {
    let (reference, rest) = stores.split_first().ok_or(AggregateError::NoBundles)?;
    for store in rest {
        let misaligned = |position: usize, reason: String| AggregateError::Misaligned {
            scope: store.scope(),
            position,
            reason,
        };
        if store.len() != reference.len() {
            return Err(misaligned(
                store.len().min(reference.len()),
                format!("{} parameters, {} has {}", store.len(), reference.scope(), reference.len()),
            ));
        }
        for (position, (a, b)) in reference.iter().zip(store.iter()).enumerate() {
            if a.id.slot != b.id.slot || a.name != b.name || a.value.shape() != b.value.shape() {
                return Err(misaligned(
                    position,
                    format!("{} {:?} paired with {} {:?}", b.name, b.value.shape(), a.name, a.value.shape()),
                ));
            }
        }
    }
    Ok(())
}

/// Averages bundles held in one place (sum in rank order, then divide by N).
pub fn average_local<T: TensorElem>(bundles: Vec<GradientBundle<T>>) -> Result<AveragedGradients<T>> {
    check_alignment(&bundles)?;
    let n = bundles.len();
    let mut iter = bundles.into_iter();
    let Some(mut acc) = iter.next() else {
        return Err(AggregateError::NoBundles);
    };
    if n == 1 {
        return Ok(AveragedGradients::from_bundle(acc));
    }

    for bundle in iter {
        for (sum, entry) in acc.entries.iter_mut().zip(bundle.entries) {
            for (s, &v) in sum.grad.data_mut().iter_mut().zip(entry.grad.data()) {
                *s += v;
            }
        }
    }
    let divisor = tensor::elem::<T>(n as f64)?;
    for entry in &mut acc.entries {
        entry.grad.data_mut().iter_mut().for_each(|v| *v = *v / divisor);
    }
    Ok(AveragedGradients::from_bundle(acc))
}

/// Averages this replica's bundle with every other rank through `collective`.
///
/// All entries travel in one packed buffer, so there is one collective call
/// per step. Every rank returns identical values.
pub fn all_reduce_average<T, C>(
    mut bundle: GradientBundle<T>,
    collective: &C,
) -> Result<AveragedGradients<T>>
where
    T: TensorElem,
    C: Collective<T> + ?Sized,
{
    let n = collective.world_size();
    if n == 1 {
        return Ok(AveragedGradients::from_bundle(bundle));
    }

    let mut packed = Vec::with_capacity(bundle.num_elements());
    for entry in &bundle.entries {
        packed.extend_from_slice(entry.grad.data());
    }
    collective.all_reduce_sum(&mut packed)?;

    let divisor = tensor::elem::<T>(n as f64)?;
    let mut offset = 0;
    for entry in &mut bundle.entries {
        let len = entry.grad.len();
        for (d, &s) in entry.grad.data_mut().iter_mut().zip(&packed[offset..offset + len]) {
            *d = s / divisor;
        }
        offset += len;
    }
    Ok(AveragedGradients::from_bundle(bundle))
}

/// Mean of one scalar over all ranks.
pub fn all_reduce_mean<T, C>(value: T, collective: &C) -> Result<T>
where
    T: TensorElem,
    C: Collective<T> + ?Sized,
{
    let n = collective.world_size();
    if n == 1 {
        return Ok(value);
    }
    let mut buf = [value];
    collective.all_reduce_sum(&mut buf)?;
    Ok(buf[0] / tensor::elem::<T>(n as f64)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Scope;
    use crate::tensor::Tensor;

    fn bundle(rank: usize, values: &[f64]) -> GradientBundle<f64> {
        let scope = Scope::device(rank).child("dense");
        let mut store = ParamStore::<f64>::new(ScopeId(rank), 0);
        let w = store.zeros(&scope, "weights", &[values.len(), 1]).unwrap();
        let b = store.zeros(&scope, "bias", &[1]).unwrap();
        let mut grads = Gradients::new();
        grads
            .record(w, ParamValue::Matrix(Tensor::new(values.to_vec(), [values.len(), 1]).unwrap()))
            .unwrap();
        grads
            .record(b, ParamValue::Vector(Tensor::new(vec![values[0]], [1]).unwrap()))
            .unwrap();
        GradientBundle::from_gradients(&store, grads)
    }

    #[test]
    fn test_single_bundle_passes_through_exactly() {
        let values = [0.1, 0.2, 0.3];
        let avg = average_local(vec![bundle(0, &values)]).unwrap();
        assert_eq!(avg.get(0).unwrap().grad.data(), &values);
        assert_eq!(avg.get(1).unwrap().name, "dense/bias");
    }

    #[test]
    fn test_average_is_sum_over_n() {
        let bundles = vec![
            bundle(0, &[1.0, 2.0]),
            bundle(1, &[3.0, 4.0]),
            bundle(2, &[5.0, 9.0]),
        ];
        let avg = average_local(bundles).unwrap();
        assert_eq!(avg.len(), 2);
        assert_eq!(avg.get(0).unwrap().grad.data(), &[3.0, 5.0]);
        assert_eq!(avg.get(1).unwrap().grad.data(), &[3.0]);
        assert!(avg.get(2).is_none());
    }

    #[test]
    fn test_misaligned_bundles_rejected() {
        let mut swapped = bundle(1, &[3.0, 4.0]);
        swapped.entries.swap(0, 1);
        let err = check_alignment(&[bundle(0, &[1.0, 2.0]), swapped]).unwrap_err();
        assert!(matches!(
            err,
            AggregateError::Misaligned { scope: ScopeId(1), position: 0, .. }
        ));

        let wider = bundle(1, &[1.0, 2.0, 3.0]);
        assert!(average_local(vec![bundle(0, &[1.0, 2.0]), wider]).is_err());
        assert!(matches!(
            check_alignment::<f64>(&[]),
            Err(AggregateError::NoBundles)
        ));
    }

    #[test]
    fn test_check_owned_by() {
        let scope = Scope::device(0);
        let mut store = ParamStore::<f64>::new(ScopeId(0), 0);
        store.zeros(&scope, "a", &[2]).unwrap();
        let own = GradientBundle::from_gradients(&store, Gradients::new());
        assert!(own.check_owned_by(&store).is_ok());
        assert_eq!(own.entries[0].grad.data(), &[0.0, 0.0]);

        let foreign = bundle(1, &[1.0]);
        assert!(foreign.check_owned_by(&store).is_err());
    }

    #[test]
    fn test_store_alignment() {
        let build = |rank: usize, shape: &[usize]| {
            let mut store = ParamStore::<f32>::new(ScopeId(rank), 0);
            store.zeros(&Scope::device(rank), "w", shape).unwrap();
            store
        };
        let (a, b, c) = (build(0, &[2, 3]), build(1, &[2, 3]), build(2, &[3, 2]));
        check_store_alignment(&[&a, &b]).unwrap();
        assert!(matches!(
            check_store_alignment(&[&a, &b, &c]),
            Err(AggregateError::Misaligned { scope: ScopeId(2), position: 0, .. })
        ));
    }
}
