//! Scoped parameter allocation.
//!
//! Every replica owns one [`ParamStore`] rooted at its device scope
//! (`gpu_<rank>`). Layers allocate their weights through the store while the
//! model is being built, so the store's contents are exactly the parameter
//! set that replica's optimizer may touch. Ids carry the owning [`ScopeId`]
//! and lookups reject ids minted by another store.
//!
//! Initial values are Glorot-uniform in `[-limit, limit]` with
//! `limit = sqrt(6 / (fan_in + fan_out))`, drawn from an RNG seeded with
//! `base_seed + slot`. Two stores that allocate the same sequence of shapes
//! therefore start bit-identical.

use crate::tensor::{self, Tensor, TensorElem, TensorError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Unsupported parameter rank {rank} for shape {shape:?}")]
    UnsupportedRank { rank: usize, shape: Vec<usize> },
    #[error("Parameter shape {0:?} has an empty dimension")]
    EmptyShape(Vec<usize>),
    #[error("Parameter {id} does not belong to scope {owner}")]
    ForeignParameter { id: ParamId, owner: ScopeId },
    #[error("Scope {scope} cannot allocate into the store of {owner}")]
    ForeignScope { scope: String, owner: ScopeId },
    #[error("Unknown parameter slot {0}")]
    UnknownSlot(usize),
    #[error("Parameter {name} is a {actual}, expected a {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Identity of a device scope; equal to the device rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub usize);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu_{}", self.0)
    }
}

/// A parameter's identity: owning device scope plus allocation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId {
    pub scope: ScopeId,
    pub slot: usize,
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.scope, self.slot)
    }
}

/// Hierarchical namespace. The root is a device scope; children extend the
/// scope-relative path (`stage2/block0/reduce`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    id: ScopeId,
    relative: Vec<String>,
}

impl Scope {
    pub fn device(rank: usize) -> Self {
        Self {
            id: ScopeId(rank),
            relative: Vec::new(),
        }
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut relative = self.relative.clone();
        relative.push(name.into());
        Self {
            id: self.id,
            relative,
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Path below the device root, `""` for the root itself.
    pub fn relative_path(&self) -> String {
        self.relative.join("/")
    }

    /// Fully qualified path including the device root.
    pub fn path(&self) -> String {
        if self.relative.is_empty() {
            self.id.to_string()
        } else {
            format!("{}/{}", self.id, self.relative_path())
        }
    }

    fn relative_name(&self, leaf: &str) -> String {
        if self.relative.is_empty() {
            leaf.to_string()
        } else {
            format!("{}/{}", self.relative_path(), leaf)
        }
    }
}

/// Storage for one parameter. Ranks are fixed by the layer kinds that exist:
/// biases are vectors, dense weights matrices and conv weights filters.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue<T: TensorElem> {
    Vector(Tensor<T, 1>),
    Matrix(Tensor<T, 2>),
    Filter(Tensor<T, 4>),
}

impl<T: TensorElem> ParamValue<T> {
    /// Wraps a flat buffer in the variant matching `shape`'s rank.
    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        Ok(match *shape {
            [a] => ParamValue::Vector(Tensor::new(data, [a])?),
            [a, b] => ParamValue::Matrix(Tensor::new(data, [a, b])?),
            [a, b, c, d] => ParamValue::Filter(Tensor::new(data, [a, b, c, d])?),
            _ => {
                return Err(RegistryError::UnsupportedRank {
                    rank: shape.len(),
                    shape: shape.to_vec(),
                })
            }
        })
    }

    pub fn zeros(shape: &[usize]) -> Result<Self> {
        let size = shape.iter().product();
        Self::from_vec(vec![T::zero(); size], shape)
    }

    pub fn zeros_like(&self) -> Self {
        match self {
            ParamValue::Vector(t) => ParamValue::Vector(Tensor::zeros(*t.shape())),
            ParamValue::Matrix(t) => ParamValue::Matrix(Tensor::zeros(*t.shape())),
            ParamValue::Filter(t) => ParamValue::Filter(Tensor::zeros(*t.shape())),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            ParamValue::Vector(t) => t.shape().to_vec(),
            ParamValue::Matrix(t) => t.shape().to_vec(),
            ParamValue::Filter(t) => t.shape().to_vec(),
        }
    }

    pub fn data(&self) -> &[T] {
        match self {
            ParamValue::Vector(t) => t.data(),
            ParamValue::Matrix(t) => t.data(),
            ParamValue::Filter(t) => t.data(),
        }
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        match self {
            ParamValue::Vector(t) => t.data_mut(),
            ParamValue::Matrix(t) => t.data_mut(),
            ParamValue::Filter(t) => t.data_mut(),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            ParamValue::Vector(_) => "vector",
            ParamValue::Matrix(_) => "matrix",
            ParamValue::Filter(_) => "filter",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter<T: TensorElem> {
    pub id: ParamId,
    /// Scope-relative name, identical across replicas.
    pub name: String,
    pub value: ParamValue<T>,
}

impl<T: TensorElem> Parameter<T> {
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.id.scope, self.name)
    }
}

/// `(fan_in, fan_out)` of a dense `[in, out]` or conv `[out, in, k_h, k_w]` shape.
pub fn fan_in_out(shape: &[usize]) -> Result<(usize, usize)> {
    match *shape {
        [fan_in, fan_out] => Ok((fan_in, fan_out)),
        [out, inp, kh, kw] => Ok((kh * kw * inp, kh * kw * out)),
        _ => Err(RegistryError::UnsupportedRank {
            rank: shape.len(),
            shape: shape.to_vec(),
        }),
    }
}

pub fn glorot_limit(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Parameters of one device scope, in allocation order.
#[derive(Debug, Clone)]
pub struct ParamStore<T: TensorElem> {
    scope: ScopeId,
    seed: u64,
    params: Vec<Parameter<T>>,
}

impl<T: TensorElem> ParamStore<T> {
    pub fn new(scope: ScopeId, seed: u64) -> Self {
        Self {
            scope,
            seed,
            params: Vec::new(),
        }
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Allocates a Glorot-uniform parameter named `name` under `scope`.
    ///
    /// # Errors
    ///
    /// `UnsupportedRank` unless `shape` is rank 2 or 4, `EmptyShape` for a
    /// zero-sized dimension, `ForeignScope` if `scope` belongs to another device.
    pub fn allocate(&mut self, scope: &Scope, name: &str, shape: &[usize]) -> Result<ParamId> {
        self.check_scope(scope)?;
        let (fan_in, fan_out) = fan_in_out(shape)?;
        if shape.contains(&0) {
            return Err(RegistryError::EmptyShape(shape.to_vec()));
        }
        let limit = glorot_limit(fan_in, fan_out);
        let slot = self.params.len();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(slot as u64));
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| tensor::elem(rng.random_range(-limit..=limit)))
            .collect::<tensor::Result<Vec<T>>>()?;
        self.push(scope, name, ParamValue::from_vec(data, shape)?)
    }

    /// Allocates a zero-initialised parameter (rank 1, 2 or 4).
    pub fn zeros(&mut self, scope: &Scope, name: &str, shape: &[usize]) -> Result<ParamId> {
        self.check_scope(scope)?;
        if shape.contains(&0) {
            return Err(RegistryError::EmptyShape(shape.to_vec()));
        }
        self.push(scope, name, ParamValue::zeros(shape)?)
    }

    fn check_scope(&self, scope: &Scope) -> Result<()> {
        if scope.id() != self.scope {
            return Err(RegistryError::ForeignScope {
                scope: scope.path(),
                owner: self.scope,
            });
        }
        Ok(())
    }

    fn push(&mut self, scope: &Scope, name: &str, value: ParamValue<T>) -> Result<ParamId> {
        let id = ParamId {
            scope: self.scope,
            slot: self.params.len(),
        };
        self.params.push(Parameter {
            id,
            name: scope.relative_name(name),
            value,
        });
        Ok(id)
    }

    pub fn get(&self, id: ParamId) -> Result<&Parameter<T>> {
        self.check_id(id)?;
        self.params
            .get(id.slot)
            .ok_or(RegistryError::UnknownSlot(id.slot))
    }

    pub fn value_mut(&mut self, id: ParamId) -> Result<&mut ParamValue<T>> {
        self.check_id(id)?;
        self.params
            .get_mut(id.slot)
            .map(|p| &mut p.value)
            .ok_or(RegistryError::UnknownSlot(id.slot))
    }

    pub fn filter(&self, id: ParamId) -> Result<&Tensor<T, 4>> {
        match self.get(id)? {
            Parameter {
                value: ParamValue::Filter(t),
                ..
            } => Ok(t),
            p => Err(wrong_kind(p, "filter")),
        }
    }

    pub fn matrix(&self, id: ParamId) -> Result<&Tensor<T, 2>> {
        match self.get(id)? {
            Parameter {
                value: ParamValue::Matrix(t),
                ..
            } => Ok(t),
            p => Err(wrong_kind(p, "matrix")),
        }
    }

    pub fn vector(&self, id: ParamId) -> Result<&Tensor<T, 1>> {
        match self.get(id)? {
            Parameter {
                value: ParamValue::Vector(t),
                ..
            } => Ok(t),
            p => Err(wrong_kind(p, "vector")),
        }
    }

    fn check_id(&self, id: ParamId) -> Result<()> {
        if id.scope != self.scope {
            return Err(RegistryError::ForeignParameter {
                id,
                owner: self.scope,
            });
        }
        Ok(())
    }

    /// This scope's parameter ids in allocation order.
    pub fn ids(&self) -> Vec<ParamId> {
        self.params.iter().map(|p| p.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter<T>> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar weights.
    pub fn num_elements(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }
}

fn wrong_kind<T: TensorElem>(p: &Parameter<T>, expected: &'static str) -> RegistryError {
    RegistryError::WrongKind {
        name: p.name.clone(),
        expected,
        actual: p.value.kind(),
    }
}
