//! Core Tensor implementation.
//!
//! A [`Tensor`] is a flat, contiguous, row-major buffer plus a shape whose
//! rank is a const generic. Activations are rank 4 in `[batch, channel,
//! height, width]` order, dense weights and logits rank 2, biases rank 1.
//!
//! ```rust
//! use resnet_replica::tensor::Tensor;
//!
//! let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//! assert_eq!(t.strides(), &[3, 1]);
//! ```

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use resnet_replica_kernels::KernelError;
use std::fmt::Debug;
use thiserror::Error;

pub mod ops;

/// Error type for Tensor operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// A window, stride or padding does not fit the input.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<KernelError> for TensorError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            KernelError::InvalidGeometry(msg) => TensorError::InvalidGeometry(msg),
            KernelError::Unrepresentable(v) => {
                TensorError::Unsupported(format!("value {v} is not representable"))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// `Send + Sync` is required because kernels run on the `rayon` pool and
/// replicas live on their own threads.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// Converts an `f64` constant into the element type.
pub fn elem<T: TensorElem>(value: f64) -> Result<T> {
    Ok(resnet_replica_kernels::cast(value)?)
}

/// An N-dimensional array of elements stored contiguously in row-major order.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
        }
    }

    /// Reshapes the tensor to a new shape. The number of elements must remain the same.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();
        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }
        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
        })
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns the underlying data as a mutable slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the tensor and returns its buffer.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Returns the total number of elements in the tensor.
    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
    }

    /// Reads one element by multi-dimensional index.
    pub fn get(&self, index: [usize; RANK]) -> Result<T> {
        let mut offset = 0;
        for (d, &i) in index.iter().enumerate() {
            if i >= self.shape[d] {
                return Err(TensorError::IndexOutOfBounds {
                    index: index.to_vec(),
                    shape: self.shape.to_vec(),
                });
            }
            offset += i * self.strides[d];
        }
        Ok(self.data[offset])
    }
}

/// Computes row-major strides for a given shape.
const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let tensor = Tensor::<f32, 2>::new(data.clone(), [2, 2]).unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.data(), &data[..]);

        let err = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zeros_ones_full() {
        assert_eq!(Tensor::<f32, 2>::zeros([2, 3]).data(), &[0.0; 6]);
        assert_eq!(Tensor::<f32, 2>::ones([2, 3]).data(), &[1.0; 6]);
        assert_eq!(Tensor::<f32, 1>::full([3], 7.0).data(), &[7.0; 3]);
    }

    #[test]
    fn test_reshape() {
        let tensor = Tensor::<f32, 2>::zeros([2, 3]);
        let reshaped = tensor.reshape([3, 2]).unwrap();
        assert_eq!(reshaped.shape(), &[3, 2]);

        let err = reshaped.clone().reshape([4, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_get_and_strides() {
        let t = Tensor::<f32, 3>::new((0..24).map(|v| v as f32).collect(), [2, 3, 4]).unwrap();
        assert_eq!(t.strides(), &[12, 4, 1]);
        assert_eq!(t.get([1, 2, 3]).unwrap(), 23.0);
        assert!(matches!(
            t.get([2, 0, 0]),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_kernel_error_conversion() {
        let err: TensorError = KernelError::InvalidGeometry("too small".into()).into();
        assert_eq!(err.to_string(), "Invalid geometry: too small");
        let err: TensorError = KernelError::ShapeMismatch {
            expected: vec![4],
            got: vec![2],
        }
        .into();
        assert_eq!(err.to_string(), "Shape mismatch: expected [4], got [2]");
    }

    #[test]
    fn test_tensor_debug() {
        let t = Tensor::<f32, 1>::new(vec![1.0], [1]).unwrap();
        let debug_str = format!("{:?}", t);
        assert!(debug_str.contains("Tensor"));
        assert!(debug_str.contains("shape"));
    }
}
