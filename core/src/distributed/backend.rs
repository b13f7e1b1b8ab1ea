use crate::tensor::TensorElem;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// A neighbour dropped its endpoint, usually because its replica failed.
    #[error("Rank {rank}: ring peer disconnected")]
    Disconnected { rank: usize },
    #[error("Rank {rank}: expected a chunk of {expected} elements, got {got}")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },
    #[error("A collective needs at least one rank")]
    EmptyWorld,
}

pub type Result<T> = std::result::Result<T, CommError>;

/// Abstraction for a communication backend shared by all replicas.
///
/// Every rank must call the same collectives in the same order with buffers
/// of the same length.
pub trait Collective<T: TensorElem>: Send {
    /// Returns the rank of the calling replica.
    fn rank(&self) -> usize;

    /// Returns the number of participating replicas.
    fn world_size(&self) -> usize;

    /// Replaces `data` with the element-wise sum over all ranks.
    ///
    /// Blocks until every rank has contributed.
    fn all_reduce_sum(&self, data: &mut [T]) -> Result<()>;
}

/// Collective for a single device: sums over one rank are the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl<T: TensorElem> Collective<T> for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _data: &mut [T]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_collective_is_identity() {
        let local = LocalCollective;
        let mut data = vec![1.5f32, -2.0];
        Collective::<f32>::all_reduce_sum(&local, &mut data).unwrap();
        assert_eq!(data, vec![1.5, -2.0]);
        assert_eq!(Collective::<f32>::rank(&local), 0);
        assert_eq!(Collective::<f32>::world_size(&local), 1);
    }
}
