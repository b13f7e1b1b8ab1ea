use super::backend::{Collective, CommError, Result};
use crate::tensor::TensorElem;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::ops::Range;

/// A CPU collective backend connecting replica threads in a ring.
///
/// Implements **Ring All-Reduce** with `crossbeam` channels: a scatter-reduce
/// phase leaves every rank with one fully summed chunk, then an all-gather
/// phase circulates the summed chunks. Each rank sends and receives
/// `2 * (world_size - 1)` chunks of roughly `len / world_size` elements.
pub struct RingCollective<T> {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Vec<T>>, // Receive from rank - 1
    right_tx: Sender<Vec<T>>,  // Send to rank + 1
}

impl<T: TensorElem> RingCollective<T> {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Vec<T>>,
        right_tx: Sender<Vec<T>>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        }
    }

    /// Builds the endpoints of a ring `0 -> 1 -> .. -> n-1 -> 0`, ordered by rank.
    pub fn ring(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(CommError::EmptyWorld);
        }
        // Channel i carries rank i's messages to rank i + 1.
        let (txs, mut rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        rxs.rotate_right(1);
        Ok(txs
            .into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (right_tx, left_rx))| Self::new(rank, world_size, left_rx, right_tx))
            .collect())
    }

    fn chunk(&self, idx: usize, chunk_size: usize, total: usize) -> Range<usize> {
        let start = (idx * chunk_size).min(total);
        start..(start + chunk_size).min(total)
    }

    /// Ring position `rank - offset` modulo the world size.
    fn behind(&self, offset: usize) -> usize {
        (self.rank + self.world_size * 2 - offset) % self.world_size
    }

    /// Sends `chunk` to the right neighbour and waits for `expected` elements from the left.
    fn exchange(&self, chunk: &[T], expected: usize) -> Result<Vec<T>> {
        let disconnected = CommError::Disconnected { rank: self.rank };
        self.right_tx
            .send(chunk.to_vec())
            .map_err(|_| disconnected.clone())?;
        let received = self.left_rx.recv().map_err(|_| disconnected)?;
        if received.len() != expected {
            return Err(CommError::LengthMismatch {
                rank: self.rank,
                expected,
                got: received.len(),
            });
        }
        Ok(received)
    }
}

impl<T: TensorElem> Collective<T> for RingCollective<T> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, data: &mut [T]) -> Result<()> {
        let total = data.len();
        let chunk_size = total.div_ceil(self.world_size);

        // --- Phase 1: Scatter-Reduce ---
        // Rank r sends chunk (r - step) and accumulates chunk (r - step - 1).
        for step in 0..self.world_size - 1 {
            let send = self.chunk(self.behind(step), chunk_size, total);
            let recv = self.chunk(self.behind(step + 1), chunk_size, total);
            let incoming = self.exchange(&data[send], recv.len())?;
            for (slot, val) in data[recv].iter_mut().zip(incoming) {
                *slot += val;
            }
        }

        // --- Phase 2: All-Gather ---
        // Rank r now owns the reduced chunk (r + 1); pass reduced chunks around.
        for step in 0..self.world_size - 1 {
            let send = self.chunk(self.behind(step + self.world_size - 1), chunk_size, total);
            let recv = self.chunk(self.behind(step), chunk_size, total);
            let incoming = self.exchange(&data[send], recv.len())?;
            data[recv].copy_from_slice(&incoming);
        }

        Ok(())
    }
}
