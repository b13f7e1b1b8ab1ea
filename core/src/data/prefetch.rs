use super::{Batch, BatchSource, DataError, Result};
use crate::tensor::TensorElem;
use crossbeam::channel::{bounded, Receiver};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Background workers filling a bounded queue of batches.
///
/// Each worker owns one [`BatchSource`] and blocks once the queue holds
/// `depth` batches. [`Prefetcher::next`] blocks while the queue is empty.
/// Dropping the prefetcher closes the queue and joins the workers.
pub struct Prefetcher<T: TensorElem> {
    rx: Option<Receiver<Result<Batch<T>>>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: TensorElem + 'static> Prefetcher<T> {
    /// Starts one worker thread per source.
    pub fn spawn<S>(name: &str, sources: Vec<S>, depth: usize) -> Result<Self>
    where
        S: BatchSource<T> + 'static,
    {
        if sources.is_empty() {
            return Err(DataError::FeedClosed);
        }
        let (tx, rx) = bounded(depth);
        let mut workers = Vec::with_capacity(sources.len());
        for (i, mut source) in sources.into_iter().enumerate() {
            let tx = tx.clone();
            let worker = format!("{name}-feed-{i}");
            let handle = thread::Builder::new()
                .name(worker.clone())
                .spawn(move || {
                    loop {
                        let batch = source.next_batch();
                        let failed = batch.is_err();
                        if tx.send(batch).is_err() || failed {
                            break;
                        }
                    }
                    debug!(worker = %worker, "feed worker stopped");
                })?;
            workers.push(handle);
        }
        Ok(Self {
            rx: Some(rx),
            workers,
        })
    }
}

impl<T: TensorElem> Prefetcher<T> {
    /// Takes the next batch, waiting for a worker if none is queued.
    pub fn next(&self) -> Result<Batch<T>> {
        let rx = self.rx.as_ref().ok_or(DataError::FeedClosed)?;
        rx.recv().map_err(|_| DataError::FeedClosed)?
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl<T: TensorElem> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        // Blocked senders fail once the receiver is gone.
        self.rx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticImages;
    use crate::tensor::Tensor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        produced: Arc<AtomicUsize>,
        fail_after: Option<usize>,
    }

    impl BatchSource<f32> for Counting {
        fn next_batch(&mut self) -> Result<Batch<f32>> {
            let n = self.produced.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(DataError::Io(std::io::Error::other("decode failed")));
            }
            Ok(Batch {
                images: Tensor::full([1, 1, 1, 1], n as f32),
                labels: Tensor::ones([1, 1]),
            })
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_prefetch_delivers_batches() {
        let sources = (0..3)
            .map(|w| SyntheticImages::new(2, [3, 4, 4], 2, w))
            .collect();
        let feed = Prefetcher::<f32>::spawn("gpu_0", sources, 4).unwrap();
        assert_eq!(feed.workers(), 3);
        for _ in 0..10 {
            assert_eq!(feed.next().unwrap().images.shape(), &[2, 3, 4, 4]);
        }
    }

    #[test]
    fn test_queue_is_bounded_and_drop_joins() {
        let produced = Arc::new(AtomicUsize::new(0));
        let source = Counting {
            produced: produced.clone(),
            fail_after: None,
        };
        let feed = Prefetcher::spawn("gpu_0", vec![source], 2).unwrap();
        feed.next().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        // one taken, two queued, one blocked in send
        assert!(produced.load(Ordering::SeqCst) <= 4);
        drop(feed);
    }

    #[test]
    fn test_source_error_reaches_consumer() {
        let source = Counting {
            produced: Arc::new(AtomicUsize::new(0)),
            fail_after: Some(1),
        };
        let feed = Prefetcher::spawn("gpu_1", vec![source], 1).unwrap();
        assert!(feed.next().is_ok());
        assert!(matches!(feed.next(), Err(DataError::Io(_))));
        assert!(matches!(feed.next(), Err(DataError::FeedClosed)));
    }
}
