//! Input feed for the replicas.
//!
//! # Components
//!
//! - **BatchSource**: an endless, restartable producer of `(images, labels)`
//!   batches.
//! - **SyntheticImages**: seeded uniform pixels with random one-hot labels.
//! - **ImageFolder**: decoded images from `<dataset>/train/<class>/`.
//! - **Prefetcher**: a per-device worker pool filling a bounded queue; the
//!   training step blocks on it when it runs dry.
//! - **dataset**: the on-disk dataset cache with its `.success` sentinel.

pub mod dataset;
pub mod folder;
pub mod prefetch;

pub use dataset::{class_count, ensure_dataset, ensure_dataset_with, TRAIN_DIR};
pub use folder::ImageFolder;
pub use prefetch::Prefetcher;

use crate::tensor::{self, Tensor, TensorElem, TensorError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to download dataset.")]
    Download(#[source] io::Error),
    #[error("Dataset I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Invalid dataset: {0}")]
    Layout(String),
    #[error("Input feed closed")]
    FeedClosed,
    #[error("Invalid batch: {0}")]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, DataError>;

/// One step's input: NCHW images and one-hot labels `[batch, classes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T: TensorElem> {
    pub images: Tensor<T, 4>,
    pub labels: Tensor<T, 2>,
}

impl<T: TensorElem> Batch<T> {
    pub fn batch_size(&self) -> usize {
        self.images.shape()[0]
    }
}

/// An endless producer of batches.
pub trait BatchSource<T: TensorElem>: Send {
    fn next_batch(&mut self) -> Result<Batch<T>>;

    /// Restarts the source from its first batch.
    fn reset(&mut self);
}

impl<T: TensorElem, S: BatchSource<T> + ?Sized> BatchSource<T> for Box<S> {
    fn next_batch(&mut self) -> Result<Batch<T>> {
        (**self).next_batch()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Uniform pixels in `[0, 1)` and uniformly drawn one-hot labels.
#[derive(Debug, Clone)]
pub struct SyntheticImages {
    batch_size: usize,
    image: [usize; 3],
    classes: usize,
    seed: u64,
    rng: StdRng,
}

impl SyntheticImages {
    pub fn new(batch_size: usize, image: [usize; 3], classes: usize, seed: u64) -> Self {
        Self {
            batch_size,
            image,
            classes,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<T: TensorElem> BatchSource<T> for SyntheticImages {
    fn next_batch(&mut self) -> Result<Batch<T>> {
        let [c, h, w] = self.image;
        let pixels = (0..self.batch_size * c * h * w)
            .map(|_| tensor::elem(self.rng.random::<f64>()))
            .collect::<tensor::Result<Vec<T>>>()?;

        let mut labels = vec![T::zero(); self.batch_size * self.classes];
        if self.classes > 0 {
            for row in labels.chunks_mut(self.classes) {
                row[self.rng.random_range(0..self.classes)] = T::one();
            }
        }

        Ok(Batch {
            images: Tensor::new(pixels, [self.batch_size, c, h, w])?,
            labels: Tensor::new(labels, [self.batch_size, self.classes])?,
        })
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }
}
