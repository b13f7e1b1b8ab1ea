//! # resnet_replica
//!
//! Data-parallel ResNet-50 v1 training on the CPU. Each "device" is a thread
//! that owns a full replica of the network: its own parameters, optimizer
//! state, input feed and collective endpoint. After every backward pass the
//! replicas average their gradients with a ring all-reduce and each applies
//! the same update to its own copy.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: N-dimensional tensors with the forward and backward ops used in training.
//! - [`registry`]: scoped, Glorot-initialised parameter storage per device.
//! - [`nn`]: convolution, dense, pooling, LRN and ReLU layers with hand-written backward passes.
//! - [`model`]: the static ResNet topology, its shape plan and the network itself.
//! - [`aggregate`]: gradient bundles and their cross-replica average.
//! - [`distributed`]: the collective interface and its ring implementation.
//! - [`optim`]: Adagrad, SGD with momentum and AdamW.
//! - [`data`]: batch sources, the prefetching feed and the dataset cache.
//! - [`replica`] and [`trainer`]: per-device replicas and the synchronous training loop.
//!
//! ## Example
//!
//! ```rust,no_run
//! use resnet_replica::config::TrainConfig;
//! use resnet_replica::model::ModelConfig;
//! use resnet_replica::trainer::{ConsoleReporter, Trainer};
//!
//! let config = TrainConfig {
//!     devices: 2,
//!     batch_size: 4,
//!     height: 16,
//!     width: 16,
//!     steps: 20,
//!     report_every: 10,
//!     model: ModelConfig::tiny(),
//!     ..TrainConfig::default()
//! };
//! let mut trainer = Trainer::<f32>::new(config, Box::new(ConsoleReporter::stdout())).unwrap();
//! let summary = trainer.run().unwrap();
//! println!("{:.2} images/sec", summary.images_per_sec);
//! ```

pub mod aggregate;
pub mod config;
pub mod data;
pub mod distributed;
pub mod loss;
pub mod model;
pub mod nn;
pub mod optim;
pub mod registry;
pub mod replica;
pub mod tensor;
pub mod trainer;

pub use config::TrainConfig;
pub use replica::Replica;
pub use tensor::{Tensor, TensorElem, TensorError};
pub use trainer::{TrainError, TrainSummary, Trainer};
