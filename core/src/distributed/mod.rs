//! # Collective communication
//!
//! Data-parallel training keeps one full model replica per device and splits
//! the input stream. After every backward pass the replicas combine their
//! gradients with an **All-Reduce**, so each one applies the same update to
//! its own parameter copy.
//!
//! * [`Collective`](backend::Collective): the interface replicas program against.
//! * [`LocalCollective`](backend::LocalCollective): a world of one; every
//!   collective is the identity.
//! * [`RingCollective`](cpu_backend::RingCollective): ring all-reduce between
//!   threads over `crossbeam` channels. The call blocks until every rank has
//!   contributed, which makes it the per-step barrier of the trainer.

pub mod backend;
pub mod cpu_backend;

pub use backend::{Collective, CommError, LocalCollective};
pub use cpu_backend::RingCollective;
