//! # Synapse Core
//!
//! Tensor-parallel transformer blocks: a decoder-only GPT layer whose weight
//! matrices are sharded across the ranks of a model-parallel group, so a
//! model too large for one device can still be evaluated.
//!
//! This crate provides:
//! - **Sharded linear layers** - column-parallel and row-parallel variants
//!   that pair into dense-equivalent transforms with a single collective
//! - **Causal self-attention** - the masked multi-head kernel plus its
//!   sharded q/k/v and output projections
//! - **Pre-norm residual blocks** - [`model::GptLayer`] and the stacked
//!   [`model::Gpt`]
//! - **Explicit communication contexts** - collectives are consumed through
//!   the [`comm::Communicator`] trait, with an in-process
//!   [`comm::ThreadGroup`] for multi-rank tests without real devices
//!
//! The computation is mathematically identical to the unsharded model: each
//! rank holds a fraction of every projection and a fraction of the attention
//! heads, and data only crosses ranks at the all-reduce closing each
//! column-parallel/row-parallel pair.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod comm;
pub mod error;
pub mod model;
pub mod parallel;

pub use error::{Result, SynapseError};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::comm::{Communicator, SingleProcess, ThreadGroup};
    pub use crate::error::{Result, SynapseError};
    pub use crate::model::{Gpt, GptConfig, GptLayer, GptWeights};
    pub use crate::parallel::{ColumnParallelLinear, RowParallelLinear, ShardedTensor};
}
