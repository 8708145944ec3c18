//! Tensor-parallel sharding primitives.
//!
//! A logical weight matrix is split across the ranks of a communication
//! group in one of two ways:
//! - **Column parallel** ([`ColumnParallelLinear`]): the output dimension is
//!   split; each rank produces a slice of the output.
//! - **Row parallel** ([`RowParallelLinear`]): the input dimension is split;
//!   each rank produces a partial sum that an all-reduce completes.
//!
//! Chaining a column layer (output kept sharded) into a row layer (input
//! already sharded) computes a dense-equivalent two-layer transform with a
//! single collective: the closing all-reduce. [`ShardedTensor`] marks
//! activations that live in that sharded intermediate state.

mod linear;
mod shard;

pub use linear::{ColumnParallelLinear, RowParallelLinear, ShardedTensor};
pub use shard::ShardConfig;
