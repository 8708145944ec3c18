//! Tensor-parallel GPT model components.
//!
//! Leaves first:
//! - [`AttentionCore`] - masked multi-head dot-product attention kernel
//! - [`SelfAttention`] - sharded q/k/v projections around the core
//! - [`FeedForward`] - sharded expansion/contraction MLP
//! - [`GptLayer`] - pre-norm residual block
//! - [`Gpt`] - ordered stack of blocks

mod attention;
mod config;
mod gpt;
mod layer;
mod mlp;
mod weights;

pub use attention::{AttentionCore, SelfAttention, MASK_FILL};
pub use config::{GptConfig, NumericType};
pub use gpt::Gpt;
pub use layer::{GptLayer, LAYER_NORM_EPS};
pub use mlp::FeedForward;
pub use weights::{FeedForwardWeights, GptLayerWeights, GptWeights, SelfAttentionWeights};
