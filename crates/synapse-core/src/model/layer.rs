//! Pre-norm residual transformer block.
//!
//! `x = x + attn(norm1(x))`, then `x = x + mlp(norm2(x))`. Normalization is
//! applied before each sublayer so deep stacks stay stable; the residual path
//! carries the unnormalized activations.

use crate::comm::Communicator;
use crate::error::Result;
use crate::model::{FeedForward, GptConfig, GptLayerWeights, SelfAttention};
use candle_core::{Device, Tensor};
use candle_nn::{LayerNorm, Module};
use std::sync::Arc;

/// Epsilon for layer normalization.
pub const LAYER_NORM_EPS: f64 = 1e-6;

/// One transformer block: two norms, self-attention, feed-forward.
pub struct GptLayer {
    norm1: LayerNorm,
    attn: SelfAttention,
    norm2: LayerNorm,
    mlp: FeedForward,
}

impl GptLayer {
    /// Build from full logical weights, keeping this rank's shards. Norm
    /// parameters are cast to the configured numeric type.
    pub fn from_full(
        weights: &GptLayerWeights,
        config: &GptConfig,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let dtype = config.numeric_type.dtype();
        let norm1 = LayerNorm::new(
            weights.norm1_weight.to_dtype(dtype)?,
            weights.norm1_bias.to_dtype(dtype)?,
            LAYER_NORM_EPS,
        );
        let norm2 = LayerNorm::new(
            weights.norm2_weight.to_dtype(dtype)?,
            weights.norm2_bias.to_dtype(dtype)?,
            LAYER_NORM_EPS,
        );
        let attn = SelfAttention::from_full(
            &weights.attention,
            config.num_heads,
            config.attention_dropout,
            config.dropout,
            comm.clone(),
        )?;
        let mlp = FeedForward::from_full(&weights.mlp, comm)?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }

    /// Create with random local weights (for testing).
    pub fn random(config: &GptConfig, comm: Arc<dyn Communicator>, device: &Device) -> Result<Self> {
        let dtype = config.numeric_type.dtype();
        let ones = |d: usize| Tensor::ones(d, dtype, device);
        let zeros = |d: usize| Tensor::zeros(d, dtype, device);

        let norm1 = LayerNorm::new(ones(config.dim)?, zeros(config.dim)?, LAYER_NORM_EPS);
        let norm2 = LayerNorm::new(ones(config.dim)?, zeros(config.dim)?, LAYER_NORM_EPS);
        let attn = SelfAttention::random(
            config.dim,
            config.num_heads,
            config.attention_dropout,
            config.dropout,
            comm.clone(),
            device,
        )?;
        let mlp = FeedForward::random(config.dim, config.mlp_ratio, comm, device)?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }

    /// Forward pass over `[batch, seq, dim]`. Two collectives per call, one
    /// per sublayer.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.norm1.forward(x)?;
        let attn_out = self.attn.forward(&normed, train)?;
        let x = (x + attn_out)?;

        let normed = self.norm2.forward(&x)?;
        let mlp_out = self.mlp.forward(&normed)?;
        Ok((x + mlp_out)?)
    }

    /// The self-attention sublayer.
    pub fn attn(&self) -> &SelfAttention {
        &self.attn
    }

    /// The feed-forward sublayer.
    pub fn mlp(&self) -> &FeedForward {
        &self.mlp
    }
}
