//! Full (unsharded) model parameters.
//!
//! Every rank constructs its model from the same logical weights and slices
//! out its own shard, which is how a checkpoint loader would feed the model
//! and what makes sharded runs bit-comparable to the dense computation.
//! Generation is seeded so all ranks agree without communicating.

use crate::error::Result;
use crate::model::GptConfig;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Init scale matching the usual transformer weight distribution width.
const INIT_SCALE: f32 = 0.02;

fn uniform(rng: &mut StdRng, shape: &[usize], device: &Device) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-INIT_SCALE..INIT_SCALE)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Logical parameters of one self-attention sublayer.
///
/// Projection weights are `[out_features, in_features]`.
#[derive(Debug, Clone)]
pub struct SelfAttentionWeights {
    /// Query projection `[dim, dim]`.
    pub query_weight: Tensor,
    /// Query bias `[dim]`.
    pub query_bias: Tensor,
    /// Key projection `[dim, dim]`.
    pub key_weight: Tensor,
    /// Key bias `[dim]`.
    pub key_bias: Tensor,
    /// Value projection `[dim, dim]`.
    pub value_weight: Tensor,
    /// Value bias `[dim]`.
    pub value_bias: Tensor,
    /// Output projection `[dim, dim]`.
    pub output_weight: Tensor,
    /// Output bias `[dim]`.
    pub output_bias: Tensor,
}

impl SelfAttentionWeights {
    /// Generate random parameters for a hidden dimension.
    pub fn random(dim: usize, rng: &mut StdRng, device: &Device) -> Result<Self> {
        Ok(Self {
            query_weight: uniform(rng, &[dim, dim], device)?,
            query_bias: uniform(rng, &[dim], device)?,
            key_weight: uniform(rng, &[dim, dim], device)?,
            key_bias: uniform(rng, &[dim], device)?,
            value_weight: uniform(rng, &[dim, dim], device)?,
            value_bias: uniform(rng, &[dim], device)?,
            output_weight: uniform(rng, &[dim, dim], device)?,
            output_bias: uniform(rng, &[dim], device)?,
        })
    }
}

/// Logical parameters of one feed-forward sublayer.
#[derive(Debug, Clone)]
pub struct FeedForwardWeights {
    /// Expansion projection `[dim * ratio, dim]`.
    pub up_weight: Tensor,
    /// Expansion bias `[dim * ratio]`.
    pub up_bias: Tensor,
    /// Contraction projection `[dim, dim * ratio]`.
    pub down_weight: Tensor,
    /// Contraction bias `[dim]`.
    pub down_bias: Tensor,
}

impl FeedForwardWeights {
    /// Generate random parameters for a hidden dimension and expansion ratio.
    pub fn random(dim: usize, ratio: usize, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let inter = dim * ratio;
        Ok(Self {
            up_weight: uniform(rng, &[inter, dim], device)?,
            up_bias: uniform(rng, &[inter], device)?,
            down_weight: uniform(rng, &[dim, inter], device)?,
            down_bias: uniform(rng, &[dim], device)?,
        })
    }
}

/// Logical parameters of one transformer block.
#[derive(Debug, Clone)]
pub struct GptLayerWeights {
    /// Self-attention sublayer parameters.
    pub attention: SelfAttentionWeights,
    /// Feed-forward sublayer parameters.
    pub mlp: FeedForwardWeights,
    /// Pre-attention norm scale `[dim]`.
    pub norm1_weight: Tensor,
    /// Pre-attention norm shift `[dim]`.
    pub norm1_bias: Tensor,
    /// Pre-feedforward norm scale `[dim]`.
    pub norm2_weight: Tensor,
    /// Pre-feedforward norm shift `[dim]`.
    pub norm2_bias: Tensor,
}

impl GptLayerWeights {
    /// Generate random parameters for one block. Norm scales start at one,
    /// shifts at zero.
    pub fn random(dim: usize, ratio: usize, rng: &mut StdRng, device: &Device) -> Result<Self> {
        Ok(Self {
            attention: SelfAttentionWeights::random(dim, rng, device)?,
            mlp: FeedForwardWeights::random(dim, ratio, rng, device)?,
            norm1_weight: Tensor::ones(dim, candle_core::DType::F32, device)?,
            norm1_bias: Tensor::zeros(dim, candle_core::DType::F32, device)?,
            norm2_weight: Tensor::ones(dim, candle_core::DType::F32, device)?,
            norm2_bias: Tensor::zeros(dim, candle_core::DType::F32, device)?,
        })
    }
}

/// Logical parameters of a whole stack.
#[derive(Debug, Clone)]
pub struct GptWeights {
    /// One entry per block, in application order.
    pub layers: Vec<GptLayerWeights>,
}

impl GptWeights {
    /// Generate a full parameter set for `config`, deterministically from
    /// `seed`.
    pub fn random(config: &GptConfig, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = (0..config.depth)
            .map(|_| GptLayerWeights::random(config.dim, config.mlp_ratio, &mut rng, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }
}
