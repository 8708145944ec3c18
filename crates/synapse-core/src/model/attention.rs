//! Causal multi-head self-attention under tensor parallelism.
//!
//! [`SelfAttention`] projects q/k/v through column-sharded linears (outputs
//! kept sharded), splits the local width into this rank's heads, runs
//! [`AttentionCore`], and closes with a row-sharded output projection whose
//! all-reduce is the sublayer's single collective.

use crate::comm::Communicator;
use crate::error::{Result, SynapseError};
use crate::model::SelfAttentionWeights;
use crate::parallel::{ColumnParallelLinear, RowParallelLinear, ShardedTensor};
use candle_core::{Device, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::Dropout;
use parking_lot::Mutex;
use std::sync::Arc;

/// Fill value for masked attention scores.
///
/// A finite large negative rather than `-inf`, matching the reference
/// numerics exactly: kept finite so reduced-precision softmax never sees an
/// infinity.
pub const MASK_FILL: f32 = -1e4;

/// Environment variable selecting the device the causal mask lives on
/// (`cpu`, `cuda`, `cuda:N`). Unset: the query tensor's own device.
const MASK_DEVICE_ENV: &str = "SYNAPSE_MASK_DEVICE";

fn mask_device(fallback: &Device) -> Result<Device> {
    match std::env::var(MASK_DEVICE_ENV) {
        Err(_) => Ok(fallback.clone()),
        Ok(name) => parse_device(&name),
    }
}

fn parse_device(name: &str) -> Result<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        other => {
            if let Some(idx) = other.strip_prefix("cuda:") {
                let ordinal: usize = idx.parse().map_err(|_| {
                    SynapseError::Config(format!("invalid device selector '{other}'"))
                })?;
                Ok(Device::new_cuda(ordinal)?)
            } else {
                Err(SynapseError::Config(format!(
                    "invalid device selector '{other}'"
                )))
            }
        }
    }
}

/// Cached causal mask keyed by the lengths it was built for.
struct MaskCache {
    q_len: usize,
    k_len: usize,
    /// Boolean mask `[1, 1, q_len, k_len]`, 1 on and below the diagonal.
    mask: Tensor,
}

/// Scaled, causally masked dot-product attention kernel.
///
/// Operates on already-projected, already-split tensors of shape
/// `[batch, local_heads, seq, head_dim]` and is oblivious to sharding: under
/// tensor parallelism it simply sees fewer heads.
pub struct AttentionCore {
    head_dim: usize,
    attention_dropout: Dropout,
    /// Lazily built mask, rebuilt whenever the requested lengths differ.
    mask_cache: Mutex<Option<MaskCache>>,
}

impl AttentionCore {
    /// Create a kernel for a given per-head width.
    pub fn new(head_dim: usize, attention_dropout: f32) -> Self {
        Self {
            head_dim,
            attention_dropout: Dropout::new(attention_dropout),
            mask_cache: Mutex::new(None),
        }
    }

    /// Per-head feature width.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Compute attention.
    ///
    /// # Arguments
    ///
    /// * `q`, `k`, `v` - `[batch, local_heads, seq, head_dim]`; `q` may have
    ///   a shorter sequence than `k`/`v` (incremental decoding)
    /// * `train` - whether attention dropout is active
    ///
    /// # Returns
    ///
    /// Context tensor `[batch, seq_q, local_heads * head_dim]` with heads
    /// merged back into the feature axis.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        if head_dim != self.head_dim {
            return Err(SynapseError::ShapeMismatch(format!(
                "query head width {} does not match attention head size {}",
                head_dim, self.head_dim
            )));
        }
        let (kb, kh, k_len, kd) = k.dims4()?;
        let (vb, vh, v_len, vd) = v.dims4()?;
        if (kb, kh, kd) != (batch, heads, head_dim) || (vb, vh, vd) != (batch, heads, head_dim) {
            return Err(SynapseError::ShapeMismatch(format!(
                "q {:?}, k {:?}, v {:?} disagree on batch/heads/head_dim",
                q.dims(),
                k.dims(),
                v.dims()
            )));
        }
        if v_len != k_len {
            return Err(SynapseError::ShapeMismatch(format!(
                "key length {} does not match value length {}",
                k_len, v_len
            )));
        }

        // Scores: Q @ K^T / sqrt(d)
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.transpose(2, 3)?)?;
        let scores = (scores * scale)?;

        // Replace future positions with the finite fill value. The mask may
        // be pinned to another device; no-op move when it already matches.
        let mask = self
            .causal_mask(q_len, k_len, q.device())?
            .to_device(scores.device())?;
        let fill = Tensor::full(MASK_FILL, scores.dims(), scores.device())?;
        let scores = mask
            .broadcast_as(scores.dims())?
            .where_cond(&scores, &fill)?;

        let weights = softmax(&scores, D::Minus1)?;
        let weights = self.attention_dropout.forward(&weights, train)?;

        // Context: weights @ V, heads merged back next to the feature axis.
        let context = weights.matmul(v)?;
        let context = context.transpose(1, 2)?;
        Ok(context.reshape((batch, q_len, heads * head_dim))?)
    }

    /// Return the cached mask for `(q_len, k_len)`, rebuilding it when the
    /// requested lengths or the target device differ from the cached entry.
    fn causal_mask(&self, q_len: usize, k_len: usize, fallback: &Device) -> Result<Tensor> {
        let device = mask_device(fallback)?;
        let mut cache = self.mask_cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.q_len == q_len
                && cached.k_len == k_len
                && cached.mask.device().location() == device.location()
            {
                return Ok(cached.mask.clone());
            }
        }
        let mut data = vec![0u8; q_len * k_len];
        for i in 0..q_len {
            for j in 0..k_len {
                if j <= i {
                    data[i * k_len + j] = 1;
                }
            }
        }
        let mask = Tensor::from_vec(data, (q_len, k_len), &device)?
            .reshape((1, 1, q_len, k_len))?;
        *cache = Some(MaskCache {
            q_len,
            k_len,
            mask: mask.clone(),
        });
        Ok(mask)
    }
}

/// Tensor-parallel self-attention sublayer.
pub struct SelfAttention {
    query: ColumnParallelLinear,
    key: ColumnParallelLinear,
    value: ColumnParallelLinear,
    dense: RowParallelLinear,
    dropout: Dropout,
    core: AttentionCore,
    head_dim: usize,
    local_heads: usize,
}

impl SelfAttention {
    /// Build from full logical weights, keeping this rank's shards.
    pub fn from_full(
        weights: &SelfAttentionWeights,
        num_heads: usize,
        attention_dropout: f32,
        dropout: f32,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let dim = weights.query_weight.dims2()?.1;
        Self::validate(dim, num_heads, comm.world_size())?;

        let query = ColumnParallelLinear::from_full(
            weights.query_weight.clone(),
            Some(weights.query_bias.clone()),
            comm.clone(),
        )?;
        let key = ColumnParallelLinear::from_full(
            weights.key_weight.clone(),
            Some(weights.key_bias.clone()),
            comm.clone(),
        )?;
        let value = ColumnParallelLinear::from_full(
            weights.value_weight.clone(),
            Some(weights.value_bias.clone()),
            comm.clone(),
        )?;
        let dense = RowParallelLinear::from_full(
            weights.output_weight.clone(),
            Some(weights.output_bias.clone()),
            comm,
        )?;

        Self::assemble(query, key, value, dense, dim, num_heads, attention_dropout, dropout)
    }

    /// Create with random local weights (for testing).
    pub fn random(
        dim: usize,
        num_heads: usize,
        attention_dropout: f32,
        dropout: f32,
        comm: Arc<dyn Communicator>,
        device: &Device,
    ) -> Result<Self> {
        Self::validate(dim, num_heads, comm.world_size())?;

        let query = ColumnParallelLinear::random(dim, dim, comm.clone(), device)?;
        let key = ColumnParallelLinear::random(dim, dim, comm.clone(), device)?;
        let value = ColumnParallelLinear::random(dim, dim, comm.clone(), device)?;
        let dense = RowParallelLinear::random(dim, dim, comm, device)?;

        Self::assemble(query, key, value, dense, dim, num_heads, attention_dropout, dropout)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        query: ColumnParallelLinear,
        key: ColumnParallelLinear,
        value: ColumnParallelLinear,
        dense: RowParallelLinear,
        dim: usize,
        num_heads: usize,
        attention_dropout: f32,
        dropout: f32,
    ) -> Result<Self> {
        // Head size is global: derived from the unsharded width, invariant
        // across shards. The local head count follows from the shard width.
        let head_dim = dim / num_heads;
        let local_heads = query.local_out_features() / head_dim;
        Ok(Self {
            query,
            key,
            value,
            dense,
            dropout: Dropout::new(dropout),
            core: AttentionCore::new(head_dim, attention_dropout),
            head_dim,
            local_heads,
        })
    }

    fn validate(dim: usize, num_heads: usize, world_size: usize) -> Result<()> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(SynapseError::Config(format!(
                "dim {} is not divisible by num_heads {}",
                dim, num_heads
            )));
        }
        if world_size == 0 || dim % world_size != 0 {
            return Err(SynapseError::Config(format!(
                "dim {} is not divisible by world_size {}",
                dim, world_size
            )));
        }
        if num_heads % world_size != 0 {
            return Err(SynapseError::Config(format!(
                "num_heads {} is not divisible by world_size {}; each rank must own whole heads",
                num_heads, world_size
            )));
        }
        Ok(())
    }

    /// Number of heads this rank owns.
    pub fn local_heads(&self) -> usize {
        self.local_heads
    }

    /// Per-head feature width.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// `[batch, seq, local_width]` -> `[batch, local_heads, seq, head_dim]`
    fn split_heads(&self, t: ShardedTensor, batch: usize, seq: usize) -> Result<Tensor> {
        Ok(t.into_inner()
            .reshape((batch, seq, self.local_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Forward pass.
    ///
    /// Input and output are `[batch, seq, dim]`, replicated on every rank.
    /// One all-reduce (inside the output projection) per call.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;

        let q = self.split_heads(self.query.forward(x)?, batch, seq)?;
        let k = self.split_heads(self.key.forward(x)?, batch, seq)?;
        let v = self.split_heads(self.value.forward(x)?, batch, seq)?;

        let context = self.core.forward(&q, &k, &v, train)?;
        let out = self.dense.forward(&ShardedTensor::new(context))?;
        Ok(self.dropout.forward(&out, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SingleProcess, ThreadGroup};
    use crate::parallel::ShardConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(shape: &[usize], phase: f32) -> Tensor {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| ((i as f32) * 0.23 + phase).sin()).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
        let (a, b) = (to_vec(a), to_vec(b));
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(&b).enumerate() {
            assert!((x - y).abs() < tol, "index {}: {} vs {}", i, x, y);
        }
    }

    #[test]
    fn core_output_shape() {
        let core = AttentionCore::new(8, 0.0);
        let q = ramp(&[2, 4, 16, 8], 0.0);
        let k = ramp(&[2, 4, 16, 8], 0.1);
        let v = ramp(&[2, 4, 16, 8], 0.2);
        let out = core.forward(&q, &k, &v, false).unwrap();
        assert_eq!(out.dims(), &[2, 16, 32]);
    }

    #[test]
    fn core_rejects_head_width_mismatch() {
        let core = AttentionCore::new(8, 0.0);
        let q = ramp(&[1, 2, 4, 16], 0.0);
        let k = ramp(&[1, 2, 4, 16], 0.1);
        let v = ramp(&[1, 2, 4, 16], 0.2);
        assert!(matches!(
            core.forward(&q, &k, &v, false),
            Err(SynapseError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn core_rejects_kv_length_disagreement() {
        let core = AttentionCore::new(8, 0.0);
        let q = ramp(&[1, 2, 4, 8], 0.0);
        let k = ramp(&[1, 2, 6, 8], 0.1);
        let v = ramp(&[1, 2, 5, 8], 0.2);
        assert!(matches!(
            core.forward(&q, &k, &v, false),
            Err(SynapseError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn attention_is_causal() {
        // With v as the identity matrix, each output row is exactly the
        // attention weight row for that query position.
        let seq = 4;
        let core = AttentionCore::new(seq, 0.0);
        let q = ramp(&[1, 1, seq, seq], 0.0);
        let k = ramp(&[1, 1, seq, seq], 0.4);
        let eye: Vec<f32> = (0..seq * seq)
            .map(|i| if i / seq == i % seq { 1.0 } else { 0.0 })
            .collect();
        let v = Tensor::from_vec(eye, (1, 1, seq, seq), &Device::Cpu).unwrap();

        let out = core.forward(&q, &k, &v, false).unwrap();
        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();

        for (i, row) in rows.iter().enumerate() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row {} sums to {}", i, sum);
            for (j, &w) in row.iter().enumerate() {
                if j > i {
                    // Below the residual floor of the -1e4 fill.
                    assert!(w < 1e-6, "future weight ({}, {}) = {}", i, j, w);
                } else if j == i {
                    assert!(w > 1e-4, "self weight ({}, {}) = {}", i, j, w);
                }
            }
        }
    }

    #[test]
    fn mask_cache_survives_length_changes() {
        let core = AttentionCore::new(4, 0.0);
        let run = |seq: usize| {
            let q = ramp(&[1, 2, seq, 4], 0.0);
            let k = ramp(&[1, 2, seq, 4], 0.3);
            let v = ramp(&[1, 2, seq, 4], 0.6);
            core.forward(&q, &k, &v, false).unwrap()
        };

        let first = run(4);
        let second = run(4);
        assert_close(&first, &second, f32::EPSILON);

        // Different length rebuilds the mask rather than reusing the stale one.
        let longer = run(6);
        assert_eq!(longer.dims(), &[1, 6, 8]);

        // And switching back still produces the original result.
        let third = run(4);
        assert_close(&first, &third, f32::EPSILON);
    }

    #[test]
    fn device_selector_accepts_cpu() {
        assert!(matches!(parse_device("cpu").unwrap(), Device::Cpu));
    }

    #[test]
    fn device_selector_rejects_unknown_names() {
        assert!(matches!(
            parse_device("bogus"),
            Err(SynapseError::Config(_))
        ));
        assert!(matches!(
            parse_device("cuda:x"),
            Err(SynapseError::Config(_))
        ));
        assert!(matches!(parse_device(""), Err(SynapseError::Config(_))));
    }

    #[test]
    fn mask_device_defaults_to_query_device() {
        // The selector variable is not set under the test harness, so the
        // fallback device wins.
        assert!(matches!(mask_device(&Device::Cpu).unwrap(), Device::Cpu));
    }

    #[test]
    fn cached_mask_lands_on_requested_device() {
        let core = AttentionCore::new(4, 0.0);
        let first = core.causal_mask(4, 4, &Device::Cpu).unwrap();
        assert_eq!(first.dims(), &[1, 1, 4, 4]);
        assert!(first.device().is_cpu());

        // Same lengths and device: the cached entry is served again.
        let again = core.causal_mask(4, 4, &Device::Cpu).unwrap();
        let a: Vec<u8> = first.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<u8> = again.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shorter_query_than_key_is_supported() {
        let core = AttentionCore::new(4, 0.0);
        let q = ramp(&[1, 2, 2, 4], 0.0);
        let k = ramp(&[1, 2, 6, 4], 0.3);
        let v = ramp(&[1, 2, 6, 4], 0.6);
        let out = core.forward(&q, &k, &v, false).unwrap();
        assert_eq!(out.dims(), &[1, 2, 8]);
    }

    #[test]
    fn self_attention_preserves_shape() {
        let comm = Arc::new(SingleProcess::new());
        let attn = SelfAttention::random(64, 8, 0.0, 0.0, comm, &Device::Cpu).unwrap();
        let x = ramp(&[2, 16, 64], 0.0);
        let out = attn.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[2, 16, 64]);
    }

    #[test]
    fn self_attention_rejects_partial_heads() {
        let handles = ThreadGroup::new(4).unwrap();
        let comm: Arc<dyn Communicator> = Arc::new(handles.into_iter().next().unwrap());
        // 2 heads over 4 ranks: half a head each.
        assert!(matches!(
            SelfAttention::random(64, 2, 0.0, 0.0, comm, &Device::Cpu),
            Err(SynapseError::Config(_))
        ));
    }

    #[test]
    fn sharded_self_attention_matches_dense() {
        let dim = 32;
        let num_heads = 4;
        let mut rng = StdRng::seed_from_u64(11);
        let weights = SelfAttentionWeights::random(dim, &mut rng, &Device::Cpu).unwrap();
        let x = ramp(&[2, 8, dim], 0.5);

        let dense_attn = SelfAttention::from_full(
            &weights,
            num_heads,
            0.0,
            0.0,
            Arc::new(SingleProcess::new()),
        )
        .unwrap();
        let expected = dense_attn.forward(&x, false).unwrap();

        for world_size in [2, 4] {
            let handles = ThreadGroup::new(world_size).unwrap();
            let outputs: Vec<Tensor> = std::thread::scope(|s| {
                let joins: Vec<_> = handles
                    .into_iter()
                    .map(|h| {
                        let (weights, x) = (weights.clone(), x.clone());
                        s.spawn(move || {
                            let attn = SelfAttention::from_full(
                                &weights,
                                num_heads,
                                0.0,
                                0.0,
                                Arc::new(h),
                            )
                            .unwrap();
                            attn.forward(&x, false).unwrap()
                        })
                    })
                    .collect();
                joins.into_iter().map(|j| j.join().unwrap()).collect()
            });
            for out in outputs {
                assert_close(&out, &expected, 1e-4);
            }
        }
    }

    #[test]
    fn local_head_count_follows_shard() {
        let dim = 64;
        let num_heads = 8;
        let mut rng = StdRng::seed_from_u64(3);
        let weights = SelfAttentionWeights::random(dim, &mut rng, &Device::Cpu).unwrap();

        let handles = ThreadGroup::new(4).unwrap();
        let locals: Vec<(usize, usize)> = std::thread::scope(|s| {
            let joins: Vec<_> = handles
                .into_iter()
                .map(|h| {
                    let weights = weights.clone();
                    s.spawn(move || {
                        let attn =
                            SelfAttention::from_full(&weights, num_heads, 0.0, 0.0, Arc::new(h))
                                .unwrap();
                        (attn.local_heads(), attn.head_dim())
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });
        for (local_heads, head_dim) in locals {
            assert_eq!(local_heads, 2); // 8 heads over 4 ranks
            assert_eq!(head_dim, 8); // global: dim / num_heads
        }
    }

    #[test]
    fn shard_config_of_reads_communicator() {
        let handles = ThreadGroup::new(2).unwrap();
        let shard = ShardConfig::of(&handles[1]);
        assert_eq!(shard.rank, 1);
        assert_eq!(shard.world_size, 2);
    }
}
