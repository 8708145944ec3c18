//! Column- and row-sharded linear layers.
//!
//! Weights are stored `[out_features, in_features]` and applied as
//! `y = x @ W^T + b`, matching the dense layer they replace. A column layer
//! owns a contiguous slice of `out_features`, a row layer a contiguous slice
//! of `in_features`.

use crate::comm::Communicator;
use crate::error::{Result, SynapseError};
use crate::parallel::ShardConfig;
use candle_core::{Device, Tensor};
use std::sync::Arc;

/// An activation tensor whose last dimension is this rank's shard of a
/// logically wider dimension.
///
/// Produced by [`ColumnParallelLinear::forward`] and consumed by
/// [`RowParallelLinear::forward`]; the wrapper keeps a still-sharded tensor
/// from being mistaken for a full-width one at compile time.
#[derive(Debug, Clone)]
pub struct ShardedTensor(Tensor);

impl ShardedTensor {
    /// Wrap a tensor whose last dimension is already this rank's shard.
    pub fn new(local: Tensor) -> Self {
        Self(local)
    }

    /// Borrow the local tensor.
    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }

    /// Unwrap into the local tensor.
    pub fn into_inner(self) -> Tensor {
        self.0
    }

    /// Local dimensions.
    pub fn dims(&self) -> &[usize] {
        self.0.dims()
    }
}

/// Apply `x @ W^T (+ b)` for an input with any number of leading batch
/// dimensions, reshaping through 2D for the matmul.
fn linear_2d(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let in_features = *dims.last().ok_or_else(|| {
        SynapseError::ShapeMismatch("linear input must have at least one dimension".to_string())
    })?;
    let rows: usize = dims[..dims.len() - 1].iter().product();

    let x_2d = x.reshape((rows, in_features))?;
    let mut y = x_2d.matmul(&weight.t()?)?;
    if let Some(b) = bias {
        y = y.broadcast_add(b)?;
    }

    let mut out_dims = dims;
    *out_dims.last_mut().expect("non-empty dims") = weight.dims()[0];
    Ok(y.reshape(out_dims)?)
}

/// Linear layer sharded along its output dimension.
///
/// The input is replicated on every rank; this rank computes the slice of
/// the output corresponding to its columns of the logical weight. No
/// communication happens in [`forward`](Self::forward); an explicit
/// [`forward_gathered`](Self::forward_gathered) reconstructs the full output
/// with an all-gather.
pub struct ColumnParallelLinear {
    /// Local weight slice `[out_features / world_size, in_features]`.
    weight: Tensor,
    /// Local bias slice `[out_features / world_size]`.
    bias: Option<Tensor>,
    /// Logical input width.
    in_features: usize,
    /// Logical (unsharded) output width.
    out_features: usize,
    comm: Arc<dyn Communicator>,
}

impl ColumnParallelLinear {
    /// Build from a full logical weight `[out_features, in_features]` and
    /// optional bias `[out_features]`, keeping only this rank's slice.
    pub fn from_full(
        weight: Tensor,
        bias: Option<Tensor>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let (start, len) = ShardConfig::of(comm.as_ref()).shard_range(out_features)?;
        let local_weight = weight.narrow(0, start, len)?;
        let local_bias = match bias {
            Some(b) => Some(b.narrow(0, start, len)?),
            None => None,
        };
        Ok(Self {
            weight: local_weight,
            bias: local_bias,
            in_features,
            out_features,
            comm,
        })
    }

    /// Create with random local weights (for testing).
    pub fn random(
        in_features: usize,
        out_features: usize,
        comm: Arc<dyn Communicator>,
        device: &Device,
    ) -> Result<Self> {
        let (_, len) = ShardConfig::of(comm.as_ref()).shard_range(out_features)?;
        let weight = Tensor::randn(0.0f32, 0.02, &[len, in_features], device)?;
        let bias = Tensor::zeros(len, candle_core::DType::F32, device)?;
        Ok(Self {
            weight,
            bias: Some(bias),
            in_features,
            out_features,
            comm,
        })
    }

    /// Forward pass keeping the output sharded. No communication.
    pub fn forward(&self, x: &Tensor) -> Result<ShardedTensor> {
        let last = x.dims().last().copied().unwrap_or(0);
        if last != self.in_features {
            return Err(SynapseError::ShapeMismatch(format!(
                "column-parallel input has width {}, expected {}",
                last, self.in_features
            )));
        }
        let local = linear_2d(x, &self.weight, self.bias.as_ref())?;
        Ok(ShardedTensor::new(local))
    }

    /// Forward pass reconstructing the full output via all-gather on the
    /// last dimension.
    pub fn forward_gathered(&self, x: &Tensor) -> Result<Tensor> {
        let local = self.forward(x)?;
        let dim = local.dims().len() - 1;
        self.comm.all_gather(local.as_tensor(), dim)
    }

    /// Logical input width.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Logical (unsharded) output width.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Width of this rank's output slice.
    pub fn local_out_features(&self) -> usize {
        self.weight.dims()[0]
    }
}

/// Linear layer sharded along its input dimension.
///
/// Consumes the sharded output of a preceding column layer without any
/// communication, computes a partial product, and completes the logical
/// output with an all-reduce sum. The bias is added exactly once, after the
/// reduction, so it is not multiplied by the world size.
pub struct RowParallelLinear {
    /// Local weight slice `[out_features, in_features / world_size]`.
    weight: Tensor,
    /// Full bias `[out_features]`, applied once after the all-reduce.
    bias: Option<Tensor>,
    /// Logical (unsharded) input width.
    in_features: usize,
    /// Logical output width.
    out_features: usize,
    comm: Arc<dyn Communicator>,
}

impl RowParallelLinear {
    /// Build from a full logical weight `[out_features, in_features]` and
    /// optional bias `[out_features]`, keeping only this rank's slice of the
    /// input dimension.
    pub fn from_full(
        weight: Tensor,
        bias: Option<Tensor>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let (start, len) = ShardConfig::of(comm.as_ref()).shard_range(in_features)?;
        let local_weight = weight.narrow(1, start, len)?;
        Ok(Self {
            weight: local_weight,
            bias,
            in_features,
            out_features,
            comm,
        })
    }

    /// Create with random local weights (for testing).
    pub fn random(
        in_features: usize,
        out_features: usize,
        comm: Arc<dyn Communicator>,
        device: &Device,
    ) -> Result<Self> {
        let (_, len) = ShardConfig::of(comm.as_ref()).shard_range(in_features)?;
        let weight = Tensor::randn(0.0f32, 0.02, &[out_features, len], device)?;
        let bias = Tensor::zeros(out_features, candle_core::DType::F32, device)?;
        Ok(Self {
            weight,
            bias: Some(bias),
            in_features,
            out_features,
            comm,
        })
    }

    /// Forward pass over an already-sharded input. One all-reduce.
    pub fn forward(&self, x: &ShardedTensor) -> Result<Tensor> {
        let local_in = self.weight.dims()[1];
        let last = x.dims().last().copied().unwrap_or(0);
        if last != local_in {
            return Err(SynapseError::ShapeMismatch(format!(
                "row-parallel input shard has width {}, expected {}",
                last, local_in
            )));
        }
        let partial = linear_2d(x.as_tensor(), &self.weight, None)?;
        let mut out = self.comm.all_reduce_sum(&partial)?;
        if let Some(b) = &self.bias {
            out = out.broadcast_add(b)?;
        }
        Ok(out)
    }

    /// Forward pass over a full replicated input: this rank slices out its
    /// own input chunk locally, then proceeds as [`forward`](Self::forward).
    pub fn forward_full(&self, x: &Tensor) -> Result<Tensor> {
        let last = x.dims().last().copied().unwrap_or(0);
        if last != self.in_features {
            return Err(SynapseError::ShapeMismatch(format!(
                "row-parallel input has width {}, expected {}",
                last, self.in_features
            )));
        }
        let (start, len) = ShardConfig::of(self.comm.as_ref()).shard_range(self.in_features)?;
        let local = x.narrow(x.dims().len() - 1, start, len)?;
        self.forward(&ShardedTensor::new(local))
    }

    /// Logical (unsharded) input width.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Logical output width.
    pub fn out_features(&self) -> usize {
        self.out_features
    }
}
