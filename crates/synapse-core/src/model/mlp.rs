//! Tensor-parallel feed-forward sublayer.
//!
//! Expands `dim` to `dim * ratio` through a column-sharded projection, applies
//! GELU to the local slice (elementwise, so it commutes with sharding), and
//! contracts back through a row-sharded projection. One all-reduce per call.

use crate::comm::Communicator;
use crate::error::Result;
use crate::model::FeedForwardWeights;
use crate::parallel::{ColumnParallelLinear, RowParallelLinear, ShardedTensor};
use candle_core::{Device, Tensor};
use std::sync::Arc;

/// Feed-forward block: column-sharded expansion, GELU, row-sharded
/// contraction.
pub struct FeedForward {
    up: ColumnParallelLinear,
    down: RowParallelLinear,
    hidden_size: usize,
    intermediate_size: usize,
}

impl FeedForward {
    /// Build from full logical weights, keeping this rank's shards.
    pub fn from_full(weights: &FeedForwardWeights, comm: Arc<dyn Communicator>) -> Result<Self> {
        let (intermediate_size, hidden_size) = weights.up_weight.dims2()?;
        let up = ColumnParallelLinear::from_full(
            weights.up_weight.clone(),
            Some(weights.up_bias.clone()),
            comm.clone(),
        )?;
        let down = RowParallelLinear::from_full(
            weights.down_weight.clone(),
            Some(weights.down_bias.clone()),
            comm,
        )?;
        Ok(Self {
            up,
            down,
            hidden_size,
            intermediate_size,
        })
    }

    /// Create with random local weights (for testing).
    pub fn random(
        hidden_size: usize,
        ratio: usize,
        comm: Arc<dyn Communicator>,
        device: &Device,
    ) -> Result<Self> {
        let intermediate_size = hidden_size * ratio;
        let up = ColumnParallelLinear::random(hidden_size, intermediate_size, comm.clone(), device)?;
        let down = RowParallelLinear::random(intermediate_size, hidden_size, comm, device)?;
        Ok(Self {
            up,
            down,
            hidden_size,
            intermediate_size,
        })
    }

    /// Forward pass over `[batch, seq, hidden_size]`, replicated on every
    /// rank. The intermediate activation stays sharded end to end.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let intermediate = self.up.forward(x)?;
        let activated = ShardedTensor::new(intermediate.as_tensor().gelu_erf()?);
        self.down.forward(&activated)
    }

    /// Hidden dimension.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Expanded intermediate dimension (logical, unsharded).
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }
}
