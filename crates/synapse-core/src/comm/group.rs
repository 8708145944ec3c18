//! Communicator trait and the trivial single-process group.

use crate::error::Result;
use candle_core::Tensor;

/// A model-parallel communication group.
///
/// Every sharded layer receives an `Arc<dyn Communicator>` at construction.
/// Collectives are blocking and synchronous: the returned tensor is valid on
/// every rank once the call completes. All ranks must reach the same
/// collectives in the same order with matching shapes; a disagreement is
/// fatal to the forward pass.
pub trait Communicator: Send + Sync {
    /// Number of participating ranks in the group.
    fn world_size(&self) -> usize;

    /// This participant's rank, in `0..world_size`.
    fn rank(&self) -> usize;

    /// Elementwise sum of every rank's tensor. Same shape in and out.
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Concatenate every rank's tensor along `dim`, in rank order.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;
}

/// Single-rank group: no peers, every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl SingleProcess {
    /// Create a single-process communicator.
    pub fn new() -> Self {
        Self
    }
}

impl Communicator for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}
