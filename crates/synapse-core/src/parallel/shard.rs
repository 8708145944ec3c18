//! Shard geometry for one rank of a model-parallel group.

use crate::comm::Communicator;
use crate::error::{Result, SynapseError};

/// This rank's position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This rank, in `0..world_size`.
    pub rank: usize,
    /// Total number of ranks in the group.
    pub world_size: usize,
}

impl ShardConfig {
    /// Read the shard geometry off a communicator.
    pub fn of(comm: &dyn Communicator) -> Self {
        Self {
            rank: comm.rank(),
            world_size: comm.world_size(),
        }
    }

    /// Compute this rank's slice of a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` covering `[start .. start + shard_size)`.
    /// A dimension that does not divide evenly by the world size is a
    /// configuration error, caught here before any weight is sliced.
    pub fn shard_range(&self, dim: usize) -> Result<(usize, usize)> {
        if self.world_size == 0 || dim % self.world_size != 0 {
            return Err(SynapseError::Config(format!(
                "dimension {} is not evenly divisible by world_size {}",
                dim, self.world_size
            )));
        }
        let shard_size = dim / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_range_first_and_last_rank() {
        let shard = ShardConfig {
            rank: 0,
            world_size: 4,
        };
        assert_eq!(shard.shard_range(128).unwrap(), (0, 32));

        let shard = ShardConfig {
            rank: 3,
            world_size: 4,
        };
        assert_eq!(shard.shard_range(128).unwrap(), (96, 32));
    }

    #[test]
    fn shard_range_single_rank_covers_all() {
        let shard = ShardConfig {
            rank: 0,
            world_size: 1,
        };
        assert_eq!(shard.shard_range(64).unwrap(), (0, 64));
    }

    #[test]
    fn shard_range_indivisible_is_config_error() {
        let shard = ShardConfig {
            rank: 0,
            world_size: 3,
        };
        assert!(matches!(
            shard.shard_range(128),
            Err(SynapseError::Config(_))
        ));
    }
}
