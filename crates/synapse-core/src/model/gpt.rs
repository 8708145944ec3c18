//! Stacked transformer model.

use crate::comm::Communicator;
use crate::error::{Result, SynapseError};
use crate::model::{GptConfig, GptLayer, GptWeights};
use candle_core::{Device, Tensor};
use std::sync::Arc;

/// An ordered stack of [`GptLayer`] blocks.
///
/// All blocks share one configuration but are independently parameterized.
/// A stack of depth zero is the identity transform.
pub struct Gpt {
    layers: Vec<GptLayer>,
    config: GptConfig,
}

impl Gpt {
    /// Build from full logical weights, keeping this rank's shards.
    ///
    /// The configuration is validated against the group's world size before
    /// any weight is sliced.
    pub fn from_full(
        config: &GptConfig,
        weights: &GptWeights,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        config.validate(comm.world_size())?;
        if weights.layers.len() != config.depth {
            return Err(SynapseError::Config(format!(
                "weights carry {} layers, config expects depth {}",
                weights.layers.len(),
                config.depth
            )));
        }
        let layers = weights
            .layers
            .iter()
            .map(|w| GptLayer::from_full(w, config, comm.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            config: config.clone(),
        })
    }

    /// Create with random local weights (for testing).
    pub fn random(config: &GptConfig, comm: Arc<dyn Communicator>, device: &Device) -> Result<Self> {
        config.validate(comm.world_size())?;
        let layers = (0..config.depth)
            .map(|_| GptLayer::random(config, comm.clone(), device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            config: config.clone(),
        })
    }

    /// Forward pass: apply every block in order to `[batch, seq, dim]`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x, train)?;
        }
        Ok(x)
    }

    /// Model configuration.
    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Number of blocks.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}
