//! Model configuration.

use crate::error::{Result, SynapseError};
use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Element type for normalization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericType {
    /// IEEE half precision.
    F16,
    /// bfloat16.
    Bf16,
    /// Single precision.
    #[default]
    F32,
}

impl NumericType {
    /// Corresponding candle dtype.
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

/// Configuration for a tensor-parallel GPT stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GptConfig {
    /// Number of transformer blocks.
    pub depth: usize,
    /// Hidden dimension.
    pub dim: usize,
    /// Number of attention heads, global across all shards.
    pub num_heads: usize,
    /// Feed-forward expansion factor.
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: usize,
    /// Dropout probability on attention weights.
    #[serde(default)]
    pub attention_dropout: f32,
    /// Dropout probability on each sublayer's output.
    #[serde(default)]
    pub dropout: f32,
    /// Element type for normalization parameters.
    #[serde(default)]
    pub numeric_type: NumericType,
}

fn default_mlp_ratio() -> usize {
    4
}

impl GptConfig {
    /// Per-head feature width, `dim / num_heads`. Zero when `num_heads` is
    /// zero; [`validate`](Self::validate) rejects such a config outright.
    pub fn head_dim(&self) -> usize {
        if self.num_heads == 0 {
            return 0;
        }
        self.dim / self.num_heads
    }

    /// Feed-forward intermediate width, `dim * mlp_ratio`.
    pub fn intermediate_size(&self) -> usize {
        self.dim * self.mlp_ratio
    }

    /// Load from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Check every divisibility invariant against a group of `world_size`
    /// ranks, before any weight is allocated or sliced.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if world_size == 0 {
            return Err(SynapseError::Config(
                "world_size must be at least 1".to_string(),
            ));
        }
        if self.num_heads == 0 {
            return Err(SynapseError::Config("num_heads must be nonzero".to_string()));
        }
        if self.dim % self.num_heads != 0 {
            return Err(SynapseError::Config(format!(
                "dim {} is not divisible by num_heads {}",
                self.dim, self.num_heads
            )));
        }
        if self.dim % world_size != 0 {
            return Err(SynapseError::Config(format!(
                "dim {} is not divisible by world_size {}",
                self.dim, world_size
            )));
        }
        if self.num_heads % world_size != 0 {
            return Err(SynapseError::Config(format!(
                "num_heads {} is not divisible by world_size {}; each rank must own whole heads",
                self.num_heads, world_size
            )));
        }
        if self.intermediate_size() % world_size != 0 {
            return Err(SynapseError::Config(format!(
                "intermediate size {} is not divisible by world_size {}",
                self.intermediate_size(),
                world_size
            )));
        }
        Ok(())
    }
}

impl Default for GptConfig {
    fn default() -> Self {
        // GPT-2 small dimensions.
        Self {
            depth: 12,
            dim: 768,
            num_heads: 12,
            mlp_ratio: 4,
            attention_dropout: 0.0,
            dropout: 0.0,
            numeric_type: NumericType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sizes() {
        let config = GptConfig {
            depth: 3,
            dim: 64,
            num_heads: 8,
            ..Default::default()
        };
        assert_eq!(config.head_dim(), 8);
        assert_eq!(config.intermediate_size(), 256);
    }

    #[test]
    fn head_dim_with_zero_heads_does_not_panic() {
        let config = GptConfig {
            num_heads: 0,
            ..Default::default()
        };
        assert_eq!(config.head_dim(), 0);
        assert!(matches!(config.validate(1), Err(SynapseError::Config(_))));
    }

    #[test]
    fn validate_accepts_even_splits() {
        let config = GptConfig {
            depth: 2,
            dim: 64,
            num_heads: 8,
            ..Default::default()
        };
        for world_size in [1, 2, 4, 8] {
            config.validate(world_size).unwrap();
        }
    }

    #[test]
    fn validate_rejects_dim_not_divisible_by_heads() {
        let config = GptConfig {
            dim: 65,
            num_heads: 8,
            ..Default::default()
        };
        let err = config.validate(1).unwrap_err();
        assert!(err.to_string().contains("num_heads"));
    }

    #[test]
    fn validate_rejects_uneven_shard() {
        let config = GptConfig {
            dim: 64,
            num_heads: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(3),
            Err(SynapseError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_partial_heads() {
        // dim divides by 16 but 8 heads cannot be split over 16 ranks.
        let config = GptConfig {
            dim: 64,
            num_heads: 8,
            ..Default::default()
        };
        let err = config.validate(16).unwrap_err();
        assert!(err.to_string().contains("whole heads"));
    }

    #[test]
    fn deserialize_fills_defaults() {
        let config: GptConfig =
            serde_json::from_str(r#"{"depth": 2, "dim": 128, "num_heads": 4}"#).unwrap();
        assert_eq!(config.mlp_ratio, 4);
        assert_eq!(config.attention_dropout, 0.0);
        assert_eq!(config.numeric_type, NumericType::F32);
    }
}
