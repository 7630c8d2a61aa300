//! Model configuration.

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Shape hyperparameters of the transformer. Fixed for the life of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub max_seq_len: usize,
    #[serde(default)]
    pub dropout: f32,
    /// Forbid attention to later positions.
    #[serde(default)]
    pub causal: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

impl ModelConfig {
    pub fn new(
        vocab_size: usize,
        d_model: usize,
        n_layers: usize,
        n_heads: usize,
        max_seq_len: usize,
    ) -> Self {
        Self {
            vocab_size,
            d_model,
            n_layers,
            n_heads,
            max_seq_len,
            dropout: 0.0,
            causal: false,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    /// Deployment-log model: 6k-token vocabulary, 6 blocks of width 256.
    pub fn argo_logs() -> Self {
        Self::new(6000, 256, 6, 8, 512).with_dropout(0.1)
    }

    /// Tiny config for tests and quick iteration.
    pub fn tiny() -> Self {
        Self::new(64, 16, 2, 4, 32)
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_layer_norm_eps(mut self, eps: f32) -> Self {
        self.layer_norm_eps = eps;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Hidden width of the feed-forward sub-block.
    pub fn d_ff(&self) -> usize {
        4 * self.d_model
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("d_model", self.d_model),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("max_seq_len", self.max_seq_len),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ModelError::Config(format!("{} must be positive", name)));
            }
        }
        if self.d_model % self.n_heads != 0 {
            return Err(ModelError::Config(format!(
                "d_model {} is not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::Config(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        if !(self.layer_norm_eps.is_finite() && self.layer_norm_eps > 0.0) {
            return Err(ModelError::Config(format!(
                "layer_norm_eps {} must be finite and positive",
                self.layer_norm_eps
            )));
        }
        if self.parameter_count().is_none() {
            return Err(ModelError::Config("parameter count overflows usize".to_string()));
        }
        Ok(())
    }

    /// Number of scalar parameters a model of this shape holds, or `None`
    /// when the count does not fit in `usize`.
    pub fn parameter_count(&self) -> Option<usize> {
        let d = self.d_model;
        let d_ff = d.checked_mul(4)?;
        let linear = |fan_in: usize, fan_out: usize| {
            fan_in.checked_mul(fan_out)?.checked_add(fan_out)
        };
        let per_block = [
            d.checked_mul(4)?, // ln1, ln2
            linear(d, d)?.checked_mul(4)?, // q, k, v, out projections
            linear(d, d_ff)?,
            linear(d_ff, d)?,
        ]
        .into_iter()
        .try_fold(0usize, usize::checked_add)?;
        [
            self.vocab_size.checked_mul(d)?,
            self.max_seq_len.checked_mul(d)?,
            self.n_layers.checked_mul(per_block)?,
            d.checked_mul(2)?,
            d.checked_mul(self.vocab_size)?,
        ]
        .into_iter()
        .try_fold(0usize, usize::checked_add)
    }

    /// Load from a JSON file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = serde_json::to_string_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        ModelConfig::tiny().validate().expect("tiny");
        let argo = ModelConfig::argo_logs();
        argo.validate().expect("argo");
        assert_eq!(argo.head_dim(), 32);
        assert_eq!(argo.d_ff(), 1024);
        assert!(!argo.causal);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let err = ModelConfig::new(10, 6, 1, 4, 8).validate().unwrap_err();
        assert!(matches!(err, ModelError::Config(_)));
    }

    #[test]
    fn rejects_zero_sizes_and_bad_dropout() {
        assert!(ModelConfig::new(0, 4, 1, 2, 5).validate().is_err());
        assert!(ModelConfig::new(10, 4, 1, 2, 0).validate().is_err());
        assert!(ModelConfig::new(10, 4, 1, 0, 5).validate().is_err());
        assert!(ModelConfig::new(10, 4, 1, 2, 5)
            .with_dropout(1.0)
            .validate()
            .is_err());
        assert!(ModelConfig::new(10, 4, 1, 2, 5)
            .with_dropout(f32::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = r#"{"vocab_size":10,"d_model":4,"n_layers":1,"n_heads":2,"max_seq_len":5}"#;
        let config: ModelConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config, ModelConfig::new(10, 4, 1, 2, 5));
        assert_eq!(config.layer_norm_eps, 1e-5);
    }

    #[test]
    fn parameter_count_for_small_model() {
        // V=10 D=4 L=1 S=5: 40 + 20 + (16 + 80 + 80 + 68) + 8 + 40
        assert_eq!(ModelConfig::new(10, 4, 1, 2, 5).parameter_count(), Some(352));
    }

    #[test]
    fn rejects_configs_too_large_to_count() {
        let huge = ModelConfig::new(usize::MAX / 2, 4, 1, 2, 5);
        assert_eq!(huge.parameter_count(), None);
        assert!(matches!(huge.validate(), Err(ModelError::Config(_))));

        let wide = ModelConfig::new(10, usize::MAX / 2, 1, 1, 5);
        assert_eq!(wide.parameter_count(), None);
        assert!(matches!(wide.validate(), Err(ModelError::Config(_))));
    }
}
