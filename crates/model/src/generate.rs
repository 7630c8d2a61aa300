//! Autoregressive generation on top of the pure forward pass.
//!
//! There is no KV cache: each step re-runs the whole context, truncated to
//! the last `max_seq_len` tokens.

use crate::error::{ModelError, Result};
use crate::model::Model;
use fastrand::Rng;
use ndarray::{s, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use themis_kernels::softmax;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Below `1e-5` sampling is greedy.
    pub temperature: f32,
    /// Generation stops after this token is produced.
    pub stop_token: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 16,
            temperature: 0.0,
            stop_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationMetrics {
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub tokens_generated: usize,
    pub tokens_per_sec: f64,
}

/// Extend `prompt` by up to `settings.max_new_tokens` tokens.
///
/// Returns only the new tokens. Every step reads a fresh parameter snapshot,
/// so a concurrent replacement takes effect from the next token on.
pub fn generate(
    model: &Model,
    prompt: &[usize],
    settings: &GenerationConfig,
    rng: &mut Rng,
) -> Result<(Vec<usize>, GenerationMetrics)> {
    let config = model.config();
    if prompt.is_empty() {
        return Err(ModelError::OutOfRange("prompt is empty".to_string()));
    }
    if !settings.temperature.is_finite() || settings.temperature < 0.0 {
        return Err(ModelError::Config(format!(
            "temperature must be finite and non-negative, got {}",
            settings.temperature
        )));
    }
    if let Some(stop) = settings.stop_token {
        if stop >= config.vocab_size {
            return Err(ModelError::OutOfRange(format!(
                "stop token {} is outside the vocabulary of {}",
                stop, config.vocab_size
            )));
        }
    }
    if !config.causal {
        warn!("generating with a non-causal model; later positions see the future");
    }

    let mut context = prompt.to_vec();
    let mut generated = Vec::with_capacity(settings.max_new_tokens);
    let mut prefill_ms = 0.0;
    let decode_start = Instant::now();

    for step in 0..settings.max_new_tokens {
        let start = Instant::now();
        let window = &context[context.len().saturating_sub(config.max_seq_len)..];
        let ids = Array2::from_shape_vec((1, window.len()), window.to_vec())
            .map_err(|e| ModelError::ShapeMismatch(e.to_string()))?;
        let logits = model.forward(ids.view())?;
        let last = logits.slice(s![0, window.len() - 1, ..]);
        let token = sample(last, settings.temperature, rng);
        if step == 0 {
            prefill_ms = start.elapsed().as_secs_f64() * 1000.0;
        }

        generated.push(token);
        context.push(token);
        if settings.stop_token == Some(token) {
            break;
        }
    }

    let total_ms = decode_start.elapsed().as_secs_f64() * 1000.0;
    let decode_ms = (total_ms - prefill_ms).max(0.0);
    let decoded = generated.len().saturating_sub(1);
    let tokens_per_sec = if decode_ms > 0.0 {
        decoded as f64 / decode_ms * 1000.0
    } else {
        0.0
    };

    let metrics = GenerationMetrics {
        prefill_ms,
        decode_ms,
        tokens_generated: generated.len(),
        tokens_per_sec,
    };
    info!(
        prompt = prompt.len(),
        tokens = metrics.tokens_generated,
        prefill_ms = metrics.prefill_ms,
        decode_ms = metrics.decode_ms,
        "generation finished"
    );
    Ok((generated, metrics))
}

/// Pick the next token from one position's logits.
pub fn sample(logits: ArrayView1<'_, f32>, temperature: f32, rng: &mut Rng) -> usize {
    if temperature < 1e-5 {
        return logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
    }

    let scaled = logits.mapv(|x| x / temperature);
    let probs = softmax(scaled.view());
    let draw = rng.f32();
    let mut cumsum = 0.0;
    for (idx, &p) in probs.iter().enumerate() {
        cumsum += p;
        if draw < cumsum {
            return idx;
        }
    }
    probs.len().saturating_sub(1)
}
