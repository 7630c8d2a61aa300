//! The transformer stack as a pure function of (config, parameters, input).
//!
//! ```text
//! ids ─► embed ─► [ x + attn(ln1(x)) ─► x + ff(ln2(x)) ] × L ─► ln_f ─► lm_head ─► logits
//! ```
//!
//! Sequences in a batch are independent and run in parallel; heads inside a
//! block run in parallel too. Nothing outlives the call.

use crate::attention::SelfAttention;
use crate::cancel::CancellationToken;
use crate::config::ModelConfig;
use crate::embedding::{embed, validate_tokens};
use crate::error::{ModelError, Result};
use crate::feed_forward::FeedForward;
use crate::params::Parameters;
use fastrand::Rng;
use ndarray::{Array2, Array3, Array4, ArrayView2, Axis};
use rayon::prelude::*;
use themis_kernels::{
    attention_mask, default_kernel, layer_norm, linear, ActivationKind, DynMatmulKernel,
    MatmulKernel,
};

/// Per-call settings shared by every sub-block of one sequence.
pub struct StepContext<'a> {
    pub kernel: &'a dyn MatmulKernel,
    pub eps: f32,
    pub dropout: f32,
    pub mask: Option<ArrayView2<'a, f32>>,
}

pub enum Mode<'a> {
    /// Dropout disabled; output is a deterministic function of the input.
    Inference,
    /// Dropout enabled, driven by the caller's generator.
    Training(&'a mut Rng),
}

pub struct ForwardOptions<'a> {
    pub mode: Mode<'a>,
    pub kernel: DynMatmulKernel,
    pub cancel: Option<&'a CancellationToken>,
    /// Valid prefix length of each row; positions past it are padding.
    pub lengths: Option<&'a [usize]>,
}

impl Default for ForwardOptions<'_> {
    fn default() -> Self {
        Self {
            mode: Mode::Inference,
            kernel: default_kernel(),
            cancel: None,
            lengths: None,
        }
    }
}

impl<'a> ForwardOptions<'a> {
    pub fn inference() -> Self {
        Self::default()
    }

    pub fn training(rng: &'a mut Rng) -> Self {
        Self {
            mode: Mode::Training(rng),
            ..Self::default()
        }
    }

    pub fn with_kernel(mut self, kernel: DynMatmulKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_lengths(mut self, lengths: &'a [usize]) -> Self {
        self.lengths = Some(lengths);
        self
    }
}

pub struct ForwardOutput {
    /// `(batch, seq_len, vocab_size)`.
    pub logits: Array3<f32>,
    /// Per layer, `(batch, n_heads, seq_len, seq_len)`; empty unless requested.
    pub attention: Vec<Array4<f32>>,
}

struct SequenceOutput {
    logits: Array2<f32>,
    attention: Vec<Array3<f32>>,
}

/// Token ids `(batch, seq_len)` to logits `(batch, seq_len, vocab_size)`.
pub fn forward(
    config: &ModelConfig,
    params: &Parameters,
    ids: ArrayView2<'_, usize>,
    options: ForwardOptions<'_>,
) -> Result<Array3<f32>> {
    run(config, params, ids, options, false).map(|out| out.logits)
}

/// Like [`forward`], optionally keeping every layer's attention weights.
pub fn run(
    config: &ModelConfig,
    params: &Parameters,
    ids: ArrayView2<'_, usize>,
    options: ForwardOptions<'_>,
    record_attention: bool,
) -> Result<ForwardOutput> {
    config.validate()?;
    validate_tokens(config, ids)?;
    params.validate(config)?;
    let (batch, seq_len) = ids.dim();
    if let Some(lengths) = options.lengths {
        validate_lengths(lengths, batch, seq_len)?;
    }
    check_cancelled(options.cancel)?;

    let ForwardOptions {
        mode,
        kernel,
        cancel,
        lengths,
    } = options;

    let (dropout, seeds) = match mode {
        Mode::Inference => (0.0, None),
        Mode::Training(rng) => {
            let seeds: Vec<u64> = (0..batch).map(|_| rng.u64(..)).collect();
            (config.dropout, Some(seeds))
        }
    };
    let training = seeds.is_some() && dropout > 0.0;

    let hidden = embed(config, params, ids)?;

    let sequences = (0..batch)
        .into_par_iter()
        .map(|row| -> Result<SequenceOutput> {
            let mask = attention_mask(seq_len, config.causal, lengths.map(|l| l[row]))?;
            let ctx = StepContext {
                kernel: kernel.as_ref(),
                eps: config.layer_norm_eps,
                dropout,
                mask: mask.as_ref().map(|m| m.view()),
            };
            let mut rng = seeds
                .as_ref()
                .filter(|_| training)
                .map(|seeds| Rng::with_seed(seeds[row]));

            let mut x = hidden.index_axis(Axis(0), row).to_owned();
            let mut attention = Vec::new();
            for block in &params.blocks {
                check_cancelled(cancel)?;
                let attn = SelfAttention {
                    norm: &block.ln1,
                    params: &block.attn,
                    n_heads: config.n_heads,
                }
                .forward(x.view(), &ctx, rng.as_mut(), record_attention)?;
                if let Some(weights) = attn.weights {
                    attention.push(weights);
                }

                check_cancelled(cancel)?;
                x = FeedForward {
                    norm: &block.ln2,
                    params: &block.ff,
                }
                .forward(attn.hidden.view(), &ctx, rng.as_mut())?;
            }
            check_cancelled(cancel)?;

            let final_norm = &params.final_norm;
            let normed = layer_norm(
                x.view(),
                final_norm.gamma.view(),
                final_norm.beta.view(),
                config.layer_norm_eps,
            )?;
            let logits = linear(
                kernel.as_ref(),
                normed.view(),
                params.lm_head.view(),
                None,
                ActivationKind::None,
            )?;
            Ok(SequenceOutput { logits, attention })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut logits = Array3::<f32>::zeros((batch, seq_len, config.vocab_size));
    let mut attention: Vec<Array4<f32>> = if record_attention {
        (0..config.n_layers)
            .map(|_| Array4::<f32>::zeros((batch, config.n_heads, seq_len, seq_len)))
            .collect()
    } else {
        Vec::new()
    };
    for (row, sequence) in sequences.into_iter().enumerate() {
        logits.index_axis_mut(Axis(0), row).assign(&sequence.logits);
        for (layer, weights) in sequence.attention.iter().enumerate() {
            attention[layer].index_axis_mut(Axis(0), row).assign(weights);
        }
    }

    Ok(ForwardOutput { logits, attention })
}

fn validate_lengths(lengths: &[usize], batch: usize, seq_len: usize) -> Result<()> {
    if lengths.len() != batch {
        return Err(ModelError::ShapeMismatch(format!(
            "{} lengths supplied for a batch of {}",
            lengths.len(),
            batch
        )));
    }
    if let Some((row, len)) = lengths
        .iter()
        .enumerate()
        .find(|(_, len)| **len == 0 || **len > seq_len)
    {
        return Err(ModelError::OutOfRange(format!(
            "row {} has length {}, expected 1..={}",
            row, len, seq_len
        )));
    }
    Ok(())
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(ModelError::Cancelled),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use themis_kernels::kernel_by_name;

    fn model(causal: bool) -> (ModelConfig, Parameters) {
        let config = ModelConfig::new(16, 8, 2, 2, 6).with_causal(causal);
        let params = Parameters::init(&config, &mut Rng::with_seed(99)).expect("init");
        (config, params)
    }

    #[test]
    fn kernels_agree_on_logits() {
        let (config, params) = model(false);
        let ids = array![[3usize, 1, 4, 1, 5], [9, 2, 6, 5, 3]];
        let reference = forward(&config, &params, ids.view(), ForwardOptions::inference())
            .expect("forward");
        let parallel = forward(
            &config,
            &params,
            ids.view(),
            ForwardOptions::inference().with_kernel(kernel_by_name("parallel").unwrap()),
        )
        .expect("forward");
        for (a, b) in reference.iter().zip(parallel.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn recorded_attention_has_one_map_per_layer() {
        let (config, params) = model(true);
        let ids = array![[1usize, 2, 3], [4, 5, 6]];
        let out = run(&config, &params, ids.view(), ForwardOptions::inference(), true)
            .expect("forward");
        assert_eq!(out.attention.len(), 2);
        for layer in &out.attention {
            assert_eq!(layer.dim(), (2, 2, 3, 3));
            assert_eq!(layer[(1, 0, 0, 2)], 0.0);
        }
    }

    #[test]
    fn cancelled_token_stops_the_call() {
        let (config, params) = model(false);
        let token = CancellationToken::new();
        token.cancel();
        let err = forward(
            &config,
            &params,
            array![[1usize, 2]].view(),
            ForwardOptions::inference().with_cancellation(&token),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::Cancelled));
    }

    #[test]
    fn training_mode_is_reproducible_per_seed() {
        let config = ModelConfig::new(16, 8, 2, 2, 6).with_dropout(0.3);
        let params = Parameters::init(&config, &mut Rng::with_seed(4)).expect("init");
        let ids = array![[1usize, 2, 3, 4]];

        let mut rng_a = Rng::with_seed(10);
        let mut rng_b = Rng::with_seed(10);
        let a = forward(&config, &params, ids.view(), ForwardOptions::training(&mut rng_a))
            .expect("forward");
        let b = forward(&config, &params, ids.view(), ForwardOptions::training(&mut rng_b))
            .expect("forward");
        let eval = forward(&config, &params, ids.view(), ForwardOptions::inference())
            .expect("forward");
        assert_eq!(a, b);
        assert_ne!(a, eval);
    }

    #[test]
    fn parameters_must_match_the_config() {
        let config = ModelConfig::new(10, 8, 1, 2, 6);
        let narrow = Parameters::init(&ModelConfig::new(6, 8, 1, 2, 6), &mut Rng::with_seed(1))
            .expect("init");
        let err = forward(&config, &narrow, array![[8usize, 1]].view(), ForwardOptions::inference())
            .unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch(_)));

        let deep = Parameters::init(&ModelConfig::new(10, 8, 2, 2, 6), &mut Rng::with_seed(1))
            .expect("init");
        let err = run(&config, &deep, array![[1usize, 2]].view(), ForwardOptions::inference(), true)
            .err()
            .expect("extra blocks rejected");
        assert!(matches!(err, ModelError::ShapeMismatch(_)));
    }

    #[test]
    fn lengths_must_fit_the_batch() {
        let (config, params) = model(false);
        let ids = array![[1usize, 2, 3]];
        let too_many = [3usize, 3];
        assert!(matches!(
            forward(
                &config,
                &params,
                ids.view(),
                ForwardOptions::inference().with_lengths(&too_many)
            ),
            Err(ModelError::ShapeMismatch(_))
        ));
        let too_long = [4usize];
        assert!(matches!(
            forward(
                &config,
                &params,
                ids.view(),
                ForwardOptions::inference().with_lengths(&too_long)
            ),
            Err(ModelError::OutOfRange(_))
        ));
    }
}
