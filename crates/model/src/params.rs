//! Parameter tensors and their naming scheme.
//!
//! Every tensor has a stable name (`blocks.{i}.attn.w_q`, ...) shared by
//! initialisation, validation and the checkpoint format. Linear weights are
//! stored as `(in, out)` so a projection is `x.dot(&w)`.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use fastrand::Rng;
use ndarray::{Array1, Array2, ArrayD, ArrayViewD, Dimension, IxDyn};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNormParams {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttentionParams {
    pub w_q: Array2<f32>,
    pub w_k: Array2<f32>,
    pub w_v: Array2<f32>,
    pub w_o: Array2<f32>,
    pub b_q: Array1<f32>,
    pub b_k: Array1<f32>,
    pub b_v: Array1<f32>,
    pub b_o: Array1<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardParams {
    pub w_up: Array2<f32>,   // (d_model, d_ff)
    pub b_up: Array1<f32>,
    pub w_down: Array2<f32>, // (d_ff, d_model)
    pub b_down: Array1<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockParams {
    pub ln1: LayerNormParams,
    pub attn: AttentionParams,
    pub ln2: LayerNormParams,
    pub ff: FeedForwardParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub token_embedding: Array2<f32>,    // (vocab_size, d_model)
    pub position_embedding: Array2<f32>, // (max_seq_len, d_model)
    pub blocks: Vec<BlockParams>,
    pub final_norm: LayerNormParams,
    pub lm_head: Array2<f32>, // (d_model, vocab_size)
}

/// How a freshly initialised tensor is filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    StandardNormal,
    /// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    Uniform { fan_in: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl TensorSpec {
    fn new(name: impl Into<String>, shape: &[usize], init: Init) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            init,
        }
    }

    fn sample(&self, rng: &mut Rng) -> ArrayD<f32> {
        let shape = IxDyn(&self.shape);
        match self.init {
            Init::Zeros => ArrayD::zeros(shape),
            Init::Ones => ArrayD::ones(shape),
            Init::StandardNormal => ArrayD::from_shape_simple_fn(shape, || standard_normal(rng)),
            Init::Uniform { fan_in } => {
                let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                ArrayD::from_shape_simple_fn(shape, || (rng.f32() * 2.0 - 1.0) * bound)
            }
        }
    }
}

/// Box-Muller draw from N(0, 1).
fn standard_normal(rng: &mut Rng) -> f32 {
    let u1 = 1.0 - rng.f32();
    let u2 = rng.f32();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Name, shape and initialiser of every tensor a model of `config` holds.
pub fn tensor_specs(config: &ModelConfig) -> Vec<TensorSpec> {
    let d = config.d_model;
    let d_ff = config.d_ff();
    let mut specs = vec![
        TensorSpec::new("token_embedding", &[config.vocab_size, d], Init::StandardNormal),
        TensorSpec::new("position_embedding", &[config.max_seq_len, d], Init::Zeros),
    ];

    let norm = |specs: &mut Vec<TensorSpec>, prefix: &str| {
        specs.push(TensorSpec::new(format!("{prefix}.gamma"), &[d], Init::Ones));
        specs.push(TensorSpec::new(format!("{prefix}.beta"), &[d], Init::Zeros));
    };

    for layer in 0..config.n_layers {
        let prefix = format!("blocks.{layer}");
        norm(&mut specs, &format!("{prefix}.ln1"));
        for proj in ["w_q", "w_k", "w_v", "w_o"] {
            specs.push(TensorSpec::new(
                format!("{prefix}.attn.{proj}"),
                &[d, d],
                Init::Uniform { fan_in: d },
            ));
        }
        for bias in ["b_q", "b_k", "b_v", "b_o"] {
            specs.push(TensorSpec::new(format!("{prefix}.attn.{bias}"), &[d], Init::Zeros));
        }
        norm(&mut specs, &format!("{prefix}.ln2"));
        let up = Init::Uniform { fan_in: d };
        let down = Init::Uniform { fan_in: d_ff };
        specs.push(TensorSpec::new(format!("{prefix}.ff.w_up"), &[d, d_ff], up));
        specs.push(TensorSpec::new(format!("{prefix}.ff.b_up"), &[d_ff], up));
        specs.push(TensorSpec::new(format!("{prefix}.ff.w_down"), &[d_ff, d], down));
        specs.push(TensorSpec::new(format!("{prefix}.ff.b_down"), &[d], down));
    }

    norm(&mut specs, "final_norm");
    specs.push(TensorSpec::new(
        "lm_head",
        &[d, config.vocab_size],
        Init::Uniform { fan_in: d },
    ));
    specs
}

/// Pulls named tensors out of a map, checking each against its expected shape.
struct TensorTaker<'a> {
    tensors: HashMap<String, ArrayD<f32>>,
    expected: HashMap<&'a str, &'a [usize]>,
}

impl<'a> TensorTaker<'a> {
    fn take(&mut self, name: &str) -> Result<ArrayD<f32>> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| ModelError::ShapeMismatch(format!("missing tensor '{}'", name)))?;
        let expected = self.expected.get(name).copied().unwrap_or(&[]);
        if tensor.shape() != expected {
            return Err(ModelError::ShapeMismatch(format!(
                "tensor '{}' has shape {:?}, expected {:?}",
                name,
                tensor.shape(),
                expected
            )));
        }
        Ok(tensor)
    }

    fn vector(&mut self, name: &str) -> Result<Array1<f32>> {
        into_dim(self.take(name)?, name)
    }

    fn matrix(&mut self, name: &str) -> Result<Array2<f32>> {
        into_dim(self.take(name)?, name)
    }

    fn norm(&mut self, prefix: &str) -> Result<LayerNormParams> {
        Ok(LayerNormParams {
            gamma: self.vector(&format!("{prefix}.gamma"))?,
            beta: self.vector(&format!("{prefix}.beta"))?,
        })
    }

    fn finish(self) -> Result<()> {
        if let Some(name) = self.tensors.keys().min() {
            return Err(ModelError::ShapeMismatch(format!(
                "unexpected tensor '{}' ({} left over)",
                name,
                self.tensors.len()
            )));
        }
        Ok(())
    }
}

fn into_dim<D: Dimension>(tensor: ArrayD<f32>, name: &str) -> Result<ndarray::Array<f32, D>> {
    tensor
        .into_dimensionality::<D>()
        .map_err(|err| ModelError::ShapeMismatch(format!("tensor '{}': {}", name, err)))
}

impl Parameters {
    /// Random initialisation drawn from the caller's generator.
    pub fn init(config: &ModelConfig, rng: &mut Rng) -> Result<Self> {
        config.validate()?;
        let tensors = tensor_specs(config)
            .into_iter()
            .map(|spec| {
                let tensor = spec.sample(rng);
                (spec.name, tensor)
            })
            .collect();
        Self::from_named_tensors(config, tensors)
    }

    /// Assemble parameters from a name-to-tensor map.
    ///
    /// Fails with `ShapeMismatch` on a missing tensor, a wrong shape, or any
    /// tensor the configuration does not call for.
    pub fn from_named_tensors(
        config: &ModelConfig,
        tensors: HashMap<String, ArrayD<f32>>,
    ) -> Result<Self> {
        let specs = tensor_specs(config);
        let mut taker = TensorTaker {
            tensors,
            expected: specs
                .iter()
                .map(|spec| (spec.name.as_str(), spec.shape.as_slice()))
                .collect(),
        };

        let token_embedding = taker.matrix("token_embedding")?;
        let position_embedding = taker.matrix("position_embedding")?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            let prefix = format!("blocks.{layer}");
            let ln1 = taker.norm(&format!("{prefix}.ln1"))?;
            let attn = AttentionParams {
                w_q: taker.matrix(&format!("{prefix}.attn.w_q"))?,
                w_k: taker.matrix(&format!("{prefix}.attn.w_k"))?,
                w_v: taker.matrix(&format!("{prefix}.attn.w_v"))?,
                w_o: taker.matrix(&format!("{prefix}.attn.w_o"))?,
                b_q: taker.vector(&format!("{prefix}.attn.b_q"))?,
                b_k: taker.vector(&format!("{prefix}.attn.b_k"))?,
                b_v: taker.vector(&format!("{prefix}.attn.b_v"))?,
                b_o: taker.vector(&format!("{prefix}.attn.b_o"))?,
            };
            let ln2 = taker.norm(&format!("{prefix}.ln2"))?;
            let ff = FeedForwardParams {
                w_up: taker.matrix(&format!("{prefix}.ff.w_up"))?,
                b_up: taker.vector(&format!("{prefix}.ff.b_up"))?,
                w_down: taker.matrix(&format!("{prefix}.ff.w_down"))?,
                b_down: taker.vector(&format!("{prefix}.ff.b_down"))?,
            };
            blocks.push(BlockParams { ln1, attn, ln2, ff });
        }

        let final_norm = taker.norm("final_norm")?;
        let lm_head = taker.matrix("lm_head")?;
        taker.finish()?;

        Ok(Self {
            token_embedding,
            position_embedding,
            blocks,
            final_norm,
            lm_head,
        })
    }

    /// Every tensor under its checkpoint name, in `tensor_specs` order.
    pub fn named_tensors(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut out = vec![
            ("token_embedding".to_string(), self.token_embedding.view().into_dyn()),
            ("position_embedding".to_string(), self.position_embedding.view().into_dyn()),
        ];

        fn push_norm<'a>(
            out: &mut Vec<(String, ArrayViewD<'a, f32>)>,
            prefix: &str,
            norm: &'a LayerNormParams,
        ) {
            out.push((format!("{prefix}.gamma"), norm.gamma.view().into_dyn()));
            out.push((format!("{prefix}.beta"), norm.beta.view().into_dyn()));
        }

        for (layer, block) in self.blocks.iter().enumerate() {
            let prefix = format!("blocks.{layer}");
            push_norm(&mut out, &format!("{prefix}.ln1"), &block.ln1);
            let attn = &block.attn;
            let weights = [
                ("w_q", &attn.w_q),
                ("w_k", &attn.w_k),
                ("w_v", &attn.w_v),
                ("w_o", &attn.w_o),
            ];
            for (name, w) in weights {
                out.push((format!("{prefix}.attn.{name}"), w.view().into_dyn()));
            }
            let biases = [
                ("b_q", &attn.b_q),
                ("b_k", &attn.b_k),
                ("b_v", &attn.b_v),
                ("b_o", &attn.b_o),
            ];
            for (name, b) in biases {
                out.push((format!("{prefix}.attn.{name}"), b.view().into_dyn()));
            }
            push_norm(&mut out, &format!("{prefix}.ln2"), &block.ln2);
            let ff = &block.ff;
            out.push((format!("{prefix}.ff.w_up"), ff.w_up.view().into_dyn()));
            out.push((format!("{prefix}.ff.b_up"), ff.b_up.view().into_dyn()));
            out.push((format!("{prefix}.ff.w_down"), ff.w_down.view().into_dyn()));
            out.push((format!("{prefix}.ff.b_down"), ff.b_down.view().into_dyn()));
        }

        push_norm(&mut out, "final_norm", &self.final_norm);
        out.push(("lm_head".to_string(), self.lm_head.view().into_dyn()));
        out
    }

    /// Check every tensor against the shapes `config` requires.
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        if self.blocks.len() != config.n_layers {
            return Err(ModelError::ShapeMismatch(format!(
                "{} blocks present, config expects {}",
                self.blocks.len(),
                config.n_layers
            )));
        }
        for ((name, tensor), spec) in self.named_tensors().iter().zip(tensor_specs(config)) {
            if tensor.shape() != spec.shape.as_slice() {
                return Err(ModelError::ShapeMismatch(format!(
                    "tensor '{}' has shape {:?}, expected {:?}",
                    name,
                    tensor.shape(),
                    spec.shape
                )));
            }
        }
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        self.named_tensors().iter().map(|(_, t)| t.len()).sum()
    }
}
