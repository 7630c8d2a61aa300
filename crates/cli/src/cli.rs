//! CLI wiring for checkpoint creation, inspection and inference.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fastrand::Rng;
use ndarray::ArrayView1;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use themis_kernels::{kernel_by_name, KERNEL_NAMES};
use themis_model::checkpoint::FORMAT_VERSION;
use themis_model::{
    generate, ForwardOptions, GenerationConfig, GenerationMetrics, Model, ModelConfig,
    TokenBatch,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "themis", about = "Decoder-only transformer toolkit")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum PresetArg {
    Tiny,
    ArgoLogs,
}

impl From<PresetArg> for ModelConfig {
    fn from(value: PresetArg) -> ModelConfig {
        match value {
            PresetArg::Tiny => ModelConfig::tiny(),
            PresetArg::ArgoLogs => ModelConfig::argo_logs(),
        }
    }
}

/// Comma-separated token ids, e.g. `1,2,3`.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenList(pub Vec<usize>);

impl FromStr for TokenList {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let ids = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|e| format!("invalid token id {:?}: {}", part, e))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(TokenList(ids))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Randomly initialise a model and write it as a checkpoint.
    Init {
        #[arg(long, value_enum, conflicts_with = "config")]
        preset: Option<PresetArg>,
        /// JSON model configuration.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = false)]
        causal: bool,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print a checkpoint's configuration and parameter count.
    Inspect {
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Run the forward pass and print the top-k logits per position.
    Forward {
        #[arg(long)]
        checkpoint: PathBuf,
        /// One sequence per occurrence; ragged sequences are padded.
        #[arg(long = "tokens", required = true)]
        tokens: Vec<TokenList>,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, default_value = "reference")]
        kernel: String,
        #[arg(long, default_value_t = 0)]
        pad_id: usize,
    },
    /// Autoregressively extend a prompt.
    Generate {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        tokens: TokenList,
        #[arg(long, default_value_t = 16)]
        max_new_tokens: usize,
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long)]
        stop_token: Option<usize>,
    },
}

#[derive(Serialize)]
struct InspectReport<'a> {
    format_version: &'a str,
    config: &'a ModelConfig,
    parameters: usize,
}

#[derive(Serialize)]
struct Candidate {
    token: usize,
    logit: f32,
}

#[derive(Serialize)]
struct PositionReport {
    position: usize,
    top: Vec<Candidate>,
}

#[derive(Serialize)]
struct SequenceReport {
    sequence: usize,
    positions: Vec<PositionReport>,
}

#[derive(Serialize)]
struct GenerateReport {
    prompt: Vec<usize>,
    generated: Vec<usize>,
    metrics: GenerationMetrics,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Init {
            preset,
            config,
            seed,
            causal,
            output,
        } => {
            let mut model_config = match config {
                Some(path) => ModelConfig::from_file(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => preset.unwrap_or(PresetArg::Tiny).into(),
            };
            if causal {
                model_config = model_config.with_causal(true);
            }
            let model = Model::init(model_config, &mut Rng::with_seed(seed))?;
            model
                .save(&output)
                .with_context(|| format!("writing checkpoint {}", output.display()))?;
            info!(path = %output.display(), seed, "checkpoint written");
        }
        Command::Inspect { checkpoint } => {
            let model = load_checkpoint(&checkpoint)?;
            let report = InspectReport {
                format_version: FORMAT_VERSION,
                config: model.config(),
                parameters: model.snapshot().parameter_count(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Forward {
            checkpoint,
            tokens,
            top_k,
            kernel,
            pad_id,
        } => {
            let kernel = kernel_by_name(&kernel).ok_or_else(|| {
                anyhow!(
                    "unknown kernel {:?}; expected one of {}",
                    kernel,
                    KERNEL_NAMES.join(", ")
                )
            })?;
            let model = load_checkpoint(&checkpoint)?;
            let sequences: Vec<Vec<usize>> = tokens.into_iter().map(|list| list.0).collect();
            let batch = TokenBatch::from_sequences(&sequences, pad_id)?;

            let options = ForwardOptions::inference()
                .with_kernel(kernel)
                .with_lengths(batch.lengths());
            let logits = model.forward_with(batch.ids(), options)?;

            let reports: Vec<SequenceReport> = batch
                .lengths()
                .iter()
                .enumerate()
                .map(|(row, &len)| SequenceReport {
                    sequence: row,
                    positions: (0..len)
                        .map(|pos| PositionReport {
                            position: pos,
                            top: top_k_logits(logits.slice(ndarray::s![row, pos, ..]), top_k),
                        })
                        .collect(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::Generate {
            checkpoint,
            tokens,
            max_new_tokens,
            temperature,
            seed,
            stop_token,
        } => {
            let model = load_checkpoint(&checkpoint)?;
            let settings = GenerationConfig {
                max_new_tokens,
                temperature,
                stop_token,
            };
            let (generated, metrics) =
                generate(&model, &tokens.0, &settings, &mut Rng::with_seed(seed))?;
            let report = GenerateReport {
                prompt: tokens.0,
                generated,
                metrics,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn load_checkpoint(path: &Path) -> Result<Model> {
    Model::load(path).with_context(|| format!("loading checkpoint {}", path.display()))
}

fn top_k_logits(logits: ArrayView1<'_, f32>, k: usize) -> Vec<Candidate> {
    let mut ranked: Vec<Candidate> = logits
        .iter()
        .enumerate()
        .map(|(token, &logit)| Candidate { token, logit })
        .collect();
    ranked.sort_by(|a, b| b.logit.total_cmp(&a.logit));
    ranked.truncate(k);
    ranked
}
