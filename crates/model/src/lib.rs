//! Decoder-only transformer forward pass.
//!
//! This crate implements:
//! - token and learned positional embeddings
//! - pre-norm multi-head self-attention with optional causal masking
//! - GELU feed-forward sub-blocks and an untied LM head
//! - versioned safetensors checkpoints
//! - a model handle whose parameters can be swapped under concurrent reads
//!
//! The forward pass is a pure function of configuration, parameters and
//! token ids; see [`transformer::forward`].

pub mod attention;
pub mod batch;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod error;
pub mod feed_forward;
pub mod generate;
pub mod model;
pub mod params;
pub mod transformer;

pub use batch::TokenBatch;
pub use cancel::CancellationToken;
pub use config::ModelConfig;
pub use error::{ModelError, Result};
pub use generate::{generate, GenerationConfig, GenerationMetrics};
pub use model::Model;
pub use params::Parameters;
pub use transformer::{ForwardOptions, ForwardOutput, Mode};
