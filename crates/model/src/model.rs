//! Model handle: immutable config plus a swappable parameter snapshot.

use crate::batch::TokenBatch;
use crate::checkpoint;
use crate::config::ModelConfig;
use crate::error::Result;
use crate::params::Parameters;
use crate::transformer::{self, ForwardOptions};
use fastrand::Rng;
use ndarray::{Array3, Array4, ArrayView2};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use themis_kernels::MatmulKernel;
use tracing::{debug, info};

/// A transformer whose parameters may be replaced while forward calls run.
///
/// Every forward call clones the current `Arc<Parameters>` once and uses it
/// throughout, so a concurrent replacement is either fully visible or not at
/// all. Replacements are validated before they are published.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    params: RwLock<Arc<Parameters>>,
    version: AtomicU64,
}

impl Model {
    pub fn new(config: ModelConfig, params: Parameters) -> Result<Self> {
        config.validate()?;
        params.validate(&config)?;
        info!(
            parameters = params.parameter_count(),
            layers = config.n_layers,
            heads = config.n_heads,
            d_model = config.d_model,
            causal = config.causal,
            "model constructed"
        );
        Ok(Self {
            config,
            params: RwLock::new(Arc::new(params)),
            version: AtomicU64::new(0),
        })
    }

    /// Randomly initialised model.
    pub fn init(config: ModelConfig, rng: &mut Rng) -> Result<Self> {
        let params = Parameters::init(&config, rng)?;
        Self::new(config, params)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let (config, params) = checkpoint::load(path)?;
        Self::new(config, params)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::save(path, &self.config, &self.snapshot())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The parameter set current at the time of the call.
    pub fn snapshot(&self) -> Arc<Parameters> {
        Arc::clone(&self.params.read())
    }

    /// Number of successful parameter replacements so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Publish a new parameter set. On error the current set stays in place.
    pub fn replace_parameters(&self, params: Parameters) -> Result<()> {
        params.validate(&self.config)?;
        let mut guard = self.params.write();
        *guard = Arc::new(params);
        self.publish()
    }

    /// Copy-on-write update: `update` edits a private copy of the current
    /// parameters, which is validated and then published atomically.
    pub fn update_parameters<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut Parameters),
    {
        let mut guard = self.params.write();
        let mut next = Parameters::clone(&guard);
        update(&mut next);
        next.validate(&self.config)?;
        *guard = Arc::new(next);
        self.publish()
    }

    fn publish(&self) -> Result<()> {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(version, "parameters replaced");
        Ok(())
    }

    /// Inference-mode logits `(batch, seq_len, vocab_size)`.
    pub fn forward(&self, ids: ArrayView2<'_, usize>) -> Result<Array3<f32>> {
        self.forward_with(ids, ForwardOptions::inference())
    }

    pub fn forward_with(
        &self,
        ids: ArrayView2<'_, usize>,
        options: ForwardOptions<'_>,
    ) -> Result<Array3<f32>> {
        let params = self.snapshot();
        debug!(
            batch = ids.nrows(),
            seq_len = ids.ncols(),
            kernel = options.kernel.name(),
            "forward"
        );
        transformer::forward(&self.config, &params, ids, options)
    }

    /// Forward over a padded batch; padding keys are masked in attention.
    pub fn forward_batch(&self, batch: &TokenBatch) -> Result<Array3<f32>> {
        self.forward_with(
            batch.ids(),
            ForwardOptions::inference().with_lengths(batch.lengths()),
        )
    }

    /// Inference-mode attention weights, one `(batch, heads, seq, seq)` array
    /// per layer.
    pub fn attention_maps(&self, ids: ArrayView2<'_, usize>) -> Result<Vec<Array4<f32>>> {
        let params = self.snapshot();
        let output =
            transformer::run(&self.config, &params, ids, ForwardOptions::inference(), true)?;
        Ok(output.attention)
    }
}
