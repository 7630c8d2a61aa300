//! Token and positional embeddings.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::params::Parameters;
use ndarray::{s, Array3, ArrayView2, Axis};
use rayon::prelude::*;

/// Reject batches the model cannot embed. Runs before any numeric work.
pub fn validate_tokens(config: &ModelConfig, ids: ArrayView2<'_, usize>) -> Result<()> {
    let (batch, seq_len) = ids.dim();
    if batch == 0 || seq_len == 0 {
        return Err(ModelError::OutOfRange(format!(
            "empty batch of shape ({}, {})",
            batch, seq_len
        )));
    }
    if seq_len > config.max_seq_len {
        return Err(ModelError::OutOfRange(format!(
            "sequence length {} exceeds max_seq_len {}",
            seq_len, config.max_seq_len
        )));
    }
    if let Some(((row, pos), &id)) = ids
        .indexed_iter()
        .find(|(_, id)| **id >= config.vocab_size)
    {
        return Err(ModelError::OutOfRange(format!(
            "token id {} at ({}, {}) outside vocabulary of size {}",
            id, row, pos, config.vocab_size
        )));
    }
    Ok(())
}

/// `(batch, seq_len)` ids to `(batch, seq_len, d_model)` vectors:
/// `token_embedding[id] + position_embedding[t]`.
pub fn embed(
    config: &ModelConfig,
    params: &Parameters,
    ids: ArrayView2<'_, usize>,
) -> Result<Array3<f32>> {
    validate_tokens(config, ids)?;
    let (batch, seq_len) = ids.dim();
    let positions = params.position_embedding.slice(s![..seq_len, ..]);

    let mut hidden = Array3::<f32>::zeros((batch, seq_len, config.d_model));
    hidden
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(ids.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut sequence, row)| {
            for (pos, &token_id) in row.iter().enumerate() {
                let mut slot = sequence.row_mut(pos);
                slot.assign(&params.token_embedding.row(token_id));
                slot += &positions.row(pos);
            }
        });
    Ok(hidden)
}
