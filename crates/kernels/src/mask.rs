//! Additive attention masks.
//!
//! Masks are `(target, source)` matrices added to the attention scores before
//! softmax: `0.0` keeps a pair, `-inf` forbids it.

use anyhow::{ensure, Result};
use ndarray::Array2;

/// Lower-triangular mask: target `i` may only see sources `j <= i`.
pub fn causal_mask(seq_len: usize) -> Array2<f32> {
    Array2::from_shape_fn((seq_len, seq_len), |(i, j)| {
        if j > i {
            f32::NEG_INFINITY
        } else {
            0.0
        }
    })
}

/// Hide source positions at or beyond `valid_len` from every target.
pub fn key_padding_mask(seq_len: usize, valid_len: usize) -> Array2<f32> {
    Array2::from_shape_fn((seq_len, seq_len), |(_, j)| {
        if j >= valid_len {
            f32::NEG_INFINITY
        } else {
            0.0
        }
    })
}

/// Combine causal and padding constraints for one sequence.
///
/// Returns `None` when nothing needs masking, so callers can skip the add.
pub fn attention_mask(
    seq_len: usize,
    causal: bool,
    valid_len: Option<usize>,
) -> Result<Option<Array2<f32>>> {
    let padded = match valid_len {
        Some(len) => {
            ensure!(
                len > 0 && len <= seq_len,
                "valid length {} outside 1..={}",
                len,
                seq_len
            );
            len < seq_len
        }
        None => false,
    };

    let mask = match (causal, padded) {
        (false, false) => None,
        (true, false) => Some(causal_mask(seq_len)),
        (false, true) => valid_len.map(|len| key_padding_mask(seq_len, len)),
        (true, true) => valid_len.map(|len| causal_mask(seq_len) + key_padding_mask(seq_len, len)),
    };
    Ok(mask)
}
