//! Shared helpers for kernel implementations.

use anyhow::{bail, Result};
use ndarray::{Array1, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rayon::prelude::*;

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

/// Row-wise softmax over the last axis.
///
/// Entries equal to `-inf` are treated as masked and come out as exactly zero.
/// A row where every entry is masked becomes all zeros rather than NaN.
pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(softmax_row);
}

/// Softmax of a single vector, returned as a new array.
pub fn softmax(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    let mut probs = logits.to_owned();
    softmax_row(probs.view_mut());
    probs
}

fn softmax_row(mut row: ArrayViewMut1<'_, f32>) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        row.fill(0.0);
        return;
    }
    row.mapv_inplace(|x| (x - max).exp());
    let sum = row.sum();
    row /= sum.max(f32::EPSILON);
}
