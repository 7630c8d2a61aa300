//! Attention mechanism kernels.

use crate::utils::softmax_inplace;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2};

/// Softmax-normalized attention weights `softmax(scale * Q K^T + mask)`.
///
/// `query` is `(targets, dim)`, `key` is `(sources, dim)`; the result is
/// `(targets, sources)` with every unmasked row summing to one.
pub fn attention_weights(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
    scale: f32,
) -> Result<Array2<f32>> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    let mut scores = query.dot(&key.t());
    scores *= scale;

    if let Some(mask) = mask {
        ensure!(
            mask.dim() == scores.dim(),
            "mask shape {:?} incompatible with attention scores {:?}",
            mask.dim(),
            scores.dim()
        );
        scores += &mask;
    }

    softmax_inplace(scores.view_mut());
    Ok(scores)
}

/// Weighted sum of value rows.
pub fn apply_attention(
    weights: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
) -> Result<Array2<f32>> {
    ensure!(
        weights.ncols() == value.nrows(),
        "weights column count {} differs from value rows {}",
        weights.ncols(),
        value.nrows()
    );
    Ok(weights.dot(&value))
}

pub fn scaled_dot_product_attention(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
    scale: f32,
) -> Result<Array2<f32>> {
    let weights = attention_weights(query, key, mask, scale)?;
    apply_attention(weights.view(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::causal_mask;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Axis};

    fn sample(rows: usize, cols: usize, salt: f32) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(i, j)| ((i * cols + j) as f32 * salt).sin())
    }

    #[test]
    fn weights_are_row_distributions() {
        let q = sample(5, 4, 0.37);
        let k = sample(5, 4, 0.91);
        let weights = attention_weights(q.view(), k.view(), None, 0.5).expect("weights");
        assert_eq!(weights.dim(), (5, 5));
        for row in weights.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn causal_weights_ignore_future_sources() {
        let q = sample(4, 2, 0.21);
        let k = sample(4, 2, 0.63);
        let mask = causal_mask(4);
        let weights =
            attention_weights(q.view(), k.view(), Some(mask.view()), 1.0).expect("weights");
        for i in 0..4 {
            for j in (i + 1)..4 {
                assert_eq!(weights[(i, j)], 0.0);
            }
        }
        assert_abs_diff_eq!(weights[(0, 0)], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn uniform_scores_average_values() {
        let q = Array2::<f32>::zeros((2, 3));
        let k = Array2::<f32>::zeros((4, 3));
        let v = Array2::from_shape_fn((4, 2), |(i, _)| i as f32);
        let out = scaled_dot_product_attention(q.view(), k.view(), v.view(), None, 1.0)
            .expect("attention");
        for value in out.iter() {
            assert_abs_diff_eq!(*value, 1.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn rejects_mismatched_mask() {
        let q = sample(3, 2, 0.1);
        let k = sample(3, 2, 0.2);
        let mask = causal_mask(2);
        assert!(attention_weights(q.view(), k.view(), Some(mask.view()), 1.0).is_err());
    }
}
