//! Row-wise layer normalization over the feature axis.

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, Zip};
use rayon::prelude::*;

fn check_affine(name: &str, param: Option<&ArrayView1<'_, f32>>, width: usize) -> Result<()> {
    if let Some(param) = param {
        ensure!(
            param.len() == width,
            "{} has {} entries but rows have {} features",
            name,
            param.len(),
            width
        );
    }
    Ok(())
}

/// `(x - mean) / sqrt(var + eps)` with the biased variance, written back into
/// `row`.
fn normalize_row(mut row: ArrayViewMut1<'_, f32>, eps: f32) {
    let n = row.len() as f32;
    let mean = row.sum() / n;
    row.mapv_inplace(|x| x - mean);
    let var = row.fold(0.0, |acc, &x| acc + x * x) / n;
    row *= (var + eps).sqrt().recip();
}

/// Normalize each row of `data` in place, then apply the optional per-feature
/// scale `gamma` and shift `beta`.
pub fn layer_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    gamma: Option<ArrayView1<'_, f32>>,
    beta: Option<ArrayView1<'_, f32>>,
    eps: f32,
) -> Result<()> {
    let width = data.ncols();
    ensure!(width > 0, "cannot normalize rows with no features");
    ensure!(
        eps.is_finite() && eps >= 0.0,
        "epsilon must be finite and non-negative, got {}",
        eps
    );
    check_affine("gamma", gamma.as_ref(), width)?;
    check_affine("beta", beta.as_ref(), width)?;

    data.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        normalize_row(row.view_mut(), eps);
        if let Some(gamma) = &gamma {
            row *= gamma;
        }
        if let Some(beta) = &beta {
            row += beta;
        }
    });
    Ok(())
}

/// Owned variant with mandatory affine parameters, as used by every norm in
/// the transformer.
pub fn layer_norm(
    data: ArrayView2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    eps: f32,
) -> Result<Array2<f32>> {
    let mut normed = data.to_owned();
    layer_norm_inplace(normed.view_mut(), Some(gamma), Some(beta), eps)?;
    Ok(normed)
}

/// Per-row `(mean, biased variance)` in f64, for checking normalized output.
pub fn row_moments(data: ArrayView2<'_, f32>) -> Vec<(f64, f64)> {
    data.rows()
        .into_iter()
        .map(|row| {
            let n = row.len() as f64;
            let mean = row.iter().map(|&x| f64::from(x)).sum::<f64>() / n;
            let mut var = 0.0;
            Zip::from(&row).for_each(|&x| var += (f64::from(x) - mean).powi(2));
            (mean, var / n)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn rows_come_out_standardized() {
        let mut data =
            Array2::from_shape_fn((4, 64), |(i, j)| ((i + 1) * (j % 13)) as f32 * 1.75 - 9.0);
        layer_norm_inplace(data.view_mut(), None, None, 1e-5).expect("layer norm");

        for (mean, var) in row_moments(data.view()) {
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn affine_parameters_scale_and_shift() {
        let data = Array2::from_shape_fn((3, 8), |(i, j)| (i * 8 + j) as f32);
        let gamma = Array1::from_elem(8, 2.0f32);
        let beta = Array1::from_elem(8, 0.5f32);

        let out = layer_norm(data.view(), gamma.view(), beta.view(), 1e-5).expect("layer norm");
        for (mean, var) in row_moments(out.view()) {
            assert_abs_diff_eq!(mean, 0.5, epsilon = 1e-5);
            assert_abs_diff_eq!(var, 4.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn constant_rows_normalize_to_zero() {
        let data = Array2::from_elem((2, 5), 3.0f32);
        let out = layer_norm(
            data.view(),
            Array1::ones(5).view(),
            Array1::zeros(5).view(),
            1e-5,
        )
        .expect("layer norm");
        assert!(out.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn rejects_mismatched_gamma() {
        let data = Array2::<f32>::ones((2, 4));
        let gamma = Array1::<f32>::ones(3);
        let beta = Array1::<f32>::zeros(4);
        assert!(layer_norm(data.view(), gamma.view(), beta.view(), 1e-5).is_err());
    }
}
