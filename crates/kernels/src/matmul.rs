//! Matrix multiplication kernels and the linear-layer primitive built on them.

use crate::activation::ActivationKind;
use crate::utils::validate_matmul_inputs;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::sync::Arc;

pub trait MatmulKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, lhs: ArrayView2<'_, f32>, rhs: ArrayView2<'_, f32>) -> Result<Array2<f32>>;
}

pub type DynMatmulKernel = Arc<dyn MatmulKernel>;

/// Single call into ndarray's blocked `dot`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceMatmul;

impl ReferenceMatmul {
    pub fn new() -> Self {
        Self
    }
}

impl MatmulKernel for ReferenceMatmul {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn run(&self, lhs: ArrayView2<'_, f32>, rhs: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        validate_matmul_inputs(&lhs, &rhs)?;
        Ok(lhs.dot(&rhs))
    }
}

/// Splits output rows across the rayon pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelMatmul;

impl ParallelMatmul {
    pub fn new() -> Self {
        Self
    }
}

impl MatmulKernel for ParallelMatmul {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn run(&self, lhs: ArrayView2<'_, f32>, rhs: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        validate_matmul_inputs(&lhs, &rhs)?;

        let mut output = Array2::<f32>::zeros((lhs.nrows(), rhs.ncols()));
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row_idx, mut row)| {
                row.assign(&lhs.row(row_idx).dot(&rhs));
            });
        Ok(output)
    }
}

pub const KERNEL_NAMES: &[&str] = &["reference", "parallel"];

pub fn kernel_by_name(name: &str) -> Option<DynMatmulKernel> {
    match name {
        "reference" => Some(Arc::new(ReferenceMatmul::new())),
        "parallel" => Some(Arc::new(ParallelMatmul::new())),
        _ => None,
    }
}

pub fn default_kernel() -> DynMatmulKernel {
    Arc::new(ReferenceMatmul::new())
}

/// `activation(input @ weight + bias)` with `weight` laid out as `(in, out)`.
pub fn linear(
    kernel: &dyn MatmulKernel,
    input: ArrayView2<'_, f32>,
    weight: ArrayView2<'_, f32>,
    bias: Option<ArrayView1<'_, f32>>,
    activation: ActivationKind,
) -> Result<Array2<f32>> {
    let mut output = kernel.run(input, weight)?;
    if let Some(bias) = bias {
        ensure!(
            bias.len() == output.ncols(),
            "bias length {} incompatible with output width {}",
            bias.len(),
            output.ncols()
        );
        output += &bias;
    }
    activation.apply_inplace(&mut output);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array2};

    #[test]
    fn parallel_matmul_matches_reference() {
        let (m, k, n) = (32, 16, 24);
        let lhs = Array2::from_shape_fn((m, k), |(i, j)| (i + j) as f32 * 0.1);
        let rhs = Array2::from_shape_fn((k, n), |(i, j)| (i * j + 1) as f32 * 0.05);

        let reference = ReferenceMatmul::new()
            .run(lhs.view(), rhs.view())
            .expect("reference matmul");
        let parallel = ParallelMatmul::new()
            .run(lhs.view(), rhs.view())
            .expect("parallel matmul");

        assert_eq!(reference.dim(), (m, n));
        for (a, b) in reference.iter().zip(parallel.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn linear_adds_bias_per_column() {
        let input = Array2::from_shape_vec((2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let weight = Array2::<f32>::eye(2);
        let bias = arr1(&[10.0f32, -10.0]);

        let out = linear(
            &ReferenceMatmul::new(),
            input.view(),
            weight.view(),
            Some(bias.view()),
            ActivationKind::Relu,
        )
        .expect("linear");
        assert_eq!(out.row(0).to_vec(), vec![11.0, 0.0]);
        assert_eq!(out.row(1).to_vec(), vec![13.0, 0.0]);
    }

    #[test]
    fn linear_rejects_wrong_bias() {
        let input = Array2::<f32>::ones((2, 3));
        let weight = Array2::<f32>::ones((3, 4));
        let bias = arr1(&[0.0f32; 3]);
        let result = linear(
            &ParallelMatmul::new(),
            input.view(),
            weight.view(),
            Some(bias.view()),
            ActivationKind::None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn kernels_resolve_by_name() {
        for name in KERNEL_NAMES {
            let kernel = kernel_by_name(name).expect("known kernel");
            assert_eq!(kernel.name(), *name);
        }
        assert!(kernel_by_name("gpu").is_none());
    }
}
