//! Pointwise activation functions.

use ndarray::{ArrayBase, DataMut, Dimension};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;

/// Pointwise function applied after a linear layer. `Relu` is kept alongside
/// the transformer's `Gelu` for general-purpose `linear` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    #[default]
    None,
    Relu,
    Gelu,
}

impl ActivationKind {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationKind::None => x,
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::Gelu => gelu(x),
        }
    }

    pub fn apply_inplace<S, D>(self, data: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        if self == ActivationKind::None {
            return;
        }
        data.par_map_inplace(|x| *x = self.apply(*x));
    }
}

/// GELU using the tanh approximation (within 1e-3 of the erf form).
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn gelu_matches_reference_points() {
        assert_abs_diff_eq!(gelu(0.0), 0.0, epsilon = 1e-7);
        // erf-based GELU reference values
        assert_abs_diff_eq!(gelu(1.0), 0.841_344_7, epsilon = 1e-3);
        assert_abs_diff_eq!(gelu(-1.0), -0.158_655_3, epsilon = 1e-3);
        assert_abs_diff_eq!(gelu(6.0), 6.0, epsilon = 1e-4);
        assert_abs_diff_eq!(gelu(-6.0), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn apply_inplace_respects_kind() {
        let mut data = Array2::from_shape_vec((1, 3), vec![-2.0f32, 0.5, 3.0]).unwrap();
        ActivationKind::None.apply_inplace(&mut data);
        assert_eq!(data[(0, 0)], -2.0);

        ActivationKind::Relu.apply_inplace(&mut data);
        assert_eq!(data.row(0).to_vec(), vec![0.0, 0.5, 3.0]);
    }
}
