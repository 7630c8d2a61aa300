//! Pre-norm position-wise feed-forward sub-block.

use crate::error::Result;
use crate::params::{FeedForwardParams, LayerNormParams};
use crate::transformer::StepContext;
use fastrand::Rng;
use ndarray::{Array2, ArrayView2};
use themis_kernels::{dropout_inplace, layer_norm, linear, ActivationKind};

pub struct FeedForward<'a> {
    pub norm: &'a LayerNormParams,
    pub params: &'a FeedForwardParams,
}

impl<'a> FeedForward<'a> {
    /// `x + dropout(W_down · gelu(W_up · layer_norm(x) + b_up) + b_down)`.
    pub fn forward(
        &self,
        x: ArrayView2<'_, f32>,
        ctx: &StepContext<'_>,
        rng: Option<&mut Rng>,
    ) -> Result<Array2<f32>> {
        let p = self.params;
        let normed = layer_norm(x, self.norm.gamma.view(), self.norm.beta.view(), ctx.eps)?;
        let hidden = linear(
            ctx.kernel,
            normed.view(),
            p.w_up.view(),
            Some(p.b_up.view()),
            ActivationKind::Gelu,
        )?;
        let mut out = linear(
            ctx.kernel,
            hidden.view(),
            p.w_down.view(),
            Some(p.b_down.view()),
            ActivationKind::None,
        )?;
        if let Some(rng) = rng {
            dropout_inplace(&mut out, ctx.dropout, rng)?;
        }
        Ok(&x + &out)
    }
}
