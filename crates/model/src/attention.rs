//! Pre-norm multi-head self-attention sub-block.

use crate::error::Result;
use crate::params::{AttentionParams, LayerNormParams};
use crate::transformer::StepContext;
use fastrand::Rng;
use ndarray::{s, stack, Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;
use themis_kernels::{
    apply_attention, attention_weights, dropout_inplace, layer_norm, linear, ActivationKind,
};

pub struct AttentionOutput {
    /// Residual stream after the sub-block, `(seq_len, d_model)`.
    pub hidden: Array2<f32>,
    /// Per-head weights `(n_heads, seq_len, seq_len)`, when requested.
    pub weights: Option<Array3<f32>>,
}

pub struct SelfAttention<'a> {
    pub norm: &'a LayerNormParams,
    pub params: &'a AttentionParams,
    pub n_heads: usize,
}

impl<'a> SelfAttention<'a> {
    /// `x + dropout(W_o · concat_h(softmax(Q_h K_h^T / sqrt(d_h) + mask) V_h))`
    /// where Q, K, V are projections of `layer_norm(x)`.
    ///
    /// `rng` is `Some` only in training mode. Recorded weights are taken
    /// before attention dropout.
    pub fn forward(
        &self,
        x: ArrayView2<'_, f32>,
        ctx: &StepContext<'_>,
        mut rng: Option<&mut Rng>,
        record_weights: bool,
    ) -> Result<AttentionOutput> {
        let (seq_len, d_model) = x.dim();
        let head_dim = d_model / self.n_heads;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let p = self.params;

        let normed = layer_norm(x, self.norm.gamma.view(), self.norm.beta.view(), ctx.eps)?;
        let project = |w: &Array2<f32>, b: &ndarray::Array1<f32>| {
            linear(ctx.kernel, normed.view(), w.view(), Some(b.view()), ActivationKind::None)
        };
        let q = project(&p.w_q, &p.b_q)?;
        let k = project(&p.w_k, &p.b_k)?;
        let v = project(&p.w_v, &p.b_v)?;

        // One generator per head so parallel heads draw reproducible masks.
        let head_seeds: Option<Vec<u64>> = rng
            .as_deref_mut()
            .map(|rng| (0..self.n_heads).map(|_| rng.u64(..)).collect());

        let heads = (0..self.n_heads)
            .into_par_iter()
            .map(|head| -> anyhow::Result<(Array2<f32>, Option<Array2<f32>>)> {
                let cols = head * head_dim..(head + 1) * head_dim;
                let mut weights = attention_weights(
                    q.slice(s![.., cols.clone()]),
                    k.slice(s![.., cols.clone()]),
                    ctx.mask,
                    scale,
                )?;
                let recorded = record_weights.then(|| weights.clone());
                if let Some(seeds) = &head_seeds {
                    dropout_inplace(&mut weights, ctx.dropout, &mut Rng::with_seed(seeds[head]))?;
                }
                let out = apply_attention(weights.view(), v.slice(s![.., cols]))?;
                Ok((out, recorded))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut concat = Array2::<f32>::zeros((seq_len, d_model));
        for (head, (out, _)) in heads.iter().enumerate() {
            concat
                .slice_mut(s![.., head * head_dim..(head + 1) * head_dim])
                .assign(out);
        }

        let mut projected = linear(
            ctx.kernel,
            concat.view(),
            p.w_o.view(),
            Some(p.b_o.view()),
            ActivationKind::None,
        )?;
        if let Some(rng) = rng {
            dropout_inplace(&mut projected, ctx.dropout, rng)?;
        }

        let weights = if record_weights {
            let views: Vec<ArrayView2<'_, f32>> = heads
                .iter()
                .filter_map(|(_, w)| w.as_ref().map(|w| w.view()))
                .collect();
            Some(stack(Axis(0), &views).map_err(anyhow::Error::from)?)
        } else {
            None
        };

        Ok(AttentionOutput {
            hidden: &x + &projected,
            weights,
        })
    }
}
