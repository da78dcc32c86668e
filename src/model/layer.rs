use rand::Rng;

use crate::{
    config::ModelConfig,
    kv_cache::KvCache,
    operator,
    params::{Gradients, Parameters},
};

use super::{
    attention::{Attention, AttentionTrace},
    feed_forward::{FeedForward, FeedForwardTrace},
    norm::{LayerNorm, NormTrace},
};

/// Pre-norm transformer block:
/// `h = x + attn(norm1(x))`, `out = h + ffn(norm2(h))`.
#[derive(Debug, Clone)]
pub struct Layer {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    ffn: FeedForward,
}

/// Activations of one layer retained for backward.
#[derive(Debug, Clone)]
pub struct LayerTrace {
    x: Vec<f32>,
    norm1: NormTrace,
    x_norm1: Vec<f32>,
    attn: AttentionTrace,
    h: Vec<f32>,
    norm2: NormTrace,
    h_norm2: Vec<f32>,
    ffn: FeedForwardTrace,
}

impl Layer {
    pub fn new<R: Rng>(
        params: &mut Parameters,
        index: usize,
        conf: &ModelConfig,
        rng: &mut R,
    ) -> Self {
        const STD: f32 = 0.02;
        let out_std = STD / (2.0 * conf.n_layers as f32).sqrt();
        let prefix = format!("layers.{index}");
        Self {
            norm1: LayerNorm::new(params, &format!("{prefix}.norm1"), conf.dim, conf.norm_eps),
            attn: Attention::new(params, &format!("{prefix}.attn"), index, conf, STD, out_std, rng),
            norm2: LayerNorm::new(params, &format!("{prefix}.norm2"), conf.dim, conf.norm_eps),
            ffn: FeedForward::new(
                params,
                &format!("{prefix}.ffn"),
                conf.dim,
                conf.hidden_dim,
                STD,
                out_std,
                rng,
            ),
        }
    }

    pub fn forward(
        &self,
        params: &Parameters,
        x: Vec<f32>,
        cache: &mut KvCache,
    ) -> (Vec<f32>, LayerTrace) {
        let (x_norm1, norm1) = self.norm1.forward(params, &x);
        let (attn_out, attn) = self.attn.forward(params, &x_norm1, cache);
        let mut h = attn_out;
        operator::add_inplace(&mut h, &x);

        let (h_norm2, norm2) = self.norm2.forward(params, &h);
        let (mut out, ffn) = self.ffn.forward(params, &h_norm2);
        operator::add_inplace(&mut out, &h);

        let trace = LayerTrace {
            x,
            norm1,
            x_norm1,
            attn,
            h,
            norm2,
            h_norm2,
            ffn,
        };
        (out, trace)
    }

    pub fn backward(
        &self,
        params: &Parameters,
        grads: &mut Gradients,
        cache: &KvCache,
        trace: &LayerTrace,
        dout: &[f32],
    ) -> Vec<f32> {
        // residual: dh = dout + d(ffn branch)
        let dffn = self.ffn.backward(params, grads, &trace.h_norm2, &trace.ffn, dout);
        let mut dh = self.norm2.backward(params, grads, &trace.h, &trace.norm2, &dffn);
        operator::add_inplace(&mut dh, dout);

        let dattn = self
            .attn
            .backward(params, grads, &trace.x_norm1, cache, &trace.attn, &dh);
        let mut dx = self.norm1.backward(params, grads, &trace.x, &trace.norm1, &dattn);
        operator::add_inplace(&mut dx, &dh);
        dx
    }
}
