use rand::Rng;
use rayon::prelude::*;

use crate::{
    config::{ModelConfig, PositionEncoding},
    kv_cache::KvCache,
    operator,
    params::{Gradients, ParamId, Parameters},
    tensor::Tensor,
};

/// Causal multi-head self-attention with optional grouped key/value heads.
///
/// Both the full-sequence path and incremental decoding go through
/// [`Attention::forward`]: new keys and values are first written into the
/// cache, then every query attends over the cache rows up to its own position.
/// The two paths therefore share masking and position handling exactly.
#[derive(Debug, Clone)]
pub struct Attention {
    wq: ParamId,
    wk: ParamId,
    wv: ParamId,
    wo: ParamId,
    layer: usize,
    dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    rotary: bool,
}

#[derive(Debug, Clone)]
pub struct AttentionTrace {
    start: usize,
    /// (t, dim), rotated when rotary encoding is on
    q: Vec<f32>,
    /// (t, n_heads, start + t) softmax weights
    att: Vec<f32>,
    /// (t, dim) concatenated head outputs, input of `wo`
    y: Vec<f32>,
}

impl Attention {
    pub fn new<R: Rng>(
        params: &mut Parameters,
        prefix: &str,
        layer: usize,
        conf: &ModelConfig,
        std: f32,
        out_std: f32,
        rng: &mut R,
    ) -> Self {
        let (dim, kv_dim) = (conf.dim, conf.kv_dim());
        Self {
            wq: params.register(format!("{prefix}.wq"), Tensor::randn(&[dim, dim], std, rng)),
            wk: params.register(format!("{prefix}.wk"), Tensor::randn(&[kv_dim, dim], std, rng)),
            wv: params.register(format!("{prefix}.wv"), Tensor::randn(&[kv_dim, dim], std, rng)),
            wo: params.register(format!("{prefix}.wo"), Tensor::randn(&[dim, dim], out_std, rng)),
            layer,
            dim,
            n_heads: conf.n_heads,
            n_kv_heads: conf.n_kv_heads,
            head_dim: conf.head_dim(),
            rotary: conf.position == PositionEncoding::Rotary,
        }
    }

    fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Query heads sharing one key/value head.
    fn group(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }

    /// Attends the `t` rows of `x` (positions `cache.len()..cache.len() + t`).
    /// Writes their keys/values into `cache` for this layer; the caller
    /// advances the cache once every layer has run.
    pub fn forward(
        &self,
        params: &Parameters,
        x: &[f32],
        cache: &mut KvCache,
    ) -> (Vec<f32>, AttentionTrace) {
        let (dim, kv_dim, head_dim) = (self.dim, self.kv_dim(), self.head_dim);
        let t = x.len() / dim;
        let start = cache.len();
        let ctx = start + t;

        let mut q = vec![0.0; t * dim];
        let mut k = vec![0.0; t * kv_dim];
        let mut v = vec![0.0; t * kv_dim];
        operator::linear(&mut q, x, &params[self.wq], None, dim, dim);
        operator::linear(&mut k, x, &params[self.wk], None, dim, kv_dim);
        operator::linear(&mut v, x, &params[self.wv], None, dim, kv_dim);

        for (i, (k, v)) in k.chunks_exact_mut(kv_dim).zip(v.chunks_exact(kv_dim)).enumerate() {
            if self.rotary {
                operator::rope(&mut q[i * dim..(i + 1) * dim], head_dim, start + i);
                operator::rope(k, head_dim, start + i);
            }
            cache.write(self.layer, start + i, k, v);
        }

        let keys = cache.keys(self.layer, ctx);
        let values = cache.values(self.layer, ctx);
        let (group, scale) = (self.group(), self.scale());

        let mut att = vec![0.0; t * self.n_heads * ctx];
        let mut y = vec![0.0; t * dim];
        y.par_chunks_exact_mut(dim)
            .zip(att.par_chunks_exact_mut(self.n_heads * ctx))
            .zip(q.par_chunks_exact(dim))
            .enumerate()
            .for_each(|(i, ((y, att), q))| {
                let pos = start + i;
                for (h, (att, (y, q))) in att
                    .chunks_exact_mut(ctx)
                    .zip(y.chunks_exact_mut(head_dim).zip(q.chunks_exact(head_dim)))
                    .enumerate()
                {
                    let kv_off = (h / group) * head_dim;
                    for (j, a) in att.iter_mut().enumerate() {
                        *a = if j > pos {
                            f32::NEG_INFINITY
                        } else {
                            let key = &keys[j * kv_dim + kv_off..j * kv_dim + kv_off + head_dim];
                            (operator::dot(q, key) * scale) as f32
                        };
                    }
                    operator::softmax(att);
                    for (j, &a) in att.iter().enumerate().take(pos + 1) {
                        let value = &values[j * kv_dim + kv_off..j * kv_dim + kv_off + head_dim];
                        operator::axpy(y, a, value);
                    }
                }
            });

        let mut out = vec![0.0; t * dim];
        operator::linear(&mut out, &y, &params[self.wo], None, dim, dim);
        (out, AttentionTrace { start, q, att, y })
    }

    /// Gradient of the block input. Keys and values are read back from the
    /// cache filled by the matching forward pass, which must have started at
    /// position 0.
    pub fn backward(
        &self,
        params: &Parameters,
        grads: &mut Gradients,
        x: &[f32],
        cache: &KvCache,
        trace: &AttentionTrace,
        dout: &[f32],
    ) -> Vec<f32> {
        debug_assert_eq!(trace.start, 0);
        let (dim, kv_dim, head_dim) = (self.dim, self.kv_dim(), self.head_dim);
        let t = x.len() / dim;
        let ctx = trace.start + t;
        let keys = cache.keys(self.layer, ctx);
        let values = cache.values(self.layer, ctx);
        let (group, scale) = (self.group(), self.scale() as f32);

        let mut dy = vec![0.0; t * dim];
        operator::linear_backward(
            &mut dy,
            &mut grads[self.wo],
            None,
            dout,
            &trace.y,
            &params[self.wo],
            dim,
            dim,
        );

        let mut dq = vec![0.0; t * dim];
        let mut dk = vec![0.0; ctx * kv_dim];
        let mut dv = vec![0.0; ctx * kv_dim];
        let mut da = vec![0.0; ctx];
        for i in 0..t {
            let pos = trace.start + i;
            for h in 0..self.n_heads {
                let att = &trace.att[(i * self.n_heads + h) * ctx..][..ctx];
                let dy_h = &dy[i * dim + h * head_dim..][..head_dim];
                let q_h = &trace.q[i * dim + h * head_dim..][..head_dim];
                let kv_off = (h / group) * head_dim;

                for j in 0..=pos {
                    let row = j * kv_dim + kv_off;
                    da[j] = operator::dot(dy_h, &values[row..row + head_dim]) as f32;
                    operator::axpy(&mut dv[row..row + head_dim], att[j], dy_h);
                }
                let weighted = att[..=pos]
                    .iter()
                    .zip(&da[..=pos])
                    .fold(0f64, |acc, (&a, &d)| acc + (a * d) as f64) as f32;

                let dq_h = &mut dq[i * dim + h * head_dim..][..head_dim];
                for j in 0..=pos {
                    let ds = att[j] * (da[j] - weighted) * scale;
                    let row = j * kv_dim + kv_off;
                    operator::axpy(dq_h, ds, &keys[row..row + head_dim]);
                    operator::axpy(&mut dk[row..row + head_dim], ds, q_h);
                }
            }
        }

        if self.rotary {
            for (i, dq) in dq.chunks_exact_mut(dim).enumerate() {
                operator::rope_backward(dq, head_dim, trace.start + i);
            }
            for (j, dk) in dk.chunks_exact_mut(kv_dim).enumerate() {
                operator::rope_backward(dk, head_dim, j);
            }
        }

        let mut dx = vec![0.0; t * dim];
        let mut dx_part = vec![0.0; t * dim];
        let projections = [
            (self.wq, &dq, dim),
            (self.wk, &dk, kv_dim),
            (self.wv, &dv, kv_dim),
        ];
        for (w, dproj, out_dim) in projections {
            operator::linear_backward(
                &mut dx_part,
                &mut grads[w],
                None,
                dproj,
                x,
                &params[w],
                dim,
                out_dim,
            );
            operator::add_inplace(&mut dx, &dx_part);
        }
        dx
    }
}
