//! Numeric kernels over row-major slices.
//!
//! Forward kernels overwrite their `out` buffer. Backward kernels overwrite the
//! input gradient and *accumulate* into parameter gradients, so a tensor used in
//! two roles (tied embeddings) collects both contributions.

use rayon::prelude::*;

use crate::tensor::Float;

const ROPE_THETA: Float = 10000.0;
const GELU_K: Float = 0.797_884_6; // sqrt(2 / pi)
const GELU_C: Float = 0.044_715;

/// Dot product accumulated in f64.
pub fn dot(a: &[Float], b: &[Float]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .fold(0f64, |acc, (&a, &b)| acc + a as f64 * b as f64)
}

/// W(d, n) * x(n,) -> out(d,)
pub fn matmul(out: &mut [Float], w: &[Float], x: &[Float], n: usize, d: usize) {
    debug_assert_eq!(w.len(), d * n);
    debug_assert_eq!(out.len(), d);
    debug_assert_eq!(x.len(), n);

    for (row, o) in w.chunks_exact(n).zip(out.iter_mut()) {
        *o = row
            .iter()
            .zip(x.iter())
            .fold(0 as Float, |acc, (&w, &x)| acc + w * x);
    }
}

/// x(t, n) * W(d, n)^T + b(d,) -> out(t, d), rows in parallel
pub fn linear(
    out: &mut [Float],
    x: &[Float],
    w: &[Float],
    b: Option<&[Float]>,
    n: usize,
    d: usize,
) {
    debug_assert_eq!(x.len() / n, out.len() / d);

    out.par_chunks_exact_mut(d)
        .zip(x.par_chunks_exact(n))
        .for_each(|(o, x)| {
            matmul(o, w, x, n, d);
            if let Some(b) = b {
                add_inplace(o, b);
            }
        });
}

/// Backward of [`linear`]: `dx = dout * W`, `dw += dout^T * x`, `db += sum_t dout`.
#[allow(clippy::too_many_arguments)]
pub fn linear_backward(
    dx: &mut [Float],
    dw: &mut [Float],
    db: Option<&mut [Float]>,
    dout: &[Float],
    x: &[Float],
    w: &[Float],
    n: usize,
    d: usize,
) {
    debug_assert_eq!(dw.len(), d * n);
    debug_assert_eq!(dx.len(), x.len());
    debug_assert_eq!(dout.len() / d, x.len() / n);

    dx.par_chunks_exact_mut(n)
        .zip(dout.par_chunks_exact(d))
        .for_each(|(dx, dout)| {
            dx.fill(0.0);
            for (&g, w_row) in dout.iter().zip(w.chunks_exact(n)) {
                axpy(dx, g, w_row);
            }
        });

    dw.par_chunks_exact_mut(n)
        .enumerate()
        .for_each(|(i, dw_row)| {
            for (dout, x) in dout.chunks_exact(d).zip(x.chunks_exact(n)) {
                axpy(dw_row, dout[i], x);
            }
        });

    if let Some(db) = db {
        for dout in dout.chunks_exact(d) {
            add_inplace(db, dout);
        }
    }
}

/// Layer normalisation of each `dim`-wide row, recording mean and 1/std for backward.
#[allow(clippy::too_many_arguments)]
pub fn layer_norm(
    out: &mut [Float],
    mean: &mut [Float],
    rstd: &mut [Float],
    x: &[Float],
    gamma: &[Float],
    beta: &[Float],
    dim: usize,
    eps: Float,
) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(gamma.len(), dim);
    debug_assert_eq!(mean.len(), x.len() / dim);

    for (((o, x), m), r) in out
        .chunks_exact_mut(dim)
        .zip(x.chunks_exact(dim))
        .zip(mean.iter_mut())
        .zip(rstd.iter_mut())
    {
        let mu = x.iter().map(|&v| v as f64).sum::<f64>() / dim as f64;
        let var = x
            .iter()
            .map(|&v| (v as f64 - mu).powi(2))
            .sum::<f64>()
            / dim as f64;
        let s = 1.0 / (var + eps as f64).sqrt();
        *m = mu as Float;
        *r = s as Float;
        for (((o, &x), &g), &b) in o.iter_mut().zip(x).zip(gamma).zip(beta) {
            *o = ((x as f64 - mu) * s) as Float * g + b;
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn layer_norm_backward(
    dx: &mut [Float],
    dgamma: &mut [Float],
    dbeta: &mut [Float],
    dout: &[Float],
    x: &[Float],
    mean: &[Float],
    rstd: &[Float],
    gamma: &[Float],
    dim: usize,
) {
    debug_assert_eq!(dx.len(), x.len());
    debug_assert_eq!(dout.len(), x.len());

    for ((((dx, dout), x), &m), &r) in dx
        .chunks_exact_mut(dim)
        .zip(dout.chunks_exact(dim))
        .zip(x.chunks_exact(dim))
        .zip(mean)
        .zip(rstd)
    {
        let mut dxhat_mean = 0f64;
        let mut dxhat_xhat_mean = 0f64;
        for i in 0..dim {
            let xhat = (x[i] - m) * r;
            let dxhat = dout[i] * gamma[i];
            dgamma[i] += dout[i] * xhat;
            dbeta[i] += dout[i];
            dxhat_mean += dxhat as f64;
            dxhat_xhat_mean += (dxhat * xhat) as f64;
        }
        let dxhat_mean = (dxhat_mean / dim as f64) as Float;
        let dxhat_xhat_mean = (dxhat_xhat_mean / dim as f64) as Float;
        for i in 0..dim {
            let xhat = (x[i] - m) * r;
            let dxhat = dout[i] * gamma[i];
            dx[i] = r * (dxhat - dxhat_mean - xhat * dxhat_xhat_mean);
        }
    }
}

/// gelu(x) = 0.5 x (1 + tanh(sqrt(2/pi) (x + 0.044715 x^3)))
pub fn gelu(x: &mut [Float]) {
    x.iter_mut().for_each(|v| {
        let u = GELU_K * (*v + GELU_C * *v * *v * *v);
        *v = 0.5 * *v * (1.0 + u.tanh());
    });
}

/// `dx = dout * gelu'(x)` where `x` is the pre-activation input.
pub fn gelu_backward(dx: &mut [Float], dout: &[Float], x: &[Float]) {
    debug_assert_eq!(dx.len(), x.len());
    for ((dx, &g), &x) in dx.iter_mut().zip(dout).zip(x) {
        let u = GELU_K * (x + GELU_C * x * x * x);
        let t = u.tanh();
        let du = GELU_K * (1.0 + 3.0 * GELU_C * x * x);
        *dx = g * (0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du);
    }
}

pub fn argmax(x: &[Float]) -> usize {
    debug_assert!(!x.is_empty());
    x.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Numerically stable in-place softmax. `-inf` entries come out as exact zeros.
pub fn softmax(x: &mut [Float]) {
    debug_assert!(!x.is_empty());
    let max_val = x.iter().fold(Float::NAN, |acc, &v| v.max(acc));
    let mut sum = 0f64;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v as f64;
    }
    let inv = (1.0 / sum) as Float;
    x.iter_mut().for_each(|v| *v *= inv);
}

/// log(sum(exp(x))), accumulated in f64.
pub fn log_sum_exp(x: &[Float]) -> f64 {
    let max_val = x.iter().fold(Float::NAN, |acc, &v| v.max(acc)) as f64;
    let sum = x.iter().map(|&v| (v as f64 - max_val).exp()).sum::<f64>();
    max_val + sum.ln()
}

fn rope_rotate(x: &mut [Float], head_size: usize, pos: usize, sign: Float) {
    // q may not equal to k, but they all should be divided by head_size
    for head in x.chunks_exact_mut(head_size) {
        for (i, v) in head.chunks_exact_mut(2).enumerate() {
            let freq = 1.0 / ROPE_THETA.powf(2.0 * i as Float / head_size as Float);
            let val = pos as Float * freq;
            let fcr = val.cos();
            let fci = sign * val.sin();

            let v0 = v[0];
            let v1 = v[1];
            v[0] = v0 * fcr - v1 * fci;
            v[1] = v0 * fci + v1 * fcr;
        }
    }
}

/// Rotary position encoding of every head in `x` for position `pos`.
pub fn rope(x: &mut [Float], head_size: usize, pos: usize) {
    rope_rotate(x, head_size, pos, 1.0)
}

/// Backward of [`rope`]: the rotation is orthogonal, so the gradient rotates by `-pos`.
pub fn rope_backward(dx: &mut [Float], head_size: usize, pos: usize) {
    rope_rotate(dx, head_size, pos, -1.0)
}

pub fn add_inplace(x: &mut [Float], y: &[Float]) {
    debug_assert_eq!(x.len(), y.len());
    x.iter_mut().zip(y).for_each(|(x, &y)| *x += y);
}

/// y += alpha * x
pub fn axpy(y: &mut [Float], alpha: Float, x: &[Float]) {
    debug_assert_eq!(x.len(), y.len());
    y.iter_mut().zip(x).for_each(|(y, &x)| *y += alpha * x);
}
