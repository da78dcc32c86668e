use crate::{
    operator,
    params::{Gradients, ParamId, Parameters},
    tensor::Tensor,
};

/// Layer normalisation with learned scale (gamma) and shift (beta).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub(crate) gamma: ParamId,
    pub(crate) beta: ParamId,
    dim: usize,
    eps: f32,
}

/// Row statistics kept for the backward pass.
#[derive(Debug, Clone)]
pub struct NormTrace {
    pub mean: Vec<f32>,
    pub rstd: Vec<f32>,
}

impl LayerNorm {
    pub fn new(params: &mut Parameters, prefix: &str, dim: usize, eps: f32) -> Self {
        Self {
            gamma: params.register(format!("{prefix}.gamma"), Tensor::filled(&[dim], 1.0)),
            beta: params.register(format!("{prefix}.beta"), Tensor::new(&[dim])),
            dim,
            eps,
        }
    }

    pub fn forward(&self, params: &Parameters, x: &[f32]) -> (Vec<f32>, NormTrace) {
        let rows = x.len() / self.dim;
        let mut out = vec![0.0; x.len()];
        let mut trace = NormTrace {
            mean: vec![0.0; rows],
            rstd: vec![0.0; rows],
        };
        operator::layer_norm(
            &mut out,
            &mut trace.mean,
            &mut trace.rstd,
            x,
            &params[self.gamma],
            &params[self.beta],
            self.dim,
            self.eps,
        );
        (out, trace)
    }

    pub fn backward(
        &self,
        params: &Parameters,
        grads: &mut Gradients,
        x: &[f32],
        trace: &NormTrace,
        dout: &[f32],
    ) -> Vec<f32> {
        let mut dx = vec![0.0; x.len()];
        let (dgamma, dbeta) = grads.pair_mut(self.gamma, self.beta);
        operator::layer_norm_backward(
            &mut dx,
            dgamma,
            dbeta,
            dout,
            x,
            &trace.mean,
            &trace.rstd,
            &params[self.gamma],
            self.dim,
        );
        dx
    }
}
