use rand::Rng;

use crate::{
    operator,
    params::{Gradients, ParamId, Parameters},
    tensor::Tensor,
};

/// Position-wise `dim -> hidden_dim -> dim` projection with a GELU in between.
#[derive(Debug, Clone)]
pub struct FeedForward {
    w1: ParamId,
    b1: ParamId,
    w2: ParamId,
    b2: ParamId,
    dim: usize,
    hidden_dim: usize,
}

#[derive(Debug, Clone)]
pub struct FeedForwardTrace {
    /// (t, hidden_dim) before the activation
    pre: Vec<f32>,
    /// (t, hidden_dim) after the activation
    act: Vec<f32>,
}

impl FeedForward {
    pub fn new<R: Rng>(
        params: &mut Parameters,
        prefix: &str,
        dim: usize,
        hidden_dim: usize,
        std: f32,
        out_std: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            w1: params.register(
                format!("{prefix}.w1"),
                Tensor::randn(&[hidden_dim, dim], std, rng),
            ),
            b1: params.register(format!("{prefix}.b1"), Tensor::new(&[hidden_dim])),
            w2: params.register(
                format!("{prefix}.w2"),
                Tensor::randn(&[dim, hidden_dim], out_std, rng),
            ),
            b2: params.register(format!("{prefix}.b2"), Tensor::new(&[dim])),
            dim,
            hidden_dim,
        }
    }

    pub fn forward(&self, params: &Parameters, x: &[f32]) -> (Vec<f32>, FeedForwardTrace) {
        let t = x.len() / self.dim;
        let mut pre = vec![0.0; t * self.hidden_dim];
        operator::linear(
            &mut pre,
            x,
            &params[self.w1],
            Some(params[self.b1].as_slice()),
            self.dim,
            self.hidden_dim,
        );
        let mut act = pre.clone();
        operator::gelu(&mut act);

        let mut out = vec![0.0; t * self.dim];
        operator::linear(
            &mut out,
            &act,
            &params[self.w2],
            Some(params[self.b2].as_slice()),
            self.hidden_dim,
            self.dim,
        );
        (out, FeedForwardTrace { pre, act })
    }

    pub fn backward(
        &self,
        params: &Parameters,
        grads: &mut Gradients,
        x: &[f32],
        trace: &FeedForwardTrace,
        dout: &[f32],
    ) -> Vec<f32> {
        let mut dact = vec![0.0; trace.act.len()];
        let (dw2, db2) = grads.pair_mut(self.w2, self.b2);
        operator::linear_backward(
            &mut dact,
            dw2,
            Some(db2.as_mut_slice()),
            dout,
            &trace.act,
            &params[self.w2],
            self.hidden_dim,
            self.dim,
        );

        let mut dpre = vec![0.0; trace.pre.len()];
        operator::gelu_backward(&mut dpre, &dact, &trace.pre);

        let mut dx = vec![0.0; x.len()];
        let (dw1, db1) = grads.pair_mut(self.w1, self.b1);
        operator::linear_backward(
            &mut dx,
            dw1,
            Some(db1.as_mut_slice()),
            &dpre,
            x,
            &params[self.w1],
            self.dim,
            self.hidden_dim,
        );
        dx
    }
}
