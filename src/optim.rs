use rayon::prelude::*;

use crate::{
    config::TrainConfig,
    params::{Gradients, Parameters},
    tensor::Tensor,
    LmError, Result,
};

/// First and second moments of every parameter plus the update counter used
/// for bias correction.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub m: Vec<Tensor>,
    pub v: Vec<Tensor>,
    pub step: u64,
}

impl OptimizerState {
    pub fn zeros_like(params: &Parameters) -> Self {
        let zeros: Vec<Tensor> = params.tensors().iter().map(Tensor::zeros_like).collect();
        Self {
            m: zeros.clone(),
            v: zeros,
            step: 0,
        }
    }

    /// Fails unless the moments line up one-to-one with `params`.
    pub fn check_matches(&self, params: &Parameters) -> Result<()> {
        if self.m.len() != params.len() || self.v.len() != params.len() {
            return Err(LmError::Shape(format!(
                "optimizer state holds {}/{} moments for {} parameters",
                self.m.len(),
                self.v.len(),
                params.len()
            )));
        }
        for ((name, p), (m, v)) in params.iter().zip(self.m.iter().zip(&self.v)) {
            m.expect_shape(p.shape(), name)?;
            v.expect_shape(p.shape(), name)?;
        }
        Ok(())
    }
}

/// AdamW with decoupled weight decay.
///
/// ```text
/// m = b1 * m + (1 - b1) * g
/// v = b2 * v + (1 - b2) * g^2
/// p = p - lr * (m / (1 - b1^t) / (sqrt(v / (1 - b2^t)) + eps) + wd * p)
/// ```
///
/// Decay only applies to tensors with two or more dimensions, so biases and
/// norm scales/shifts are left alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamW {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamW {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl AdamW {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn from_config(conf: &TrainConfig) -> Self {
        Self::new()
            .with_betas(conf.beta1, conf.beta2)
            .with_eps(conf.eps)
            .with_weight_decay(conf.weight_decay)
    }

    /// One update of every parameter with learning rate `lr`.
    pub fn step(
        &self,
        params: &mut Parameters,
        grads: &Gradients,
        state: &mut OptimizerState,
        lr: f32,
    ) -> Result<()> {
        state.check_matches(params)?;
        if grads.tensors().len() != params.len() {
            return Err(LmError::Shape(format!(
                "{} gradients for {} parameters",
                grads.tensors().len(),
                params.len()
            )));
        }

        state.step += 1;
        let t = state.step as i32;
        let bias1 = 1.0 - (self.beta1 as f64).powi(t);
        let bias2 = 1.0 - (self.beta2 as f64).powi(t);
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps as f64);

        params
            .tensors_mut()
            .par_iter_mut()
            .zip(grads.tensors().par_iter())
            .zip(state.m.par_iter_mut().zip(state.v.par_iter_mut()))
            .for_each(|((p, g), (m, v))| {
                let decay = if p.ndim() >= 2 { self.weight_decay } else { 0.0 };
                p.iter_mut()
                    .zip(g.iter())
                    .zip(m.iter_mut().zip(v.iter_mut()))
                    .for_each(|((p, &g), (m, v))| {
                        *m = b1 * *m + (1.0 - b1) * g;
                        *v = b2 * *v + (1.0 - b2) * g * g;
                        let m_hat = *m as f64 / bias1;
                        let v_hat = *v as f64 / bias2;
                        let update = (m_hat / (v_hat.sqrt() + eps)) as f32;
                        *p -= lr * (update + decay * *p);
                    });
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Parameters {
        let mut params = Parameters::default();
        params.register("w", Tensor::filled(&[2, 3], 1.0));
        params.register("b", Tensor::filled(&[3], 1.0));
        params
    }

    #[test]
    fn decay_skips_one_dimensional_tensors() {
        let mut params = params();
        let grads = Gradients::zeros_like(&params);
        let mut state = OptimizerState::zeros_like(&params);
        let opt = AdamW::new().with_weight_decay(0.1);
        for _ in 0..100 {
            opt.step(&mut params, &grads, &mut state, 1e-2).unwrap();
        }
        assert!(params.tensors()[1].iter().all(|&v| v == 1.0));
        assert!(params.tensors()[0].iter().all(|&v| v < 1.0));
        assert_eq!(state.step, 100);
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut params = params();
        let mut grads = Gradients::zeros_like(&params);
        grads.tensors_mut()[1].fill(0.5);
        let mut state = OptimizerState::zeros_like(&params);
        AdamW::new()
            .with_weight_decay(0.0)
            .step(&mut params, &grads, &mut state, 0.1)
            .unwrap();
        // bias-corrected m / sqrt(v) is sign(g) on the first step
        for &v in params.tensors()[1].iter() {
            assert!((v - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let mut params = params();
        let grads = Gradients::zeros_like(&params);
        let mut state = OptimizerState::zeros_like(&params);
        state.m.pop();
        assert!(matches!(
            AdamW::new().step(&mut params, &grads, &mut state, 0.1),
            Err(LmError::Shape(_))
        ));
        assert_eq!(state.step, 0);
    }
}
