//! Learning-rate schedules.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;

pub trait LrScheduler {
    /// Learning rate for `step`; a pure function of the step.
    fn lr_at(&self, step: usize) -> f32;
}

/// Linear warmup from 0 to `peak_lr` over `warmup_steps`, cosine decay to
/// `min_lr` at `decay_steps`, then flat at `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmupCosine {
    pub peak_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub decay_steps: usize,
}

impl WarmupCosine {
    pub fn new(peak_lr: f32, warmup_steps: usize, decay_steps: usize) -> Self {
        Self {
            peak_lr,
            min_lr: 0.0,
            warmup_steps,
            decay_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn from_config(conf: &TrainConfig) -> Self {
        Self::new(conf.peak_lr, conf.warmup_steps, conf.decay_steps).with_min_lr(conf.min_lr)
    }
}

impl LrScheduler for WarmupCosine {
    fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            self.peak_lr * (step as f32 / self.warmup_steps as f32)
        } else if step < self.decay_steps {
            let span = self.decay_steps - self.warmup_steps;
            let progress = (step - self.warmup_steps) as f32 / span as f32;
            let cosine = 0.5 * (1.0 + (progress * PI).cos());
            self.min_lr + (self.peak_lr - self.min_lr) * cosine
        } else {
            self.min_lr
        }
    }
}
