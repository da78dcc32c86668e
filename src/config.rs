use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};

use crate::{LmError, Result};

/// How position information enters the network. Fixed per checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEncoding {
    /// a `(seq_len, dim)` table added to the token embeddings
    Learned,
    /// rotation of q and k inside attention
    Rotary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    /// output projection reuses the token embedding table
    pub shared_weights: bool,
    pub position: PositionEncoding,
    pub norm_eps: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 64,
            hidden_dim: 256,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 4,
            vocab_size: 257,
            seq_len: 128,
            shared_weights: true,
            position: PositionEncoding::Rotary,
            norm_eps: 1e-5,
        }
    }
}

impl ModelConfig {
    /// Config with the usual 4x feed-forward expansion and plain multi-head attention.
    pub fn new(
        dim: usize,
        n_layers: usize,
        n_heads: usize,
        vocab_size: usize,
        seq_len: usize,
    ) -> Self {
        Self {
            dim,
            hidden_dim: 4 * dim,
            n_layers,
            n_heads,
            n_kv_heads: n_heads,
            vocab_size,
            seq_len,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(LmError::Configuration(format!("{name} must be greater than 0")));
        }
        if self.dim % self.n_heads != 0 {
            return Err(LmError::Configuration(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(LmError::Configuration(format!(
                "n_heads ({}) must be divisible by n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.position == PositionEncoding::Rotary && self.head_dim() % 2 != 0 {
            return Err(LmError::Configuration(format!(
                "rotary encoding needs an even head width, got {}",
                self.head_dim()
            )));
        }
        if !(self.norm_eps > 0.0) {
            return Err(LmError::Configuration("norm_eps must be positive".into()));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.head_dim() * self.n_kv_heads
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }
}

/// What a step does when it meets a NaN or infinite loss/gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// fail the step and stop the run
    #[default]
    Abort,
    /// drop the update, log a warning, continue
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// micro-batches summed before one optimizer step
    pub grad_accum_steps: usize,
    pub max_steps: usize,

    pub peak_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    /// step at which the cosine decay reaches `min_lr`
    pub decay_steps: usize,

    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    /// max global gradient norm, `<= 0` disables clipping
    pub grad_clip: f32,

    pub log_interval: usize,
    pub eval_interval: usize,
    pub eval_batches: usize,
    pub checkpoint_interval: usize,

    pub seed: u64,
    pub non_finite: NonFinitePolicy,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            grad_accum_steps: 1,
            max_steps: 1000,
            peak_lr: 1e-3,
            min_lr: 1e-4,
            warmup_steps: 100,
            decay_steps: 1000,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            weight_decay: 0.1,
            grad_clip: 1.0,
            log_interval: 10,
            eval_interval: 100,
            eval_batches: 8,
            checkpoint_interval: 500,
            seed: 42,
            non_finite: NonFinitePolicy::Abort,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.grad_accum_steps == 0 {
            return Err(LmError::Configuration(
                "batch_size and grad_accum_steps must be greater than 0".into(),
            ));
        }
        if self.warmup_steps > self.decay_steps {
            return Err(LmError::Configuration(format!(
                "warmup_steps ({}) must not exceed decay_steps ({})",
                self.warmup_steps, self.decay_steps
            )));
        }
        if !(self.peak_lr >= self.min_lr && self.min_lr >= 0.0) {
            return Err(LmError::Configuration(
                "learning rates must satisfy 0 <= min_lr <= peak_lr".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(LmError::Configuration("betas must lie in [0, 1)".into()));
        }
        if self.weight_decay < 0.0 {
            return Err(LmError::Configuration("weight_decay must not be negative".into()));
        }
        Ok(())
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }
}
