use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{operator, LmError, Result};

/// How the next token is picked from the logits.
///
/// Filters run in a fixed order: temperature, top-k, top-p, then a draw.
/// A temperature of 0 is greedy decoding and ignores the other filters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingPolicy {
    pub temperature: f32,
    pub top_k: Option<usize>,
    /// nucleus mass in (0, 1]
    pub top_p: Option<f32>,
    pub seed: u64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            seed: 0,
        }
    }
}

impl SamplingPolicy {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0 && self.temperature.is_finite()) {
            return Err(LmError::Configuration(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(LmError::Configuration("top_k must be at least 1".into()));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(LmError::Configuration(format!(
                    "top_p must lie in (0, 1], got {p}"
                )));
            }
        }
        Ok(())
    }
}

pub struct Sampler {
    policy: SamplingPolicy,
    rng: SmallRng,
}

impl Sampler {
    pub fn new(policy: SamplingPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            rng: SmallRng::seed_from_u64(policy.seed),
        })
    }

    pub fn policy(&self) -> &SamplingPolicy {
        &self.policy
    }

    /// Picks a token id. `logits` is used as scratch space.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        if self.policy.temperature == 0.0 {
            return operator::argmax(logits);
        }
        let best = operator::argmax(logits);
        logits
            .iter_mut()
            .for_each(|logit| *logit /= self.policy.temperature);
        // a tiny temperature can push the scaled logits past f32 range
        if !logits[best].is_finite() {
            return best;
        }
        if let Some(k) = self.policy.top_k {
            top_k_filter(logits, k);
        }
        operator::softmax(logits);
        if let Some(p) = self.policy.top_p {
            top_p_filter(logits, p);
        }
        let coin: f32 = self.rng.gen();
        draw(logits, coin)
    }
}

/// Indices sorted by descending value.
fn ranked(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

/// Keeps the `k` largest logits, the rest become `-inf`.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    for &i in &ranked(logits)[k..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

/// Keeps the smallest set of most likely tokens whose mass reaches `p`,
/// zeroes the rest and renormalises.
pub fn top_p_filter(probs: &mut [f32], p: f32) {
    let order = ranked(probs);
    let mut mass = 0f64;
    let mut keep = order.len();
    for (n, &i) in order.iter().enumerate() {
        mass += probs[i] as f64;
        if mass >= p as f64 {
            keep = n + 1;
            break;
        }
    }
    for &i in &order[keep..] {
        probs[i] = 0.0;
    }
    let total: f64 = probs.iter().map(|&v| v as f64).sum();
    if total > 0.0 {
        probs.iter_mut().for_each(|v| *v = (*v as f64 / total) as f32);
    }
}

/// Inverse-CDF draw with `coin` in [0, 1).
fn draw(probs: &[f32], coin: f32) -> usize {
    let mut cdf = 0.0;
    let mut last = 0;
    for (i, &prob) in probs.iter().enumerate() {
        if prob > 0.0 {
            cdf += prob;
            last = i;
            if coin < cdf {
                return i;
            }
        }
    }
    // rounding left the total just under `coin`
    last
}
