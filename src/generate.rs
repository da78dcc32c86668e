//! Autoregressive decoding with a key/value cache.

use tracing::debug;

use crate::{
    kv_cache::KvCache,
    model::Transformer,
    sampler::{Sampler, SamplingPolicy},
    LmError, Result,
};

/// Why a session stopped producing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// the end-of-sequence id was sampled; it is not yielded
    Eos,
    MaxTokens,
    /// the cache holds the whole context length
    ContextFull,
    Cancelled,
    /// a forward pass returned an error, which was yielded
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefill,
    Decode(usize),
    Done(StopReason),
}

/// One generation request: prefill the prompt, then decode a token per step.
///
/// Iterating yields generated ids until a [`StopReason`] applies. The session
/// owns its cache; the model is only borrowed, so many sessions can share one
/// model across threads.
pub struct Session<'m> {
    model: &'m Transformer,
    cache: Option<KvCache>,
    sampler: Sampler,
    prompt: Vec<usize>,
    generated: Vec<usize>,
    max_new_tokens: usize,
    eos_id: Option<usize>,
    phase: Phase,
}

/// Checks the prompt and sets up a session. Nothing runs until the first `next()`.
pub fn start_session<'m>(
    model: &'m Transformer,
    prompt: &[usize],
    max_new_tokens: usize,
    policy: SamplingPolicy,
) -> Result<Session<'m>> {
    let conf = model.config();
    if prompt.is_empty() {
        return Err(LmError::Shape("prompt must contain at least one token".into()));
    }
    if prompt.len() > conf.seq_len {
        return Err(LmError::SequenceTooLong {
            len: prompt.len(),
            max: conf.seq_len,
        });
    }
    if let Some(&bad) = prompt.iter().find(|&&id| id >= conf.vocab_size) {
        return Err(LmError::Shape(format!(
            "prompt token {bad} outside vocabulary of {}",
            conf.vocab_size
        )));
    }
    Ok(Session {
        model,
        cache: Some(KvCache::new(conf)),
        sampler: Sampler::new(policy)?,
        prompt: prompt.to_vec(),
        generated: Vec::with_capacity(max_new_tokens),
        max_new_tokens,
        eos_id: None,
        phase: Phase::Prefill,
    })
}

/// Runs a session to completion and returns the generated ids.
pub fn generate(
    model: &Transformer,
    prompt: &[usize],
    max_new_tokens: usize,
    policy: SamplingPolicy,
) -> Result<Vec<usize>> {
    start_session(model, prompt, max_new_tokens, policy)?.collect()
}

impl<'m> Session<'m> {
    /// Stops the session when `eos_id` is sampled.
    pub fn with_eos(mut self, eos_id: usize) -> Self {
        self.eos_id = Some(eos_id);
        self
    }

    /// `None` while the session can still produce tokens.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.phase {
            Phase::Done(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn prompt(&self) -> &[usize] {
        &self.prompt
    }

    pub fn generated(&self) -> &[usize] {
        &self.generated
    }

    /// Ends the session and releases its cache.
    pub fn cancel(&mut self) {
        if self.stop_reason().is_none() {
            self.finish(StopReason::Cancelled);
        }
    }

    fn finish(&mut self, reason: StopReason) {
        debug!(?reason, generated = self.generated.len(), "session finished");
        self.phase = Phase::Done(reason);
        self.cache = None;
    }

    fn step(&mut self) -> Result<Option<usize>> {
        if self.generated.len() >= self.max_new_tokens {
            self.finish(StopReason::MaxTokens);
            return Ok(None);
        }
        let Some(cache) = self.cache.as_mut() else {
            return Ok(None);
        };
        let logits = match self.phase {
            Phase::Prefill => {
                debug!(prompt = self.prompt.len(), "prefill");
                self.model.forward_cached(&self.prompt, cache)?
            }
            Phase::Decode(last) => {
                if cache.remaining() == 0 {
                    self.finish(StopReason::ContextFull);
                    return Ok(None);
                }
                self.model.forward_cached(&[last], cache)?
            }
            Phase::Done(_) => return Ok(None),
        };

        let mut last_row = logits[logits.rows() - 1].to_vec();
        let token = self.sampler.sample(&mut last_row);
        if self.eos_id == Some(token) {
            self.finish(StopReason::Eos);
            return Ok(None);
        }
        self.generated.push(token);
        self.phase = Phase::Decode(token);
        Ok(Some(token))
    }
}

impl Iterator for Session<'_> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop_reason().is_some() {
            return None;
        }
        match self.step() {
            Ok(token) => token.map(Ok),
            Err(e) => {
                self.finish(StopReason::Failed);
                Some(Err(e))
            }
        }
    }
}
