//! The decoder-only transformer.

mod attention;
mod feed_forward;
mod layer;
mod norm;

use rand::{rngs::SmallRng, SeedableRng};

pub use attention::{Attention, AttentionTrace};
pub use feed_forward::{FeedForward, FeedForwardTrace};
pub use layer::{Layer, LayerTrace};
pub use norm::{LayerNorm, NormTrace};

use crate::{
    config::{ModelConfig, PositionEncoding},
    kv_cache::KvCache,
    operator,
    params::{Gradients, ParamId, Parameters},
    tensor::Tensor,
    LmError, Result,
};

const INIT_STD: f32 = 0.02;

pub struct Transformer {
    config: ModelConfig,
    params: Parameters,
    /// (vocab_size, dim)
    tok_emb: ParamId,
    /// (seq_len, dim), only with learned positions
    pos_emb: Option<ParamId>,
    layers: Box<[Layer]>,
    norm_f: LayerNorm,
    /// (vocab_size, dim); the same id as `tok_emb` when weights are shared
    lm_head: ParamId,
}

/// Everything a training forward pass keeps for [`Transformer::backward`].
pub struct ForwardTrace {
    tokens: Vec<usize>,
    cache: KvCache,
    layers: Vec<LayerTrace>,
    /// (t, dim) input of the final norm
    x_final: Vec<f32>,
    norm_f: NormTrace,
    /// (t, dim) input of the output projection
    x_out: Vec<f32>,
}

impl ForwardTrace {
    pub fn tokens(&self) -> &[usize] {
        &self.tokens
    }
}

impl Transformer {
    /// Builds a freshly initialised model. Fails on an invalid configuration.
    pub fn new(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut params = Parameters::default();

        let (vocab, dim) = (config.vocab_size, config.dim);
        let tok_emb = params.register("tok_emb", Tensor::randn(&[vocab, dim], INIT_STD, &mut rng));
        let pos_emb = match config.position {
            PositionEncoding::Learned => Some(params.register(
                "pos_emb",
                Tensor::randn(&[config.seq_len, dim], INIT_STD, &mut rng),
            )),
            PositionEncoding::Rotary => None,
        };
        let layers = (0..config.n_layers)
            .map(|i| Layer::new(&mut params, i, &config, &mut rng))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let norm_f = LayerNorm::new(&mut params, "norm_f", dim, config.norm_eps);
        let lm_head = if config.shared_weights {
            tok_emb
        } else {
            params.register("lm_head", Tensor::randn(&[vocab, dim], INIT_STD, &mut rng))
        };

        Ok(Self {
            config,
            params,
            tok_emb,
            pos_emb,
            layers,
            norm_f,
            lm_head,
        })
    }

    /// Rebuilds a model from stored tensors, in registration order.
    pub fn from_parameters(config: ModelConfig, tensors: Vec<(String, Tensor)>) -> Result<Self> {
        let mut model = Self::new(config, 0)?;
        model.params.replace_all(tensors)?;
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    pub fn num_parameters(&self) -> usize {
        self.params.num_elements()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Logits (t, vocab_size) for every position of `tokens`, starting at position 0.
    pub fn forward(&self, tokens: &[usize]) -> Result<Tensor> {
        let mut cache = KvCache::with_capacity(&self.config, tokens.len());
        let (logits, _) = self.run(tokens, &mut cache)?;
        Ok(logits)
    }

    /// Logits (t, vocab_size) for `tokens` placed after the positions already
    /// in `cache`, whose keys/values are extended in place.
    pub fn forward_cached(&self, tokens: &[usize], cache: &mut KvCache) -> Result<Tensor> {
        let (logits, _) = self.run(tokens, cache)?;
        Ok(logits)
    }

    /// Full-sequence forward that keeps the activations needed by [`Self::backward`].
    pub fn forward_train(&self, tokens: &[usize]) -> Result<(Tensor, ForwardTrace)> {
        let mut cache = KvCache::with_capacity(&self.config, tokens.len());
        let (logits, parts) = self.run(tokens, &mut cache)?;
        let (layers, x_final, norm_f, x_out) = parts;
        let trace = ForwardTrace {
            tokens: tokens.to_vec(),
            cache,
            layers,
            x_final,
            norm_f,
            x_out,
        };
        Ok((logits, trace))
    }

    fn check_tokens(&self, tokens: &[usize], cache: &KvCache) -> Result<()> {
        if tokens.is_empty() {
            return Err(LmError::Shape("expected at least one token".into()));
        }
        cache.check_layout(&self.config)?;
        let len = cache.len() + tokens.len();
        if len > self.config.seq_len {
            return Err(LmError::SequenceTooLong {
                len,
                max: self.config.seq_len,
            });
        }
        cache.reserve(tokens.len())?;
        if let Some(&bad) = tokens.iter().find(|&&id| id >= self.config.vocab_size) {
            return Err(LmError::Shape(format!(
                "token id {bad} outside vocabulary of {}",
                self.config.vocab_size
            )));
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn run(
        &self,
        tokens: &[usize],
        cache: &mut KvCache,
    ) -> Result<(Tensor, (Vec<LayerTrace>, Vec<f32>, NormTrace, Vec<f32>))> {
        self.check_tokens(tokens, cache)?;
        let (dim, vocab) = (self.config.dim, self.config.vocab_size);
        let start = cache.len();
        let t = tokens.len();

        let tok_emb = &self.params[self.tok_emb];
        let mut x = vec![0.0; t * dim];
        for (i, (row, &token)) in x.chunks_exact_mut(dim).zip(tokens).enumerate() {
            row.copy_from_slice(&tok_emb[token]);
            if let Some(pos_emb) = self.pos_emb {
                operator::add_inplace(row, &self.params[pos_emb][start + i]);
            }
        }

        let mut traces = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter() {
            let (out, trace) = layer.forward(&self.params, x, cache);
            traces.push(trace);
            x = out;
        }
        cache.advance(t);

        let (x_out, norm_f) = self.norm_f.forward(&self.params, &x);
        let mut logits = vec![0.0; t * vocab];
        operator::linear(&mut logits, &x_out, &self.params[self.lm_head], None, dim, vocab);
        let logits = Tensor::from_vec(logits, &[t, vocab])?;
        Ok((logits, (traces, x, norm_f, x_out)))
    }

    /// Gradients of every parameter given `dlogits` (t, vocab_size), the
    /// derivative of the loss with respect to the logits of `trace`'s forward pass.
    pub fn backward(&self, trace: &ForwardTrace, dlogits: &[f32]) -> Result<Gradients> {
        let (dim, vocab) = (self.config.dim, self.config.vocab_size);
        let t = trace.tokens.len();
        if dlogits.len() != t * vocab {
            return Err(LmError::Shape(format!(
                "logit gradient has {} values, expected {} x {}",
                dlogits.len(),
                t,
                vocab
            )));
        }

        let mut grads = Gradients::zeros_like(&self.params);
        let mut dx_out = vec![0.0; t * dim];
        operator::linear_backward(
            &mut dx_out,
            &mut grads[self.lm_head],
            None,
            dlogits,
            &trace.x_out,
            &self.params[self.lm_head],
            dim,
            vocab,
        );
        let mut dx = self.norm_f.backward(
            &self.params,
            &mut grads,
            &trace.x_final,
            &trace.norm_f,
            &dx_out,
        );

        for (layer, layer_trace) in self.layers.iter().zip(&trace.layers).rev() {
            dx = layer.backward(&self.params, &mut grads, &trace.cache, layer_trace, &dx);
        }

        // tied weights: this lands in the same tensor as the lm_head gradient
        let dtok = &mut grads[self.tok_emb];
        for (&token, d) in trace.tokens.iter().zip(dx.chunks_exact(dim)) {
            operator::add_inplace(&mut dtok[token], d);
        }
        if let Some(pos_emb) = self.pos_emb {
            let dpos = &mut grads[pos_emb];
            for (i, d) in dx.chunks_exact(dim).enumerate() {
                operator::add_inplace(&mut dpos[i], d);
            }
        }
        Ok(grads)
    }
}
