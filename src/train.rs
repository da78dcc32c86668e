//! The training loop: micro-batches, accumulation, clipping, AdamW, and the
//! evaluation/checkpoint policy.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointHandle, CheckpointStore},
    config::{NonFinitePolicy, TrainConfig},
    data::{Batch, DataLoader, Sample},
    loss::{self, LossSum},
    model::Transformer,
    optim::{AdamW, OptimizerState},
    params::Gradients,
    schedule::{LrScheduler, WarmupCosine},
    LmError, Result,
};

/// Mutable progress of a run, owned by the [`Trainer`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainState {
    /// completed optimizer steps
    pub step: usize,
    pub optimizer: OptimizerState,
    pub best_eval_loss: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub step: usize,
    /// mean masked loss of the step's micro-batches
    pub loss: f32,
    /// global gradient norm before clipping
    pub grad_norm: f32,
    pub lr: f32,
    /// input tokens seen by the step
    pub tokens: usize,
    /// the update was dropped because of non-finite values
    pub skipped: bool,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    pub last: Option<StepStats>,
    pub best_eval_loss: Option<f32>,
    pub checkpoints: Vec<CheckpointHandle>,
}

pub struct Trainer {
    model: Transformer,
    config: TrainConfig,
    optimizer: AdamW,
    schedule: WarmupCosine,
    state: TrainState,
}

impl Trainer {
    pub fn new(model: Transformer, config: TrainConfig) -> Result<Self> {
        let state = TrainState {
            step: 0,
            optimizer: OptimizerState::zeros_like(model.params()),
            best_eval_loss: None,
        };
        Self::with_state(model, config, state)
    }

    /// Continues from `checkpoint` with the step counter, moments and best
    /// evaluation loss it recorded.
    pub fn resume(checkpoint: Checkpoint, config: TrainConfig) -> Result<Self> {
        let model = checkpoint.to_model()?;
        let state = TrainState {
            step: checkpoint.step,
            optimizer: checkpoint.optimizer,
            best_eval_loss: checkpoint.best_eval_loss,
        };
        Self::with_state(model, config, state)
    }

    fn with_state(model: Transformer, config: TrainConfig, state: TrainState) -> Result<Self> {
        config.validate()?;
        state.optimizer.check_matches(model.params())?;
        Ok(Self {
            optimizer: AdamW::from_config(&config),
            schedule: WarmupCosine::from_config(&config),
            model,
            config,
            state,
        })
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn into_model(self) -> Transformer {
        self.model
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    /// Snapshot of the current parameters and training state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            config: self.model.config().clone(),
            step: self.state.step,
            best_eval_loss: self.state.best_eval_loss,
            params: self
                .model
                .params()
                .iter()
                .map(|(name, t)| (name.to_owned(), t.clone()))
                .collect(),
            optimizer: self.state.optimizer.clone(),
        }
    }

    fn sample_gradients(&self, sample: &Sample, scale: f32) -> Result<(LossSum, Gradients)> {
        if sample.input.len() != sample.target.len() {
            return Err(LmError::Shape(format!(
                "{} input ids but {} targets",
                sample.input.len(),
                sample.target.len()
            )));
        }
        let vocab = self.model.config().vocab_size;
        let (logits, trace) = self.model.forward_train(&sample.input)?;
        let (sum, dlogits) = loss::cross_entropy_backward(&logits, &sample.target, vocab, scale)?;
        let grads = self.model.backward(&trace, &dlogits)?;
        Ok((sum, grads))
    }

    /// Gradient of `mean_b(mean loss of micro-batch b)` summed over the
    /// micro-batches, together with that loss. Parameters are not touched.
    ///
    /// Micro-batches without targets take no part in the mean; a step with
    /// no targets at all is a shape error.
    pub fn compute_gradients(&self, micro_batches: &[Batch]) -> Result<(f32, Gradients)> {
        let params = self.model.params();
        let counted: Vec<(&Batch, usize)> = micro_batches
            .iter()
            .map(|batch| (batch, batch.num_targets()))
            .filter(|&(_, count)| count > 0)
            .collect();
        if counted.is_empty() {
            return Err(LmError::Shape("training step contains no targets".into()));
        }
        let n_micro = counted.len() as f32;
        let mut grads = Gradients::zeros_like(params);
        let mut loss = 0f64;
        for (batch, count) in counted {
            let scale = 1.0 / (count as f32 * n_micro);
            let (sum, batch_grads) = batch
                .samples
                .par_iter()
                .map(|sample| self.sample_gradients(sample, scale))
                .try_reduce(
                    || (LossSum::default(), Gradients::zeros_like(params)),
                    |(mut sum, mut grads), (other_sum, other_grads)| {
                        sum.add(other_sum);
                        grads.accumulate(&other_grads);
                        Ok((sum, grads))
                    },
                )?;
            grads.accumulate(&batch_grads);
            loss += sum.mean() as f64 / n_micro as f64;
        }
        Ok((loss as f32, grads))
    }

    /// Clips `grads` and runs one optimizer update.
    ///
    /// Non-finite loss or gradients fail the step without touching the
    /// parameters; with [`NonFinitePolicy::Skip`] the step is counted,
    /// reported as skipped, and training can go on.
    pub fn apply_gradients(&mut self, mut grads: Gradients, loss: f32) -> Result<StepStats> {
        let step = self.state.step + 1;
        let lr = self.schedule.lr_at(step);
        let grad_norm = grads.clip_global_norm(self.config.grad_clip);

        if !loss.is_finite() || !grad_norm.is_finite() {
            let err = LmError::NumericInstability {
                step,
                loss,
                grad_norm,
            };
            return match self.config.non_finite {
                NonFinitePolicy::Abort => Err(err),
                NonFinitePolicy::Skip => {
                    warn!(step, loss, grad_norm, "skipping update: {err}");
                    self.state.step = step;
                    Ok(StepStats {
                        step,
                        loss,
                        grad_norm,
                        lr,
                        tokens: 0,
                        skipped: true,
                    })
                }
            };
        }

        self.optimizer.step(
            self.model.params_mut(),
            &grads,
            &mut self.state.optimizer,
            lr,
        )?;
        self.state.step = step;
        Ok(StepStats {
            step,
            loss,
            grad_norm,
            lr,
            tokens: 0,
            skipped: false,
        })
    }

    /// One optimizer step over `micro_batches`, accumulating their gradients.
    pub fn train_step(&mut self, micro_batches: &[Batch]) -> Result<StepStats> {
        let (loss, grads) = self.compute_gradients(micro_batches)?;
        let mut stats = self.apply_gradients(grads, loss)?;
        stats.tokens = micro_batches.iter().map(Batch::num_tokens).sum();
        Ok(stats)
    }

    /// Mean masked loss over `batches`, without updating anything.
    pub fn evaluate(&self, batches: &[Batch]) -> Result<f32> {
        let vocab = self.model.config().vocab_size;
        let total = batches
            .par_iter()
            .flat_map(|batch| batch.samples.par_iter())
            .map(|sample| {
                let logits = self.model.forward(&sample.input)?;
                loss::cross_entropy(&logits, &sample.target, vocab)
            })
            .try_reduce(LossSum::default, |mut a, b| {
                a.add(b);
                Ok(a)
            })?;
        if total.count == 0 {
            return Err(LmError::Shape("evaluation batches contain no targets".into()));
        }
        Ok(total.mean())
    }

    /// Trains until `max_steps`, logging every `log_interval` steps, evaluating
    /// every `eval_interval` steps and checkpointing every
    /// `checkpoint_interval` steps, on every new best evaluation loss and at the end.
    pub fn fit(
        &mut self,
        train: &DataLoader,
        eval: Option<&DataLoader>,
        store: &dyn CheckpointStore,
    ) -> Result<FitSummary> {
        if train.num_batches() == 0 {
            return Err(LmError::Configuration(
                "training data does not fill a single batch".into(),
            ));
        }
        let accum = self.config.grad_accum_steps;
        let mut summary = FitSummary {
            best_eval_loss: self.state.best_eval_loss,
            ..FitSummary::default()
        };
        info!(
            parameters = self.model.num_parameters(),
            start = self.state.step,
            max_steps = self.config.max_steps,
            "training"
        );

        // resumed runs continue where the data stream left off
        let mut batches = train.cycle().skip(self.state.step * accum);
        let mut clock = Instant::now();
        let mut window_tokens = 0;
        while self.state.step < self.config.max_steps {
            let micro: Vec<Batch> = batches.by_ref().take(accum).collect();
            let stats = self.train_step(&micro)?;
            window_tokens += stats.tokens;
            summary.last = Some(stats);

            let step = stats.step;
            if every(step, self.config.log_interval) || step == 1 {
                let elapsed = clock.elapsed().as_secs_f32().max(f32::EPSILON);
                info!(
                    step,
                    loss = stats.loss,
                    grad_norm = stats.grad_norm,
                    lr = stats.lr,
                    tok_per_s = window_tokens as f32 / elapsed,
                    "step"
                );
                clock = Instant::now();
                window_tokens = 0;
            }

            if let Some(eval) = eval.filter(|_| every(step, self.config.eval_interval)) {
                let eval_batches: Vec<Batch> = eval.iter().take(self.config.eval_batches).collect();
                let eval_loss = self.evaluate(&eval_batches)?;
                info!(step, eval_loss, "evaluation");
                if self.state.best_eval_loss.map_or(true, |best| eval_loss < best) {
                    self.state.best_eval_loss = Some(eval_loss);
                    summary.best_eval_loss = Some(eval_loss);
                    summary.checkpoints.push(store.save_best(&self.checkpoint())?);
                }
            }

            if every(step, self.config.checkpoint_interval) {
                summary.checkpoints.push(store.save(&self.checkpoint())?);
            }
        }

        let saved_last = summary.checkpoints.iter().any(|h| h.step == self.state.step);
        if summary.last.is_some() && !saved_last {
            summary.checkpoints.push(store.save(&self.checkpoint())?);
        }
        Ok(summary)
    }
}

/// `interval == 0` means never.
fn every(step: usize, interval: usize) -> bool {
    interval > 0 && step % interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn model() -> Transformer {
        Transformer::new(ModelConfig::new(8, 1, 2, 6, 8), 2).unwrap()
    }

    fn sample(tokens: &[usize]) -> Sample {
        Sample::from_tokens(tokens).unwrap()
    }

    fn config() -> TrainConfig {
        TrainConfig {
            warmup_steps: 0,
            decay_steps: 100,
            grad_clip: 0.0,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn two_half_batches_match_one_full_batch() {
        let trainer = Trainer::new(model(), config()).unwrap();
        let (a, b) = (sample(&[1, 2, 3, 4]), sample(&[5, 4, 3, 2]));
        let (full_loss, full) = trainer
            .compute_gradients(&[Batch::new(vec![a.clone(), b.clone()])])
            .unwrap();
        let (half_loss, halves) = trainer
            .compute_gradients(&[Batch::new(vec![a]), Batch::new(vec![b])])
            .unwrap();
        assert!((full_loss - half_loss).abs() < 1e-5);
        for (x, y) in full.tensors().iter().zip(halves.tensors()) {
            for (u, v) in x.iter().zip(y.iter()) {
                assert!((u - v).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn padding_micro_batches_do_not_dilute_the_step() {
        let trainer = Trainer::new(model(), config()).unwrap();
        let real = Batch::new(vec![sample(&[1, 2, 3, 4])]);
        let padding = Batch::new(vec![Sample::new(vec![1, 2, 3], vec![None; 3]).unwrap()]);
        let (alone_loss, alone) = trainer.compute_gradients(&[real.clone()]).unwrap();
        let (padded_loss, padded) = trainer.compute_gradients(&[real, padding]).unwrap();
        assert!((alone_loss - padded_loss).abs() < 1e-6);
        for (x, y) in alone.tensors().iter().zip(padded.tensors()) {
            assert_eq!(x, y);
        }
    }

    #[test]
    fn all_padding_step_is_rejected_without_an_update() {
        let mut trainer = Trainer::new(model(), config()).unwrap();
        let before = trainer.model().params().clone();
        let padding = Batch::new(vec![Sample::new(vec![1, 2, 3], vec![None; 3]).unwrap()]);
        assert!(matches!(trainer.train_step(&[padding]), Err(LmError::Shape(_))));
        assert_eq!(trainer.model().params(), &before);
        assert_eq!(trainer.state().step, 0);
        assert_eq!(trainer.state().optimizer.step, 0);
    }

    #[test]
    fn non_finite_loss_aborts_without_touching_parameters() {
        let mut trainer = Trainer::new(model(), config()).unwrap();
        let before = trainer.model().params().clone();
        let grads = Gradients::zeros_like(trainer.model().params());
        let err = trainer.apply_gradients(grads, f32::NAN).unwrap_err();
        assert!(matches!(err, LmError::NumericInstability { step: 1, .. }));
        assert_eq!(trainer.model().params(), &before);
        assert_eq!(trainer.state().step, 0);
    }

    #[test]
    fn skip_policy_counts_the_step_but_keeps_parameters() {
        let conf = TrainConfig {
            non_finite: NonFinitePolicy::Skip,
            ..config()
        };
        let mut trainer = Trainer::new(model(), conf).unwrap();
        let before = trainer.model().params().clone();
        let mut grads = Gradients::zeros_like(trainer.model().params());
        grads.tensors_mut()[0].fill(f32::INFINITY);
        let stats = trainer.apply_gradients(grads, 1.0).unwrap();
        assert!(stats.skipped);
        assert_eq!(trainer.state().step, 1);
        assert_eq!(trainer.state().optimizer.step, 0);
        assert_eq!(trainer.model().params(), &before);
    }

    #[test]
    fn overlong_samples_are_fatal() {
        let mut trainer = Trainer::new(model(), config()).unwrap();
        let long = sample(&[1; 10]);
        assert!(matches!(
            trainer.train_step(&[Batch::new(vec![long])]),
            Err(LmError::SequenceTooLong { len: 9, max: 8 })
        ));
    }

    #[test]
    fn evaluate_matches_the_step_loss() {
        let trainer = Trainer::new(model(), config()).unwrap();
        let batch = Batch::new(vec![sample(&[1, 2, 3]), sample(&[3, 2, 1])]);
        let eval = trainer.evaluate(std::slice::from_ref(&batch)).unwrap();
        let (loss, _) = trainer.compute_gradients(&[batch]).unwrap();
        assert!((eval - loss).abs() < 1e-5);
    }
}
