//! Trainer: one multi-rate training pass over the training split.
//!
//! Every batch is pushed through the model once per rate level and the
//! per-level losses are summed before a single backward pass. After the main
//! optimiser step the auxiliary (entropy-bound) optimiser takes its own step
//! and the annealing schedule advances exactly once.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use stanh_common::{mix_seed, BatchProvider, RateLevels, TrainerConfig};
use stanh_core::{CompressionModel, Quantize};

use crate::loss::RateDistortionLoss;
use crate::optimizer::Adam;
use crate::scheduler::AnnealingController;
use crate::tracking::{ExperimentTracker, NullTracker};

// ── Config ──────────────────────────────────────────────────────────────────

/// Per-step knobs of the training pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerOptions {
    pub clip_max_norm: f64,
    pub log_every: usize,
    pub seed: u64,
}

impl From<&TrainerConfig> for TrainerOptions {
    fn from(c: &TrainerConfig) -> Self {
        Self {
            clip_max_norm: c.clip_max_norm,
            log_every: c.log_every,
            seed: c.seed,
        }
    }
}

/// What one training pass did.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochTrainSummary {
    pub epoch: usize,
    pub steps: usize,
    pub global_step: usize,
    /// Mean over batches of the loss summed across rate levels.
    pub mean_loss: f64,
    /// Mean over batches and levels.
    pub mean_bpp: f64,
    pub mean_mse: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// Owns the optimisers and the annealing controller. The model is borrowed
/// per pass so evaluation can read it in between.
///
/// Every `log_every` steps the step metrics go to `tracing` and to the
/// tracker, keyed `step/*` and logged at the global step.
pub struct Trainer {
    pub optimizer: Adam,
    pub aux_optimizer: Option<Adam>,
    pub annealing: Option<AnnealingController>,
    pub global_step: usize,
    options: TrainerOptions,
    tracker: Arc<dyn ExperimentTracker>,
    device: Device,
}

impl Trainer {
    pub fn new(
        optimizer: Adam,
        aux_optimizer: Option<Adam>,
        annealing: Option<AnnealingController>,
        options: TrainerOptions,
        device: Device,
    ) -> Self {
        Self {
            optimizer,
            aux_optimizer,
            annealing,
            global_step: 0,
            options,
            tracker: Arc::new(NullTracker),
            device,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExperimentTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    /// Run one pass over `data`. Training noise is seeded from
    /// `(seed, epoch)`, so a resumed run replays the same draws.
    pub fn train_epoch<M, L>(
        &mut self,
        model: &M,
        loss_fn: &L,
        data: &dyn BatchProvider,
        levels: &RateLevels,
        epoch: usize,
    ) -> Result<EpochTrainSummary>
    where
        M: CompressionModel + ?Sized,
        L: RateDistortionLoss + ?Sized,
    {
        let mut rng = StdRng::seed_from_u64(mix_seed(self.options.seed, epoch as u64));
        let mut steps = 0usize;
        let (mut loss_sum, mut bpp_sum, mut mse_sum) = (0.0f64, 0.0f64, 0.0f64);

        for (i, batch) in data.batches(epoch)?.enumerate() {
            let batch = batch.with_context(|| format!("load training batch {i}"))?;
            let x = batch.to_tensor(&self.device)?;

            // Forward at every rate level, summing the objectives.
            let mut total: Option<Tensor> = None;
            let (mut bpp, mut mse) = (0.0f64, 0.0f64);
            for level in levels.iter() {
                let output = model
                    .forward(&x, level.index, Quantize::Noise(&mut rng))
                    .with_context(|| format!("forward at rate level {}", level.index))?;
                let terms = loss_fn.compute(&output, &x, level)?;
                let scalars = terms.scalars()?;
                bpp += scalars.bpp;
                mse += scalars.mse;
                total = Some(match total {
                    None => terms.loss,
                    Some(prev) => (prev + terms.loss)?,
                });
            }
            let Some(total) = total else {
                bail!("no rate levels to train");
            };
            let loss_val = total.to_scalar::<f32>()? as f64;

            // Backward + main step
            let mut grads = total.backward()?;
            let grad_norm = if self.options.clip_max_norm > 0.0 {
                self.optimizer
                    .clip_grad_norm(&mut grads, self.options.clip_max_norm)?
            } else {
                self.optimizer.grad_norm(&grads)?
            };
            self.optimizer.step(&grads)?;

            // Auxiliary step
            let mut aux_val = None;
            if let Some(aux) = self.aux_optimizer.as_mut() {
                if let Some(aux_loss) = model.aux_loss()? {
                    aux_val = Some(aux_loss.to_scalar::<f32>()? as f64);
                    aux.step(&aux_loss.backward()?)?;
                }
            }

            // Advance annealing
            let hardness = self.annealing.as_mut().map(|a| a.advance(self.global_step));

            let bpp = bpp / levels.len() as f64;
            let mse = mse / levels.len() as f64;
            if self.options.log_every > 0 && self.global_step % self.options.log_every == 0 {
                let lr = self.optimizer.learning_rate();
                let mut metrics = vec![
                    ("step/loss".to_string(), loss_val),
                    ("step/bpp".to_string(), bpp),
                    ("step/mse".to_string(), mse),
                    ("step/grad_norm".to_string(), grad_norm),
                    ("step/learning_rate".to_string(), lr),
                ];
                if let Some(aux) = aux_val {
                    metrics.push(("step/aux_loss".to_string(), aux));
                }
                if let Some(beta) = hardness {
                    metrics.push(("step/hardness".to_string(), beta));
                }
                self.tracker.log(self.global_step, &metrics);

                tracing::info!(
                    epoch,
                    step = self.global_step,
                    loss = format!("{loss_val:.4}"),
                    bpp = format!("{bpp:.4}"),
                    mse = format!("{mse:.6}"),
                    grad_norm = format!("{grad_norm:.4}"),
                    aux_loss = ?aux_val,
                    hardness = ?hardness,
                    lr,
                    "train step"
                );
            }

            self.global_step += 1;
            steps += 1;
            loss_sum += loss_val;
            bpp_sum += bpp;
            mse_sum += mse;
        }

        if steps == 0 {
            bail!("training split produced no batches");
        }
        let n = steps as f64;
        Ok(EpochTrainSummary {
            epoch,
            steps,
            global_step: self.global_step,
            mean_loss: loss_sum / n,
            mean_bpp: bpp_sum / n,
            mean_mse: mse_sum / n,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
