//! Training orchestrator: the epoch loop.
//!
//! Per epoch, strictly in this order:
//!
//! 1. Skip the training pass when the model has no trainable parameters.
//! 2. Otherwise run one multi-rate training pass.
//! 3. Evaluate every rate level on the validation split, then the test split.
//! 4. Average the validation losses into the aggregate loss.
//! 5. Feed the aggregate (never test metrics) to the plateau scheduler.
//! 6. Track the best aggregate loss.
//! 7. On improvement of an annealed model, dump each level's quantiser curve.
//! 8. Resolve (and create) the run's checkpoint directory.
//! 9. Persist the checkpoint record when saving is enabled.
//! 10. Send the epoch's metrics to the tracker.
//! 11. Log the epoch's wall-clock duration.
//!
//! Errors from training, evaluation or local persistence abort the run with
//! the epoch and rate level attached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};

use stanh_common::{BatchProvider, RateLevels, RunConfig};
use stanh_core::CompressionModel;

use crate::checkpoint::{
    CheckpointPaths, CheckpointRecord, CheckpointStore, RecordMeta, AUX_OPTIMIZER_PREFIX,
    MODEL_PREFIX, OPTIMIZER_PREFIX, RECORD_VERSION,
};
use crate::evaluator::{LevelMetrics, RateLevelEvaluator};
use crate::loss::RateDistortionLoss;
use crate::optimizer::{Adam, AdamMeta};
use crate::scheduler::{AnnealingController, PlateauConfig, PlateauScheduler};
use crate::tracking::ExperimentTracker;
use crate::trainer::{EpochTrainSummary, Trainer, TrainerOptions};
use crate::visualize::{sample_points, QuantizerCurve, VisualizationHook};

/// Points per dumped quantiser curve.
const CURVE_POINTS: usize = 1000;

// ── Types ───────────────────────────────────────────────────────────────────

/// Everything the orchestrator drives but does not build itself.
pub struct Collaborators<M, L> {
    pub model: M,
    pub loss: L,
    pub annealing: Option<AnnealingController>,
    pub train: Box<dyn BatchProvider>,
    pub valid: Box<dyn BatchProvider>,
    pub test: Box<dyn BatchProvider>,
    pub tracker: Arc<dyn ExperimentTracker>,
    pub hook: Box<dyn VisualizationHook>,
}

/// Loop position. Optimiser, scheduler and annealing state live with their
/// owners and are captured together at save time.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// Next epoch to run.
    pub epoch: usize,
    pub best_loss: f64,
    pub encoder_epoch: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            best_loss: f64::INFINITY,
            encoder_epoch: 0,
        }
    }
}

/// Outcome of one epoch.
#[derive(Debug, Clone)]
pub struct EpochResult {
    pub epoch: usize,
    /// `None` when the training pass was skipped.
    pub train: Option<EpochTrainSummary>,
    /// One entry per rate level, in level order.
    pub validation: Vec<LevelMetrics>,
    pub test: Vec<LevelMetrics>,
    pub aggregate_validation_loss: f64,
    pub is_best: bool,
    pub best_loss: f64,
    pub lr: f64,
    pub lr_reduced: bool,
    pub duration: Duration,
}

impl EpochResult {
    pub fn trained(&self) -> bool {
        self.train.is_some()
    }

    /// Test loss of the last rate level only.
    pub fn final_level_test_loss(&self) -> f64 {
        self.test.last().map(|m| m.loss).unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub epochs_run: usize,
    pub best_loss: f64,
    pub global_step: usize,
}

// ── Orchestrator ────────────────────────────────────────────────────────────

pub struct TrainingOrchestrator<M, L> {
    config: RunConfig,
    levels: RateLevels,
    model: M,
    loss: L,
    trainer: Trainer,
    scheduler: PlateauScheduler,
    evaluator: RateLevelEvaluator,
    store: CheckpointStore,
    train: Box<dyn BatchProvider>,
    valid: Box<dyn BatchProvider>,
    test: Box<dyn BatchProvider>,
    tracker: Arc<dyn ExperimentTracker>,
    hook: Box<dyn VisualizationHook>,
    state: TrainingState,
    device: Device,
}

impl<M: CompressionModel, L: RateDistortionLoss> TrainingOrchestrator<M, L> {
    /// Validate `config`, apply the freeze switch, build the optimisers and,
    /// if `config.checkpoint` is set, load it.
    pub fn new(config: RunConfig, parts: Collaborators<M, L>, device: Device) -> Result<Self> {
        config.validate()?;
        let levels = config.rate_levels()?;
        let mut model = parts.model;
        if config.trainer.freeze {
            model.freeze();
            tracing::info!(
                active = model.active_parameter_count(),
                "backbone frozen; only per-level parameters train"
            );
        }

        let optimizer = Adam::new(model.parameters(), AdamMeta::with_lr(config.trainer.lr))?;
        let aux_params = model.aux_parameters();
        let aux_optimizer = if aux_params.is_empty() {
            None
        } else {
            Some(Adam::new(aux_params, AdamMeta::with_lr(config.trainer.aux_lr))?)
        };
        let trainer = Trainer::new(
            optimizer,
            aux_optimizer,
            parts.annealing,
            TrainerOptions::from(&config.trainer),
            device.clone(),
        )
        .with_tracker(Arc::clone(&parts.tracker));
        let scheduler =
            PlateauScheduler::new(config.trainer.lr, PlateauConfig::from(&config.trainer));
        let store = CheckpointStore::new(
            Arc::clone(&parts.tracker),
            config.trainer.upload_after_epoch,
        );

        tracing::info!(
            levels = levels.len(),
            lambdas = ?config.lambda_list,
            active_params = model.active_parameter_count(),
            aux = trainer.aux_optimizer.is_some(),
            annealed = trainer.annealing.is_some(),
            "orchestrator ready"
        );

        let checkpoint = config.checkpoint.clone();
        let mut orchestrator = Self {
            config,
            levels,
            model,
            loss: parts.loss,
            trainer,
            scheduler,
            evaluator: RateLevelEvaluator::new(device.clone()),
            store,
            train: parts.train,
            valid: parts.valid,
            test: parts.test,
            tracker: parts.tracker,
            hook: parts.hook,
            state: TrainingState::default(),
            device,
        };
        if let Some(path) = checkpoint {
            orchestrator.resume_from(&path)?;
        }
        Ok(orchestrator)
    }

    /// Load model weights from `path` (partial match). With `continue_train`
    /// also restore optimisers, scheduler, annealing and loop position.
    pub fn resume_from(&mut self, path: &Path) -> Result<()> {
        let record = self.store.load(path, &self.device)?;
        let report = self
            .model
            .load_state_dict(&record.model_state(), false)
            .with_context(|| format!("load model weights from {}", path.display()))?;
        report.log("model");

        if !self.config.continue_train {
            tracing::info!(path = %path.display(), "initialised weights from checkpoint");
            return Ok(());
        }

        let meta = &record.meta;
        self.trainer
            .optimizer
            .load_state(&meta.optimizer, &record.tensors, OPTIMIZER_PREFIX)?;
        match (self.trainer.aux_optimizer.as_mut(), &meta.aux_optimizer) {
            (Some(aux), Some(aux_meta)) => {
                aux.load_state(aux_meta, &record.tensors, AUX_OPTIMIZER_PREFIX)?;
            }
            (Some(_), None) => {
                tracing::warn!("checkpoint has no auxiliary optimizer state; starting it fresh")
            }
            _ => {}
        }
        self.scheduler.restore(meta.lr_scheduler.clone());
        self.trainer.set_learning_rate(self.scheduler.lr());
        if let (Some(annealing), Some(saved)) = (self.trainer.annealing.as_mut(), &meta.annealing) {
            annealing.restore(saved);
        }
        self.trainer.global_step = meta.global_step;
        self.state = TrainingState {
            epoch: meta.epoch + 1,
            best_loss: meta.best_loss.unwrap_or(f64::INFINITY),
            encoder_epoch: meta.encoder_epoch,
        };
        tracing::info!(
            path = %path.display(),
            next_epoch = self.state.epoch,
            best_loss = self.state.best_loss,
            lr = self.scheduler.lr(),
            "resumed training"
        );
        Ok(())
    }

    /// Run epochs until the configured limit, then wait for uploads.
    pub fn run(&mut self) -> Result<RunSummary> {
        let start = self.state.epoch;
        let end = self.config.trainer.epochs;
        if start >= end {
            tracing::warn!(start, end, "nothing to do: epoch limit already reached");
        }
        let outcome = (start..end).try_for_each(|epoch| self.run_epoch(epoch).map(|_| ()));
        self.store.wait_for_uploads();
        outcome?;
        Ok(RunSummary {
            epochs_run: end.saturating_sub(start),
            best_loss: self.state.best_loss,
            global_step: self.trainer.global_step,
        })
    }

    pub fn run_epoch(&mut self, epoch: usize) -> Result<EpochResult> {
        let started = Instant::now();

        // 1–2. Training pass
        let train = if self.model.active_parameter_count() == 0 {
            tracing::info!(epoch, "no trainable parameters; skipping training pass");
            None
        } else {
            let summary = self
                .trainer
                .train_epoch(&self.model, &self.loss, self.train.as_ref(), &self.levels, epoch)
                .with_context(|| format!("training pass of epoch {epoch}"))?;
            Some(summary)
        };

        // 3–4. Evaluation
        let mut validation = Vec::with_capacity(self.levels.len());
        let mut test = Vec::with_capacity(self.levels.len());
        let mut valid_sum = 0.0f64;
        for level in self.levels.iter() {
            let v = self
                .evaluator
                .evaluate(&self.model, &self.loss, self.valid.as_ref(), level, epoch)
                .with_context(|| {
                    format!(
                        "validation at epoch {epoch}, rate level {} (lambda = {})",
                        level.index, level.lambda
                    )
                })?;
            let t = self
                .evaluator
                .evaluate(&self.model, &self.loss, self.test.as_ref(), level, epoch)
                .with_context(|| {
                    format!(
                        "test at epoch {epoch}, rate level {} (lambda = {})",
                        level.index, level.lambda
                    )
                })?;
            tracing::info!(
                epoch,
                level = level.index,
                lambda = level.lambda,
                valid_loss = format!("{:.4}", v.loss),
                valid_bpp = format!("{:.4}", v.bpp),
                valid_psnr = format!("{:.2}", v.psnr),
                test_loss = format!("{:.4}", t.loss),
                test_bpp = format!("{:.4}", t.bpp),
                test_psnr = format!("{:.2}", t.psnr),
                "evaluated"
            );
            valid_sum += v.loss;
            validation.push(v);
            test.push(t);
        }
        let aggregate = valid_sum / self.levels.len() as f64;

        // 5. Learning rate
        let lr_reduced = self.scheduler.step(aggregate);
        let lr = self.scheduler.lr();
        self.trainer.set_learning_rate(lr);

        // 6. Best tracking
        let is_best = aggregate < self.state.best_loss;
        self.state.best_loss = self.state.best_loss.min(aggregate);

        // 7. Quantiser curves
        if is_best && self.config.model.kind.is_annealed() {
            self.emit_curves()
                .with_context(|| format!("quantiser curves at epoch {epoch}"))?;
        }

        // 8–9. Persistence
        let paths = CheckpointPaths::resolve(&self.config.trainer.save_path, &self.config)?;
        if self.config.trainer.save {
            let record = self.build_record(epoch, aggregate, &test)?;
            self.store
                .save(&record, is_best, &paths, epoch)
                .with_context(|| format!("save checkpoint of epoch {epoch}"))?;
        }

        // 10. Tracker
        let metrics =
            self.epoch_metrics(epoch, lr, aggregate, train.as_ref(), &validation, &test);
        self.tracker.log(epoch, &metrics);

        // 11. Timing
        let duration = started.elapsed();
        tracing::info!(
            epoch,
            aggregate = format!("{aggregate:.4}"),
            best = format!("{:.4}", self.state.best_loss),
            is_best,
            lr,
            "epoch finished in {}",
            format_duration(duration)
        );

        self.state.epoch = epoch + 1;
        Ok(EpochResult {
            epoch,
            train,
            validation,
            test,
            aggregate_validation_loss: aggregate,
            is_best,
            best_loss: self.state.best_loss,
            lr,
            lr_reduced,
            duration,
        })
    }

    fn emit_curves(&mut self) -> Result<()> {
        let xs = sample_points(self.config.model.latent.extrema, CURVE_POINTS);
        let xs_t = Tensor::from_slice(&xs, xs.len(), &self.device)?;
        for level in self.levels.iter() {
            let Some(ys) = self.model.quantizer_curve(level.index, &xs_t)? else {
                continue;
            };
            let curve = QuantizerCurve {
                level: *level,
                encoder_epoch: self.state.encoder_epoch,
                xs: xs.clone(),
                ys: ys.to_vec1::<f32>()?,
            };
            self.hook.on_improvement(&curve)?;
            self.state.encoder_epoch += 1;
        }
        Ok(())
    }

    fn build_record(
        &self,
        epoch: usize,
        aggregate: f64,
        test: &[LevelMetrics],
    ) -> Result<CheckpointRecord> {
        let mut tensors: HashMap<String, Tensor> = self
            .model
            .state_dict()
            .into_iter()
            .map(|(k, t)| (format!("{MODEL_PREFIX}{k}"), t))
            .collect();
        tensors.extend(self.trainer.optimizer.state_tensors(OPTIMIZER_PREFIX));
        if let Some(aux) = &self.trainer.aux_optimizer {
            tensors.extend(aux.state_tensors(AUX_OPTIMIZER_PREFIX));
        }

        let test_losses: Vec<f64> = test.iter().map(|m| m.loss).collect();
        let final_level_test_loss = test_losses
            .last()
            .copied()
            .context("no rate levels were evaluated")?;
        let meta = RecordMeta {
            version: RECORD_VERSION,
            epoch,
            global_step: self.trainer.global_step,
            best_loss: self
                .state
                .best_loss
                .is_finite()
                .then_some(self.state.best_loss),
            encoder_epoch: self.state.encoder_epoch,
            final_level_test_loss,
            test_losses,
            aggregate_validation_loss: aggregate,
            optimizer: self.trainer.optimizer.meta(),
            aux_optimizer: self.trainer.aux_optimizer.as_ref().map(Adam::meta),
            lr_scheduler: self.scheduler.state(),
            annealing: self.trainer.annealing.as_ref().map(AnnealingController::state),
            config: self.config.clone(),
        };
        Ok(CheckpointRecord { meta, tensors })
    }

    fn epoch_metrics(
        &self,
        epoch: usize,
        lr: f64,
        aggregate: f64,
        train: Option<&EpochTrainSummary>,
        validation: &[LevelMetrics],
        test: &[LevelMetrics],
    ) -> Vec<(String, f64)> {
        let mut metrics = vec![
            ("train/epoch".to_string(), epoch as f64),
            ("train/learning_rate".to_string(), lr),
            ("valid/aggregate_loss".to_string(), aggregate),
            ("valid/best_loss".to_string(), self.state.best_loss),
        ];
        if let Some(t) = train {
            metrics.push(("train/loss".to_string(), t.mean_loss));
            metrics.push(("train/bpp".to_string(), t.mean_bpp));
            metrics.push(("train/mse".to_string(), t.mean_mse));
            metrics.push(("train/steps".to_string(), t.steps as f64));
        }
        if let Some(a) = &self.trainer.annealing {
            metrics.push(("train/hardness".to_string(), a.hardness()));
        }
        for (split, rows) in [("valid", validation), ("test", test)] {
            for (level, m) in self.levels.iter().zip(rows) {
                let j = level.index;
                metrics.push((format!("{split}/level{j}/loss"), m.loss));
                metrics.push((format!("{split}/level{j}/bpp"), m.bpp));
                metrics.push((format!("{split}/level{j}/mse"), m.mse));
                metrics.push((format!("{split}/level{j}/psnr"), m.psnr));
            }
        }
        metrics
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn scheduler(&self) -> &PlateauScheduler {
        &self.scheduler
    }

    pub fn levels(&self) -> &RateLevels {
        &self.levels
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }
}

/// `"{h} hours {m} mins {s} seconds"`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!(
        "{} hours {} mins {} seconds",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use stanh_common::ModelKind;

    use stanh_core::ReferenceCodec;

    use crate::factory::build_model;
    use crate::loss::MseRateDistortion;
    use crate::testing::{
        run_config, FailingProvider, InMemoryTracker, ProbeModel, RecordingHook, ScriptedLoss,
        ScriptedProvider, StaticProvider,
    };
    use crate::visualize::NoopHook;

    type Probe<L> = TrainingOrchestrator<ProbeModel, L>;

    struct Harness<L> {
        orchestrator: Probe<L>,
        tracker: Arc<InMemoryTracker>,
    }

    fn scripted(
        config: RunConfig,
        offsets: Vec<f64>,
        valid: Vec<f32>,
        hook: Box<dyn VisualizationHook>,
    ) -> Harness<ScriptedLoss> {
        let tracker = Arc::new(InMemoryTracker::default());
        let parts = Collaborators {
            model: ProbeModel::new(1.0),
            loss: ScriptedLoss { offsets },
            annealing: None,
            train: Box::new(StaticProvider::new(vec![1.0], 4)),
            valid: Box::new(ScriptedProvider::new(valid)),
            test: Box::new(ScriptedProvider::new(vec![0.5])),
            tracker: tracker.clone(),
            hook,
        };
        Harness {
            orchestrator: TrainingOrchestrator::new(config, parts, Device::Cpu).unwrap(),
            tracker,
        }
    }

    fn probe(config: RunConfig, init: f32) -> Probe<MseRateDistortion> {
        let parts = Collaborators {
            model: ProbeModel::new(init),
            loss: MseRateDistortion,
            annealing: None,
            train: Box::new(StaticProvider::new(vec![0.5, 0.7], 4)),
            valid: Box::new(ScriptedProvider::new(vec![0.6])),
            test: Box::new(ScriptedProvider::new(vec![0.4])),
            tracker: Arc::new(InMemoryTracker::default()),
            hook: Box::new(RecordingHook::default()),
        };
        TrainingOrchestrator::new(config, parts, Device::Cpu).unwrap()
    }

    #[test]
    fn two_level_scenario_writes_best_tiers_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(dir.path(), 2);
        let mut h = scripted(
            config.clone(),
            vec![0.2, -0.2],
            vec![1.0, 1.1],
            Box::new(RecordingHook::default()),
        );
        let paths = CheckpointPaths::resolve(dir.path(), &config).unwrap();

        let first = h.orchestrator.run_epoch(0).unwrap();
        assert!((first.validation[0].loss - 1.2).abs() < 1e-6);
        assert!((first.validation[1].loss - 0.8).abs() < 1e-6);
        assert!((first.aggregate_validation_loss - 1.0).abs() < 1e-6);
        assert!(first.is_best);
        let best = std::fs::read(&paths.best).unwrap();
        let best_of_run = std::fs::read(&paths.best_of_run).unwrap();
        assert_eq!(best, std::fs::read(&paths.latest).unwrap());
        assert_eq!(best, best_of_run);

        let second = h.orchestrator.run_epoch(1).unwrap();
        assert!((second.validation[0].loss - 1.3).abs() < 1e-6);
        assert!((second.validation[1].loss - 0.9).abs() < 1e-6);
        assert!((second.aggregate_validation_loss - 1.1).abs() < 1e-6);
        assert!(!second.is_best);
        assert_eq!(second.best_loss, first.aggregate_validation_loss);
        assert_eq!(std::fs::read(&paths.best).unwrap(), best);
        assert_eq!(std::fs::read(&paths.best_of_run).unwrap(), best_of_run);

        let latest = CheckpointRecord::load(&paths.latest, &Device::Cpu).unwrap();
        assert_eq!(latest.meta.epoch, 1);
        let saved_best = latest.meta.best_loss.unwrap();
        assert!((saved_best - first.aggregate_validation_loss).abs() < 1e-12);
        // Test split holds 0.5 everywhere; last level's offset is -0.2.
        assert!((latest.meta.final_level_test_loss - 0.3).abs() < 1e-6);
        assert!((second.final_level_test_loss() - 0.3).abs() < 1e-6);
        assert_eq!(latest.meta.test_losses.len(), 2);
        assert!((latest.meta.test_losses[0] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn frozen_model_skips_training_but_still_evaluates_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), 2);
        config.trainer.freeze = true;
        config.trainer.epochs = 3;

        let train = StaticProvider::new(vec![1.0], 4);
        let train_calls = train.counter();
        let tracker = Arc::new(InMemoryTracker::default());
        let parts = Collaborators {
            model: ProbeModel::new(1.0),
            loss: ScriptedLoss {
                offsets: vec![0.0, 0.0],
            },
            annealing: None,
            train: Box::new(train),
            valid: Box::new(ScriptedProvider::new(vec![1.0, 0.9, 0.8])),
            test: Box::new(ScriptedProvider::new(vec![0.5])),
            tracker: tracker.clone(),
            hook: Box::new(RecordingHook::default()),
        };
        let mut orchestrator = TrainingOrchestrator::new(config.clone(), parts, Device::Cpu).unwrap();
        assert!(orchestrator.trainer().aux_optimizer.is_none());

        let mut results = Vec::new();
        for epoch in 0..3 {
            results.push(orchestrator.run_epoch(epoch).unwrap());
            let paths = CheckpointPaths::resolve(dir.path(), &config).unwrap();
            let latest = CheckpointRecord::load(&paths.latest, &Device::Cpu).unwrap();
            assert_eq!(latest.meta.epoch, epoch);
        }
        assert!(results.iter().all(|r| !r.trained()));
        assert!(results.iter().all(|r| r.validation.len() == 2 && r.test.len() == 2));
        assert_eq!(train_calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.trainer().global_step, 0);
        assert_eq!(tracker.logs().len(), 3);
    }

    #[test]
    fn aggregate_is_exact_mean_and_best_never_increases() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), 3);
        config.trainer.save = false;
        let mut h = scripted(
            config,
            vec![0.3, 0.0, -0.1],
            vec![1.0, 0.9, 1.3, 0.8, 0.85],
            Box::new(RecordingHook::default()),
        );

        let mut running_min = f64::INFINITY;
        let mut previous_best = f64::INFINITY;
        for epoch in 0..5 {
            let r = h.orchestrator.run_epoch(epoch).unwrap();
            let mean = r.validation.iter().map(|m| m.loss).sum::<f64>() / 3.0;
            assert_eq!(r.aggregate_validation_loss, mean);
            assert_eq!(r.is_best, r.aggregate_validation_loss < running_min);
            running_min = running_min.min(r.aggregate_validation_loss);
            assert_eq!(r.best_loss, running_min);
            assert!(r.best_loss <= previous_best);
            previous_best = r.best_loss;
        }
        assert_eq!(h.orchestrator.state().epoch, 5);
    }

    #[test]
    fn curves_are_emitted_per_level_only_for_annealed_models() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), 2);
        config.model.kind = ModelKind::Stanh;
        config.trainer.save = false;
        let hook = RecordingHook::default();
        let calls = hook.calls.clone();
        let mut h = scripted(config.clone(), vec![0.0, 0.0], vec![1.0, 1.1, 0.9], Box::new(hook));
        for epoch in 0..3 {
            h.orchestrator.run_epoch(epoch).unwrap();
        }
        assert_eq!(*calls.lock(), vec![(0, 0), (1, 1), (0, 2), (1, 3)]);
        assert_eq!(h.orchestrator.state().encoder_epoch, 4);

        config.model.kind = ModelKind::Gain;
        let hook = RecordingHook::default();
        let calls = hook.calls.clone();
        let mut h = scripted(config, vec![0.0, 0.0], vec![1.0, 0.9], Box::new(hook));
        for epoch in 0..2 {
            h.orchestrator.run_epoch(epoch).unwrap();
        }
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn plateau_cuts_reach_optimizer_and_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), 1);
        config.trainer.patience = 0;
        config.trainer.save = false;
        let lr = config.trainer.lr;
        let mut h = scripted(
            config,
            vec![0.0],
            vec![1.0, 1.0, 1.0],
            Box::new(RecordingHook::default()),
        );
        let reduced: Vec<bool> = (0..3)
            .map(|e| h.orchestrator.run_epoch(e).unwrap().lr_reduced)
            .collect();
        assert_eq!(reduced, vec![false, true, true]);
        assert_eq!(
            h.tracker.series("train/learning_rate"),
            vec![lr, lr * 0.5, lr * 0.25]
        );
        assert_eq!(h.tracker.series("train/epoch"), vec![0.0, 1.0, 2.0]);
        assert_eq!(h.orchestrator.trainer().optimizer.learning_rate(), lr * 0.25);
        assert_eq!(h.tracker.series("valid/level0/loss").len(), 3);
        // Training metrics: one epoch mean per record, one step record per batch.
        let epoch_losses = h.tracker.series("train/loss");
        assert_eq!(epoch_losses.len(), 3);
        assert!(epoch_losses.iter().all(|v| v.is_finite()));
        assert_eq!(h.tracker.series("train/bpp").len(), 3);
        assert_eq!(h.tracker.series("train/mse").len(), 3);
        let steps = h.tracker.series("train/steps");
        assert_eq!(steps.len(), 3);
        let total_steps = steps.iter().sum::<f64>() as usize;
        assert_eq!(h.tracker.series("step/loss").len(), total_steps);
        assert_eq!(total_steps, h.orchestrator.trainer().global_step);
    }

    #[test]
    fn resumed_run_replays_the_uninterrupted_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path().join("straight").as_path(), 1);
        config.trainer.epochs = 4;
        let mut straight = probe(config.clone(), 0.2);
        let expected: Vec<f64> = (0..4)
            .map(|e| straight.run_epoch(e).unwrap().best_loss)
            .collect();

        let split_dir = dir.path().join("split");
        let mut first = run_config(&split_dir, 1);
        first.trainer.epochs = 2;
        let mut part_one = probe(first.clone(), 0.2);
        let mut resumed: Vec<f64> = (0..2)
            .map(|e| part_one.run_epoch(e).unwrap().best_loss)
            .collect();
        let latest = CheckpointPaths::resolve(&split_dir, &first).unwrap().latest;

        let mut second = first.clone();
        second.trainer.epochs = 4;
        second.checkpoint = Some(latest);
        second.continue_train = true;
        let mut part_two = probe(second, 0.9);
        assert_eq!(part_two.state().epoch, 2);
        assert_eq!(part_two.trainer().global_step, part_one.trainer().global_step);
        assert!((part_two.state().best_loss - resumed[1]).abs() <= 1e-12);

        for e in 2..4 {
            resumed.push(part_two.run_epoch(e).unwrap().best_loss);
        }
        for (a, b) in expected.iter().zip(&resumed) {
            assert!((a - b).abs() <= 1e-9 * a.abs().max(1.0), "{expected:?} vs {resumed:?}");
        }
        assert!((straight.model().scale() - part_two.model().scale()).abs() < 1e-6);
        assert_eq!(
            straight.trainer().optimizer.meta().step,
            part_two.trainer().optimizer.meta().step
        );
    }

    type Annealed = TrainingOrchestrator<ReferenceCodec, MseRateDistortion>;

    fn annealed_config(dir: &Path) -> RunConfig {
        let mut config = run_config(dir, 2);
        config.model.kind = ModelKind::Stanh;
        config.model.n = 4;
        config.model.m = 6;
        config
    }

    /// STanH codec starting from `weights`, so separate runs share an init.
    fn annealed(config: RunConfig, weights: &HashMap<String, Tensor>) -> Annealed {
        let levels = config.rate_levels().unwrap();
        let mut bundle = build_model(&config.model, &levels, &Device::Cpu).unwrap();
        bundle.model.load_state_dict(weights, true).unwrap();
        let parts = Collaborators {
            model: bundle.model,
            loss: MseRateDistortion,
            annealing: bundle.annealing,
            train: Box::new(StaticProvider::new(vec![0.3, 0.6], 8)),
            valid: Box::new(StaticProvider::new(vec![0.5], 8)),
            test: Box::new(StaticProvider::new(vec![0.4], 8)),
            tracker: Arc::new(InMemoryTracker::default()),
            hook: Box::new(NoopHook),
        };
        TrainingOrchestrator::new(config, parts, Device::Cpu).unwrap()
    }

    #[test]
    fn resumed_annealed_run_restores_hardness_and_aux_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let straight_config = annealed_config(&dir.path().join("straight"));
        let levels = straight_config.rate_levels().unwrap();
        let init: HashMap<String, Tensor> = build_model(&straight_config.model, &levels, &Device::Cpu)
            .unwrap()
            .model
            .state_dict()
            .into_iter()
            .map(|(k, t)| (k, t.copy().unwrap()))
            .collect();

        let mut config = straight_config.clone();
        config.trainer.epochs = 4;
        let mut straight = annealed(config, &init);
        let expected: Vec<f64> = (0..4)
            .map(|e| straight.run_epoch(e).unwrap().aggregate_validation_loss)
            .collect();

        let split_dir = dir.path().join("split");
        let first = annealed_config(&split_dir);
        let mut part_one = annealed(first.clone(), &init);
        let mut resumed: Vec<f64> = (0..2)
            .map(|e| part_one.run_epoch(e).unwrap().aggregate_validation_loss)
            .collect();
        let hardness_at_save = part_one.trainer().annealing.as_ref().unwrap().hardness();
        let latest = CheckpointPaths::resolve(&split_dir, &first).unwrap().latest;

        let mut second = first.clone();
        second.trainer.epochs = 4;
        second.checkpoint = Some(latest);
        second.continue_train = true;
        let mut part_two = annealed(second, &init);
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-12 * a.abs().max(1.0);
        let annealing = part_two.trainer().annealing.as_ref().unwrap();
        assert!(hardness_at_save > 0.0);
        assert!(close(annealing.hardness(), hardness_at_save));
        assert!(part_two
            .model()
            .hardness_cells()
            .iter()
            .all(|c| close(c.get(), hardness_at_save)));
        let aux_step = |o: &Annealed| o.trainer().aux_optimizer.as_ref().unwrap().meta().step;
        assert_eq!(aux_step(&part_two), aux_step(&part_one));
        assert!(aux_step(&part_two) > 0);

        for e in 2..4 {
            resumed.push(part_two.run_epoch(e).unwrap().aggregate_validation_loss);
        }
        for (a, b) in expected.iter().zip(&resumed) {
            assert!((a - b).abs() <= 1e-6 * a.abs().max(1.0), "{expected:?} vs {resumed:?}");
        }
        assert!(close(
            straight.trainer().annealing.as_ref().unwrap().hardness(),
            part_two.trainer().annealing.as_ref().unwrap().hardness()
        ));
        assert_eq!(aux_step(&straight), aux_step(&part_two));
    }

    #[test]
    fn checkpoint_without_continue_only_loads_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = run_config(dir.path(), 1);
        first.trainer.epochs = 1;
        let mut trained = probe(first.clone(), 0.2);
        trained.run().unwrap();
        let trained_scale = trained.model().scale();
        assert!(trained_scale != 0.2);

        let mut second = first.clone();
        second.trainer.epochs = 3;
        second.checkpoint = Some(CheckpointPaths::resolve(dir.path(), &first).unwrap().latest);
        let fresh = probe(second, 0.9);
        assert_eq!(fresh.model().scale(), trained_scale);
        assert_eq!(fresh.state(), &TrainingState::default());
        assert_eq!(fresh.trainer().global_step, 0);
        assert_eq!(fresh.trainer().optimizer.meta().step, 0);
        // Pretrained runs go to their own folder.
        assert!(fresh.config().run_folder_name().starts_with("pret_"));
    }

    #[test]
    fn evaluation_failure_names_epoch_and_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(dir.path(), 2);
        let parts = Collaborators {
            model: ProbeModel::new(1.0),
            loss: MseRateDistortion,
            annealing: None,
            train: Box::new(StaticProvider::new(vec![0.5], 4)),
            valid: Box::new(FailingProvider),
            test: Box::new(ScriptedProvider::new(vec![0.5])),
            tracker: Arc::new(InMemoryTracker::default()),
            hook: Box::new(RecordingHook::default()),
        };
        let mut orchestrator = TrainingOrchestrator::new(config.clone(), parts, Device::Cpu).unwrap();
        let err = orchestrator.run_epoch(0).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("epoch 0"), "{msg}");
        assert!(msg.contains("rate level 0"), "{msg}");
        assert!(msg.contains("corrupt image"), "{msg}");
        // Nothing was persisted for the failed epoch.
        let paths = CheckpointPaths::resolve(dir.path(), &config).unwrap();
        assert!(!paths.latest.exists());
    }

    #[test]
    fn disabled_saving_writes_no_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), 1);
        config.trainer.save = false;
        config.trainer.epochs = 1;
        let mut orchestrator = probe(config.clone(), 0.5);
        orchestrator.run().unwrap();

        let paths = CheckpointPaths::resolve(dir.path(), &config).unwrap();
        assert!(paths.dir.is_dir());
        assert!(!paths.latest.exists());
        assert!(!paths.best.exists());
        assert!(!paths.best_of_run.exists());
    }

    #[test]
    fn continue_train_needs_a_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(dir.path(), 1);
        config.continue_train = true;
        let parts = Collaborators {
            model: ProbeModel::new(1.0),
            loss: MseRateDistortion,
            annealing: None,
            train: Box::new(StaticProvider::new(vec![0.5], 4)),
            valid: Box::new(ScriptedProvider::new(vec![0.5])),
            test: Box::new(ScriptedProvider::new(vec![0.5])),
            tracker: Arc::new(InMemoryTracker::default()),
            hook: Box::new(RecordingHook::default()),
        };
        assert!(TrainingOrchestrator::new(config, parts, Device::Cpu).is_err());
    }

    #[test]
    fn duration_is_spelled_out() {
        assert_eq!(
            format_duration(Duration::from_secs(3723)),
            "1 hours 2 mins 3 seconds"
        );
        assert_eq!(format_duration(Duration::from_millis(999)), "0 hours 0 mins 0 seconds");
    }
}
