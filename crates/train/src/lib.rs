//! # stanh-train — The Orchestration Engine
//!
//! Everything that turns a codec into a trained multi-rate model:
//!
//! * **[`TrainingOrchestrator`]** — the epoch loop: train, evaluate every
//!   rate level, adapt the LR, track the best model, persist checkpoints.
//! * **[`Trainer`]** — one multi-rate training pass (forward per level,
//!   summed loss, clipping, Adam, auxiliary step, annealing advance).
//! * **[`PlateauScheduler`]** — reduce-on-plateau learning rate.
//! * **[`AnnealingController`]** — soft→hard quantisation schedule.
//! * **[`CheckpointStore`]** — latest / best / best-of-run safetensors records.
//! * **[`ExperimentTracker`]** — explicit metrics + artefact handle.

pub mod checkpoint;
pub mod evaluator;
pub mod factory;
pub mod float_serde;
pub mod loss;
pub mod optimizer;
pub mod orchestrator;
pub mod scheduler;
pub mod tracking;
pub mod trainer;
pub mod visualize;

#[cfg(test)]
mod testing;

pub use checkpoint::{CheckpointPaths, CheckpointRecord, CheckpointStore, RecordMeta};
pub use evaluator::{LevelMetrics, RateLevelEvaluator};
pub use factory::{build_model, ModelBundle};
pub use loss::{psnr, LossScalars, LossTerms, MseRateDistortion, RateDistortionLoss};
pub use optimizer::{Adam, AdamMeta};
pub use orchestrator::{
    format_duration, Collaborators, EpochResult, RunSummary, TrainingOrchestrator, TrainingState,
};
pub use scheduler::{AnnealingController, AnnealingState, PlateauConfig, PlateauScheduler, PlateauState};
pub use tracking::{ExperimentTracker, LocalTracker, NullTracker};
pub use trainer::{EpochTrainSummary, Trainer, TrainerOptions};
pub use visualize::{sample_points, NoopHook, QuantizerCurve, SosCurveWriter, VisualizationHook};
