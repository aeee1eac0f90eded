//! Learning-rate plateau schedule and quantisation annealing schedule.

use serde::{Deserialize, Serialize};

use stanh_common::{AnnealingStrategy, LatentPolicy, TrainerConfig};
use stanh_core::HardnessCell;

/// Smallest LR change that counts as a reduction.
const LR_EPS: f64 = 1e-8;

// ── Plateau scheduler ───────────────────────────────────────────────────────

/// Knobs of the reduce-on-plateau rule (mode: min).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlateauConfig {
    pub factor: f64,
    pub patience: usize,
    /// Relative margin: a value improves on `best` only if `< best · (1 − threshold)`.
    pub threshold: f64,
    pub cooldown: usize,
    pub min_lr: f64,
}

impl From<&TrainerConfig> for PlateauConfig {
    fn from(c: &TrainerConfig) -> Self {
        Self {
            factor: c.factor,
            patience: c.patience,
            threshold: c.threshold,
            cooldown: c.cooldown,
            min_lr: c.min_lr,
        }
    }
}

/// Everything needed to resume the scheduler. `best = None` means no value
/// has been observed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateauState {
    pub lr: f64,
    #[serde(with = "crate::float_serde::optional")]
    pub best: Option<f64>,
    pub num_bad_epochs: usize,
    pub cooldown_counter: usize,
    pub num_reductions: usize,
}

/// Multiplies the learning rate by `factor` once the monitored value has
/// failed to improve for more than `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    state: PlateauState,
}

impl PlateauScheduler {
    pub fn new(lr: f64, config: PlateauConfig) -> Self {
        Self {
            config,
            state: PlateauState {
                lr,
                best: None,
                num_bad_epochs: 0,
                cooldown_counter: 0,
                num_reductions: 0,
            },
        }
    }

    pub fn lr(&self) -> f64 {
        self.state.lr
    }

    fn is_better(&self, value: f64) -> bool {
        match self.state.best {
            None => !value.is_nan(),
            Some(best) => value < best * (1.0 - self.config.threshold),
        }
    }

    /// Feed one epoch's monitored value. Returns true when the LR was cut.
    pub fn step(&mut self, value: f64) -> bool {
        if self.is_better(value) {
            self.state.best = Some(value);
            self.state.num_bad_epochs = 0;
        } else {
            self.state.num_bad_epochs += 1;
        }

        if self.state.cooldown_counter > 0 {
            self.state.cooldown_counter -= 1;
            self.state.num_bad_epochs = 0;
        }

        if self.state.num_bad_epochs > self.config.patience {
            self.state.num_bad_epochs = 0;
            self.state.cooldown_counter = self.config.cooldown;
            let new_lr = (self.state.lr * self.config.factor).max(self.config.min_lr);
            if self.state.lr - new_lr > LR_EPS {
                tracing::info!(old_lr = self.state.lr, new_lr, "plateau: reducing learning rate");
                self.state.lr = new_lr;
                self.state.num_reductions += 1;
                return true;
            }
        }
        false
    }

    pub fn state(&self) -> PlateauState {
        self.state.clone()
    }

    pub fn restore(&mut self, state: PlateauState) {
        self.state = state;
    }
}

// ── Annealing controller ────────────────────────────────────────────────────

/// Resumable position of the annealing schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnealingState {
    pub step: usize,
    pub hardness: f64,
}

/// Quantisation annealing: drives the STanH slope of every rate-aware
/// quantiser from `beta_init` towards `beta_max`.
///
/// The controller writes one [`HardnessCell`] per sub-module; the model reads
/// the same cells. Only the training pass calls [`advance`](Self::advance).
pub struct AnnealingController {
    cells: Vec<HardnessCell>,
    policy: LatentPolicy,
    step: usize,
    hardness: f64,
}

impl AnnealingController {
    pub fn new(cells: Vec<HardnessCell>, policy: LatentPolicy) -> Self {
        let hardness = policy.beta_init;
        for cell in &cells {
            cell.set(hardness);
        }
        Self {
            cells,
            policy,
            step: 0,
            hardness,
        }
    }

    /// Slope the schedule prescribes at `step`, before clamping to history.
    pub fn hardness_at(&self, step: usize) -> f64 {
        let p = &self.policy;
        let beta = match p.strategy {
            AnnealingStrategy::Constant => p.beta_init,
            AnnealingStrategy::Linear { increment } => p.beta_init + increment * step as f64,
            AnnealingStrategy::Geometric { factor } => {
                p.beta_init * factor.powi(step.min(i32::MAX as usize) as i32)
            }
        };
        beta.min(p.beta_max)
    }

    /// Move the schedule to `step` and publish the new slope. Never softens.
    pub fn advance(&mut self, step: usize) -> f64 {
        let beta = self.hardness_at(step).max(self.hardness);
        self.step = step;
        self.hardness = beta;
        for cell in &self.cells {
            cell.set(beta);
        }
        beta
    }

    pub fn hardness(&self) -> f64 {
        self.hardness
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn state(&self) -> AnnealingState {
        AnnealingState {
            step: self.step,
            hardness: self.hardness,
        }
    }

    pub fn restore(&mut self, state: &AnnealingState) {
        self.step = state.step;
        self.hardness = state.hardness;
        for cell in &self.cells {
            cell.set(state.hardness);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
