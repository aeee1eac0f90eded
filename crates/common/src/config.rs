//! Run configuration for multi-rate STanH codec training.
//!
//! Split the same way the CLI thinks about it:
//!
//! * **[`ModelConfig`]** — architecture knobs, serialised as JSON next to the
//!   checkpoints. Every field has a default so `{}` is a valid file.
//! * **[`TrainerConfig`]** — optimisation and persistence knobs (CLI flags).
//! * **[`DataConfig`]** — dataset locations and sampling limits.
//! * **[`RunConfig`]** — all of the above plus the λ list; stored inside every
//!   checkpoint so a run can be reproduced from its artefacts alone.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Spatial dimensions must be divisible by this (two 2× space-to-depth stages).
pub const SPATIAL_ALIGN: usize = 4;

// ── Model family ────────────────────────────────────────────────────────────

/// Which family of codec to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Single-rate backbone; every λ shares the same latent path.
    Base,
    /// Per-level channel gains, uniform-noise proxy during training.
    Gain,
    /// Per-level gains and an annealed STanH quantiser per level.
    Stanh,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Base => "base",
            ModelKind::Gain => "gain",
            ModelKind::Stanh => "stanh",
        }
    }

    /// True for families whose quantiser hardens over training.
    pub fn is_annealed(&self) -> bool {
        matches!(self, ModelKind::Stanh)
    }

    /// True for families with one set of gains per rate level.
    pub fn has_level_gains(&self) -> bool {
        !matches!(self, ModelKind::Base)
    }
}

impl std::str::FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "base" => Ok(Self::Base),
            "gain" => Ok(Self::Gain),
            "stanh" => Ok(Self::Stanh),
            other => bail!("unknown model kind '{other}' (expected base, gain or stanh)"),
        }
    }
}

// ── Latent policy ───────────────────────────────────────────────────────────

/// How the STanH hardness β evolves with the global training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnnealingStrategy {
    /// β stays at `beta_init`.
    Constant,
    /// β = beta_init + increment · step.
    Linear { increment: f64 },
    /// β = beta_init · factor^step.
    Geometric { factor: f64 },
}

/// Shape and schedule of the soft quantiser applied to the latent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentPolicy {
    /// Half-width L of the quantiser range; output lies in \[-L, L\].
    #[serde(default = "default_extrema")]
    pub extrema: usize,
    #[serde(default = "default_beta_init")]
    pub beta_init: f64,
    #[serde(default = "default_beta_max")]
    pub beta_max: f64,
    #[serde(default = "default_strategy")]
    pub strategy: AnnealingStrategy,
}

impl Default for LatentPolicy {
    fn default() -> Self {
        Self {
            extrema: default_extrema(),
            beta_init: default_beta_init(),
            beta_max: default_beta_max(),
            strategy: default_strategy(),
        }
    }
}

impl LatentPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.extrema == 0 {
            bail!("latent extrema must be at least 1");
        }
        if !(self.beta_init.is_finite() && self.beta_init > 0.0) {
            bail!("beta_init must be positive, got {}", self.beta_init);
        }
        if !(self.beta_max >= self.beta_init) {
            bail!(
                "beta_max ({}) must not be below beta_init ({})",
                self.beta_max,
                self.beta_init
            );
        }
        match self.strategy {
            AnnealingStrategy::Constant => {}
            AnnealingStrategy::Linear { increment } if increment < 0.0 => {
                bail!("linear annealing increment must be non-negative, got {increment}")
            }
            AnnealingStrategy::Geometric { factor } if factor < 1.0 => {
                bail!("geometric annealing factor must be >= 1, got {factor}")
            }
            _ => {}
        }
        Ok(())
    }
}

// ── Model config ────────────────────────────────────────────────────────────

/// Architecture of the codec. Backwards-compatible: missing fields default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_kind")]
    pub kind: ModelKind,
    /// Hidden channel count of the transforms (also part of the run folder name).
    #[serde(default = "default_n")]
    pub n: usize,
    /// Latent channel count.
    #[serde(default = "default_m")]
    pub m: usize,
    /// Symmetric quantiser range \[-L, L\]; otherwise \[-L, L-1\].
    #[serde(default = "default_true")]
    pub symmetry: bool,
    /// Gaussian entropy model instead of the logistic one.
    #[serde(default)]
    pub gauss_gp: bool,
    #[serde(default)]
    pub latent: LatentPolicy,
    /// Initial per-channel scale of the entropy model.
    #[serde(default = "default_entropy_init_scale")]
    pub entropy_init_scale: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            n: default_n(),
            m: default_m(),
            symmetry: true,
            gauss_gp: false,
            latent: LatentPolicy::default(),
            entropy_init_scale: default_entropy_init_scale(),
        }
    }
}

impl ModelConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parse model config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n == 0 || self.m == 0 {
            bail!("channel counts must be positive (n = {}, m = {})", self.n, self.m);
        }
        if !(self.entropy_init_scale.is_finite() && self.entropy_init_scale > 0.0) {
            bail!("entropy_init_scale must be positive");
        }
        self.latent.validate()
    }
}

// ── Trainer config ──────────────────────────────────────────────────────────

/// Optimisation, schedule and persistence knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub lr: f64,
    pub aux_lr: f64,
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub patch_size: usize,
    /// Global gradient-norm clip for the main optimiser (0 disables).
    pub clip_max_norm: f64,
    /// Plateau scheduler: epochs without improvement tolerated before a cut.
    pub patience: usize,
    /// Plateau scheduler: multiplicative LR cut, in (0, 1).
    pub factor: f64,
    /// Plateau scheduler: relative improvement required to reset patience.
    pub threshold: f64,
    pub cooldown: usize,
    pub min_lr: f64,
    pub num_workers: usize,
    pub seed: u64,
    pub save: bool,
    pub save_path: PathBuf,
    /// Best-of-run checkpoints are uploaded only after this epoch.
    pub upload_after_epoch: usize,
    /// Freeze the backbone; only per-level parameters stay trainable.
    pub freeze: bool,
    pub log_every: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 200,
            lr: 1e-4,
            aux_lr: 1e-3,
            batch_size: 16,
            test_batch_size: 64,
            patch_size: 256,
            clip_max_norm: 1.0,
            patience: 4,
            factor: 0.5,
            threshold: 0.0,
            cooldown: 0,
            min_lr: 0.0,
            num_workers: 4,
            seed: 42,
            save: true,
            save_path: PathBuf::from("checkpoints"),
            upload_after_epoch: 150,
            freeze: false,
            log_every: 100,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.lr.is_finite() && self.lr > 0.0) {
            bail!("learning rate must be positive, got {}", self.lr);
        }
        if !(self.aux_lr.is_finite() && self.aux_lr > 0.0) {
            bail!("auxiliary learning rate must be positive, got {}", self.aux_lr);
        }
        if !(self.factor > 0.0 && self.factor < 1.0) {
            bail!("plateau factor must be in (0, 1), got {}", self.factor);
        }
        if self.threshold < 0.0 {
            bail!("plateau threshold must be non-negative");
        }
        if self.batch_size == 0 || self.test_batch_size == 0 {
            bail!("batch sizes must be positive");
        }
        if self.patch_size == 0 || self.patch_size % SPATIAL_ALIGN != 0 {
            bail!(
                "patch size {} must be a positive multiple of {SPATIAL_ALIGN}",
                self.patch_size
            );
        }
        Ok(())
    }
}

// ── Data config ─────────────────────────────────────────────────────────────

/// Where the image splits live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root with `train/` and `test/` sub-directories (train and validation).
    pub dataset: PathBuf,
    /// Held-out full-resolution test images (e.g. Kodak).
    pub test_dataset: PathBuf,
    /// Cap on training images (0 = all).
    #[serde(default)]
    pub num_images: usize,
    /// Cap on validation images (0 = all).
    #[serde(default)]
    pub num_images_val: usize,
}

impl DataConfig {
    pub fn train_dir(&self) -> PathBuf {
        self.dataset.join("train")
    }

    pub fn valid_dir(&self) -> PathBuf {
        self.dataset.join("test")
    }

    /// Fail fast on missing dataset directories.
    pub fn check_paths(&self) -> anyhow::Result<()> {
        for dir in [self.train_dir(), self.valid_dir(), self.test_dataset.clone()] {
            if !dir.is_dir() {
                bail!("dataset directory not found: {}", dir.display());
            }
        }
        Ok(())
    }
}

// ── Rate levels ─────────────────────────────────────────────────────────────

/// One operating point on the rate–distortion curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLevel {
    pub index: usize,
    pub lambda: f64,
}

/// Validated, ordered, non-empty list of rate levels. Fixed for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLevels(Vec<RateLevel>);

impl RateLevels {
    pub fn from_lambdas(lambdas: &[f64]) -> anyhow::Result<Self> {
        if lambdas.is_empty() {
            bail!("lambda list must contain at least one rate level");
        }
        let mut levels = Vec::with_capacity(lambdas.len());
        for (index, &lambda) in lambdas.iter().enumerate() {
            if !(lambda.is_finite() && lambda > 0.0) {
                bail!("lambda #{index} must be a positive finite number, got {lambda}");
            }
            levels.push(RateLevel { index, lambda });
        }
        Ok(Self(levels))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed value; present for clippy's sake.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RateLevel> {
        self.0.iter()
    }

    pub fn get(&self, index: usize) -> Option<&RateLevel> {
        self.0.get(index)
    }
}

/// Parse `"0.0018,0.0067"` into λ values.
pub fn parse_lambda_list(s: &str) -> anyhow::Result<Vec<f64>> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<f64>()
                .with_context(|| format!("malformed lambda '{t}'"))
        })
        .collect()
}

// ── Run config ──────────────────────────────────────────────────────────────

/// Everything needed to reproduce a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub run_name: String,
    pub model: ModelConfig,
    pub trainer: TrainerConfig,
    pub data: DataConfig,
    pub lambda_list: Vec<f64>,
    /// Checkpoint used for initialisation or resumption, if any.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    /// Restore optimiser, scheduler and epoch from `checkpoint`, not just weights.
    #[serde(default)]
    pub continue_train: bool,
}

impl RunConfig {
    pub fn rate_levels(&self) -> anyhow::Result<RateLevels> {
        RateLevels::from_lambdas(&self.lambda_list)
    }

    /// Checks that need no filesystem access.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.rate_levels()?;
        self.model.validate().context("invalid model config")?;
        self.trainer.validate().context("invalid trainer config")?;
        if self.continue_train && self.checkpoint.is_none() {
            bail!("--continue-train requires --checkpoint");
        }
        Ok(())
    }

    /// `{pret|zero}_{kind}_{N}_{symmetry}_{gauss_gp}`: deterministic in the
    /// initialisation source and architecture switches.
    pub fn run_folder_name(&self) -> String {
        let source = if self.checkpoint.is_some() { "pret" } else { "zero" };
        format!(
            "{source}_{}_{}_{}_{}",
            self.model.kind.as_str(),
            self.model.n,
            self.model.symmetry,
            self.model.gauss_gp
        )
    }

    /// Prefix for per-run checkpoint files.
    pub fn file_stem(&self) -> String {
        if self.run_name.is_empty() {
            self.model.kind.as_str().to_string()
        } else {
            self.run_name.clone()
        }
    }
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_kind() -> ModelKind {
    ModelKind::Stanh
}
fn default_n() -> usize {
    64
}
fn default_m() -> usize {
    96
}
fn default_true() -> bool {
    true
}
fn default_extrema() -> usize {
    10
}
fn default_beta_init() -> f64 {
    1.0
}
fn default_beta_max() -> f64 {
    1000.0
}
fn default_strategy() -> AnnealingStrategy {
    AnnealingStrategy::Linear { increment: 0.01 }
}
fn default_entropy_init_scale() -> f64 {
    1.0
}

// ── Tests ───────────────────────────────────────────────────────────────────
