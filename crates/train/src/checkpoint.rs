//! Checkpoint records and the three-destination store.
//!
//! A record is a single safetensors file. Tensors are namespaced
//! (`model/…`, `optimizer/m/…`, `aux_optimizer/v/…`); everything scalar is a
//! JSON [`RecordMeta`] under the `record` key of the safetensors header.
//!
//! Destinations per run folder:
//!
//! * **latest** — rewritten every epoch, before any best-tier logic.
//! * **best** — per-run copy of the best epoch so far.
//! * **best-of-run** — global copy of the best epoch; uploaded to the tracker
//!   once the epoch passes the configured threshold.
//!
//! Every destination is written to a temporary sibling and renamed into
//! place, so a crash never leaves a torn file behind.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use stanh_common::RunConfig;

use crate::optimizer::AdamMeta;
use crate::scheduler::{AnnealingState, PlateauState};
use crate::tracking::ExperimentTracker;

pub const RECORD_VERSION: u32 = 1;
const RECORD_KEY: &str = "record";

pub const MODEL_PREFIX: &str = "model/";
pub const OPTIMIZER_PREFIX: &str = "optimizer";
pub const AUX_OPTIMIZER_PREFIX: &str = "aux_optimizer";

// ── Record ──────────────────────────────────────────────────────────────────

/// Scalar part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub version: u32,
    pub epoch: usize,
    pub global_step: usize,
    /// Lowest aggregate validation loss so far; `None` before any epoch.
    #[serde(with = "crate::float_serde::optional")]
    pub best_loss: Option<f64>,
    pub encoder_epoch: usize,
    /// Test loss of the last rate level evaluated in this epoch (not an
    /// aggregate). Kept under its own name so it is not mistaken for one.
    #[serde(with = "crate::float_serde::scalar")]
    pub final_level_test_loss: f64,
    /// Test loss of every rate level, in level order.
    #[serde(with = "crate::float_serde::list")]
    pub test_losses: Vec<f64>,
    #[serde(with = "crate::float_serde::scalar")]
    pub aggregate_validation_loss: f64,
    pub optimizer: AdamMeta,
    /// `None` when the run has no auxiliary optimiser (frozen backbone).
    pub aux_optimizer: Option<AdamMeta>,
    pub lr_scheduler: PlateauState,
    pub annealing: Option<AnnealingState>,
    pub config: RunConfig,
}

/// Full snapshot: metadata plus namespaced tensors.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub meta: RecordMeta,
    pub tensors: HashMap<String, Tensor>,
}

impl CheckpointRecord {
    /// Model parameters with the `model/` namespace stripped.
    pub fn model_state(&self) -> HashMap<String, Tensor> {
        self.tensors
            .iter()
            .filter_map(|(k, t)| {
                k.strip_prefix(MODEL_PREFIX)
                    .map(|name| (name.to_string(), t.clone()))
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(&self.meta).context("serialise checkpoint metadata")?;
        let header = Some(HashMap::from([(RECORD_KEY.to_string(), json)]));
        let mut entries: Vec<(&String, &Tensor)> = self.tensors.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let bytes = safetensors::tensor::serialize(entries, &header)
            .context("serialise checkpoint tensors")?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8], device: &Device) -> Result<Self> {
        let (_, metadata) =
            SafeTensors::read_metadata(bytes).context("read safetensors header")?;
        let json = metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(RECORD_KEY))
            .context("safetensors file carries no training record")?;
        let meta: RecordMeta = serde_json::from_str(json).context("parse training record")?;
        let tensors = candle_core::safetensors::load_buffer(bytes, device)
            .context("load checkpoint tensors")?;
        Ok(Self { meta, tensors })
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_bytes(&bytes, device).with_context(|| format!("load checkpoint {}", path.display()))
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// The three destinations of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub dir: PathBuf,
    pub latest: PathBuf,
    pub best: PathBuf,
    pub best_of_run: PathBuf,
}

impl CheckpointPaths {
    /// Derive the run folder from `config` and create it if absent.
    pub fn resolve(save_path: &Path, config: &RunConfig) -> Result<Self> {
        let folder = config.run_folder_name();
        let dir = save_path.join(&folder);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
        let stem = config.file_stem();
        Ok(Self {
            latest: dir.join(format!("{stem}_latest.safetensors")),
            best: dir.join(format!("{stem}_best.safetensors")),
            best_of_run: save_path.join(format!("{folder}_best_of_run.safetensors")),
            dir,
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("move checkpoint into place at {}", path.display()))?;
    Ok(())
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Persists records and hands best-of-run artefacts to the tracker.
pub struct CheckpointStore {
    tracker: Arc<dyn ExperimentTracker>,
    upload_after_epoch: usize,
    uploads: Mutex<Vec<JoinHandle<()>>>,
}

impl CheckpointStore {
    pub fn new(tracker: Arc<dyn ExperimentTracker>, upload_after_epoch: usize) -> Self {
        Self {
            tracker,
            upload_after_epoch,
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Write `latest`; if `is_best` also write identical bytes to `best` and
    /// `best_of_run`, and past the threshold start a background upload.
    pub fn save(
        &self,
        record: &CheckpointRecord,
        is_best: bool,
        paths: &CheckpointPaths,
        epoch: usize,
    ) -> Result<()> {
        let bytes = record.to_bytes()?;
        write_atomic(&paths.latest, &bytes)?;
        if !is_best {
            return Ok(());
        }
        write_atomic(&paths.best, &bytes)?;
        write_atomic(&paths.best_of_run, &bytes)?;
        tracing::info!(epoch, path = %paths.best_of_run.display(), "saved new best checkpoint");
        if epoch > self.upload_after_epoch {
            self.spawn_upload(paths.best_of_run.clone());
        }
        Ok(())
    }

    fn spawn_upload(&self, path: PathBuf) {
        let tracker = Arc::clone(&self.tracker);
        let spawned = std::thread::Builder::new()
            .name("checkpoint-upload".into())
            .spawn(move || {
                if let Err(e) = tracker.upload(&path) {
                    tracing::warn!(error = %format!("{e:#}"), path = %path.display(), "checkpoint upload failed");
                }
            });
        match spawned {
            Ok(handle) => self.uploads.lock().push(handle),
            Err(e) => tracing::warn!(error = %e, "could not start checkpoint upload"),
        }
    }

    /// Block until every started upload has finished. Failures are logged.
    pub fn wait_for_uploads(&self) {
        let handles: Vec<_> = self.uploads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("checkpoint upload thread panicked");
            }
        }
    }

    pub fn load(&self, path: &Path, device: &Device) -> Result<CheckpointRecord> {
        CheckpointRecord::load(path, device)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
