//! Experiment tracking handle.
//!
//! The orchestrator receives one [`ExperimentTracker`] at construction and
//! routes every metric record and artefact upload through it; there is no
//! process-wide session. Logging is fire-and-forget: implementations swallow
//! (and report) their own failures.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;

pub trait ExperimentTracker: Send + Sync {
    /// Record numeric metrics for `step`. Never fails the caller.
    ///
    /// Epoch records are logged at the epoch index, `step/*` records at the
    /// global optimisation step.
    fn log(&self, step: usize, metrics: &[(String, f64)]);

    /// Ship a large artefact (a checkpoint). May block; callers run it off
    /// the training thread.
    fn upload(&self, path: &Path) -> Result<()>;
}

/// Tracker that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracker;

impl ExperimentTracker for NullTracker {
    fn log(&self, _step: usize, _metrics: &[(String, f64)]) {}

    fn upload(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Tracker backed by a directory: `metrics.jsonl` plus an `artifacts/` copy
/// of every uploaded file.
pub struct LocalTracker {
    metrics: Mutex<File>,
    artifacts: PathBuf,
}

impl LocalTracker {
    pub fn create(dir: &Path) -> Result<Self> {
        let artifacts = dir.join("artifacts");
        std::fs::create_dir_all(&artifacts)
            .with_context(|| format!("create tracking dir {}", artifacts.display()))?;
        let path = dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            metrics: Mutex::new(file),
            artifacts,
        })
    }
}

impl ExperimentTracker for LocalTracker {
    fn log(&self, step: usize, metrics: &[(String, f64)]) {
        let values: serde_json::Map<String, serde_json::Value> = metrics
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        let line = serde_json::json!({ "step": step, "metrics": values });
        let mut file = self.metrics.lock();
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(error = %e, "failed to write metrics record");
        }
    }

    fn upload(&self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .with_context(|| format!("artefact path has no file name: {}", path.display()))?;
        let dest = self.artifacts.join(name);
        std::fs::copy(path, &dest)
            .with_context(|| format!("copy {} to {}", path.display(), dest.display()))?;
        tracing::info!(artefact = %dest.display(), "uploaded artefact");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_tracker_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = LocalTracker::create(dir.path()).unwrap();
        tracker.log(0, &[("train/learning_rate".to_string(), 1e-4)]);
        tracker.log(1, &[("train/learning_rate".to_string(), 5e-5)]);

        let text = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 1);
        assert_eq!(lines[1]["metrics"]["train/learning_rate"], 5e-5);
    }

    #[test]
    fn local_tracker_copies_artefacts() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = LocalTracker::create(&dir.path().join("tracking")).unwrap();
        let src = dir.path().join("best.safetensors");
        std::fs::write(&src, b"checkpoint bytes").unwrap();
        tracker.upload(&src).unwrap();
        let copied = std::fs::read(dir.path().join("tracking/artifacts/best.safetensors")).unwrap();
        assert_eq!(copied, b"checkpoint bytes");

        assert!(tracker.upload(&dir.path().join("missing.safetensors")).is_err());
    }
}
