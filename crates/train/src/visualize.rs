//! Hooks fired when the aggregate validation loss improves.
//!
//! For annealed models the orchestrator samples every level's quantiser
//! transfer curve and hands it to a [`VisualizationHook`]. The bundled
//! [`SosCurveWriter`] dumps each curve to CSV for offline plotting.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use stanh_common::RateLevel;

/// One sampled quantiser curve, tagged with the encoder-epoch counter.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizerCurve {
    pub level: RateLevel,
    pub encoder_epoch: usize,
    pub xs: Vec<f32>,
    pub ys: Vec<f32>,
}

pub trait VisualizationHook {
    fn on_improvement(&mut self, curve: &QuantizerCurve) -> Result<()>;
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl VisualizationHook for NoopHook {
    fn on_improvement(&mut self, _curve: &QuantizerCurve) -> Result<()> {
        Ok(())
    }
}

/// Writes `sos_level{j}_enc{e:05}.csv` files with an `x,y` header.
pub struct SosCurveWriter {
    dir: PathBuf,
}

impl SosCurveWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, level: usize, encoder_epoch: usize) -> PathBuf {
        self.dir
            .join(format!("sos_level{level}_enc{encoder_epoch:05}.csv"))
    }
}

impl VisualizationHook for SosCurveWriter {
    fn on_improvement(&mut self, curve: &QuantizerCurve) -> Result<()> {
        let path = self.path_for(curve.level.index, curve.encoder_epoch);
        let mut out = Vec::with_capacity(curve.xs.len() * 24);
        writeln!(out, "x,y")?;
        for (x, y) in curve.xs.iter().zip(&curve.ys) {
            writeln!(out, "{x},{y}")?;
        }
        std::fs::write(&path, out).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

/// `count` evenly spaced points covering \[-L-1, L+1\].
pub fn sample_points(extrema: usize, count: usize) -> Vec<f32> {
    let half = extrema as f32 + 1.0;
    if count < 2 {
        return vec![0.0; count];
    }
    let step = 2.0 * half / (count - 1) as f32;
    (0..count).map(|i| -half + step * i as f32).collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
