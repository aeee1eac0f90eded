//! Per-rate-level evaluation on a held-out split.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

use stanh_common::{BatchProvider, RateLevel};
use stanh_core::{CompressionModel, Quantize};

use crate::loss::RateDistortionLoss;

/// Batch-averaged metrics of one split at one rate level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelMetrics {
    pub loss: f64,
    pub bpp: f64,
    pub mse: f64,
    pub psnr: f64,
}

/// Read-only pass with no parameter or hardness updates.
///
/// The model is asked for [`Quantize::Hard`]: rounding for plain codecs,
/// while STanH codecs keep their surrogate at the current hardness, so an
/// annealed model is scored exactly as far as its schedule has progressed.
pub struct RateLevelEvaluator {
    device: Device,
}

impl RateLevelEvaluator {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn evaluate<M, L>(
        &self,
        model: &M,
        loss_fn: &L,
        split: &dyn BatchProvider,
        level: &RateLevel,
        epoch: usize,
    ) -> Result<LevelMetrics>
    where
        M: CompressionModel + ?Sized,
        L: RateDistortionLoss + ?Sized,
    {
        let mut sum = LevelMetrics {
            loss: 0.0,
            bpp: 0.0,
            mse: 0.0,
            psnr: 0.0,
        };
        let mut count = 0usize;
        for (i, batch) in split.batches(epoch)?.enumerate() {
            let batch = batch.with_context(|| format!("load evaluation batch {i}"))?;
            let x = batch.to_tensor(&self.device)?;
            let output = model.forward(&x, level.index, Quantize::Hard)?;
            let s = loss_fn.compute(&output, &x, level)?.scalars()?;
            sum.loss += s.loss;
            sum.bpp += s.bpp;
            sum.mse += s.mse;
            sum.psnr += s.psnr;
            count += 1;
        }
        if count == 0 {
            bail!("evaluation split produced no batches");
        }
        let n = count as f64;
        Ok(LevelMetrics {
            loss: sum.loss / n,
            bpp: sum.bpp / n,
            mse: sum.mse / n,
            psnr: sum.psnr / n,
        })
    }
}
