//! Rate–distortion objective.

use candle_core::{Result, Tensor};

use stanh_common::RateLevel;
use stanh_core::ModelOutput;

/// PSNR is reported against this MSE floor so a perfect reconstruction stays finite.
const MSE_FLOOR: f64 = 1e-10;

/// Graph-carrying loss components for one batch at one rate level.
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub loss: Tensor,
    pub bpp: Tensor,
    pub mse: Tensor,
}

/// Host-side values of [`LossTerms`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossScalars {
    pub loss: f64,
    pub bpp: f64,
    pub mse: f64,
    pub psnr: f64,
}

impl LossTerms {
    pub fn scalars(&self) -> Result<LossScalars> {
        let mse = self.mse.to_scalar::<f32>()? as f64;
        Ok(LossScalars {
            loss: self.loss.to_scalar::<f32>()? as f64,
            bpp: self.bpp.to_scalar::<f32>()? as f64,
            mse,
            psnr: psnr(mse),
        })
    }
}

/// PSNR in dB for images in \[0, 1\].
pub fn psnr(mse: f64) -> f64 {
    -10.0 * mse.max(MSE_FLOOR).log10()
}

/// Pure function of model output, target and rate level.
pub trait RateDistortionLoss {
    fn compute(&self, output: &ModelOutput, target: &Tensor, level: &RateLevel) -> Result<LossTerms>;
}

/// `λ · 255² · MSE + bpp`, the usual objective for 8-bit images in \[0, 1\].
#[derive(Debug, Clone, Copy, Default)]
pub struct MseRateDistortion;

impl RateDistortionLoss for MseRateDistortion {
    fn compute(&self, output: &ModelOutput, target: &Tensor, level: &RateLevel) -> Result<LossTerms> {
        let (b, _, h, w) = target.dims4()?;
        let num_pixels = (b * h * w) as f64;

        let mut bits: Option<Tensor> = None;
        for lik in &output.likelihoods {
            let term = lik.log()?.sum_all()?;
            bits = Some(match bits {
                None => term,
                Some(prev) => (prev + term)?,
            });
        }
        let bpp = match bits {
            Some(total) => total.affine(-1.0 / (std::f64::consts::LN_2 * num_pixels), 0.0)?,
            None => target.zeros_like()?.sum_all()?,
        };

        let mse = (&output.x_hat - target)?.sqr()?.mean_all()?;
        let loss = (mse.affine(level.lambda * 255.0 * 255.0, 0.0)? + &bpp)?;
        Ok(LossTerms { loss, bpp, mse })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
