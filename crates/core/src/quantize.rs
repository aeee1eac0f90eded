//! Quantisation primitives: STanH surrogate, noise proxy, STE rounding.
//!
//! # Hardness cells
//!
//! Every rate-aware quantiser reads its STanH slope β from a
//! [`HardnessCell`]. The cell is shared (not global) state: the model holds
//! one clone per rate level and the annealing controller holds the others,
//! so advancing the schedule is an explicit write through a handle the
//! trainer owns. Reads on the forward path are relaxed atomic loads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::{Result, Tensor};
use rand::Rng;

// ── Hardness cell ───────────────────────────────────────────────────────────

/// Shared STanH slope β, stored as `f64` bits.
#[derive(Debug, Clone)]
pub struct HardnessCell(Arc<AtomicU64>);

impl HardnessCell {
    pub fn new(beta: f64) -> Self {
        Self(Arc::new(AtomicU64::new(beta.to_bits())))
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Store `beta`. NaN is ignored so a bad schedule cannot poison the model.
    pub fn set(&self, beta: f64) {
        if !beta.is_nan() {
            self.0.store(beta.to_bits(), Ordering::Relaxed);
        }
    }
}

// ── STanH ───────────────────────────────────────────────────────────────────

/// Integer output range `[lo, hi]` of a quantiser with half-width `extrema`.
///
/// Symmetric: `[-L, L]`; otherwise one level is dropped at the top, `[-L, L-1]`.
pub fn level_range(extrema: usize, symmetric: bool) -> (i64, i64) {
    let l = extrema as i64;
    if symmetric {
        (-l, l)
    } else {
        (-l, l - 1)
    }
}

/// Sum of shifted tanh steps:
///
/// ```text
/// stanh(x) = lo + Σ_{k=lo}^{hi-1} ½·(tanh(β·(x − (k + ½))) + 1)
/// ```
///
/// Differentiable everywhere. As β → ∞ it converges to `clamp(round(x), lo, hi)`.
pub fn stanh(x: &Tensor, beta: f64, lo: i64, hi: i64) -> Result<Tensor> {
    let mut y = x.zeros_like()?.affine(1.0, lo as f64)?;
    for k in lo..hi {
        let centre = k as f64 + 0.5;
        let step = x.affine(beta, -beta * centre)?.tanh()?.affine(0.5, 0.5)?;
        y = (y + step)?;
    }
    Ok(y)
}

// ── Training / evaluation quantisers ────────────────────────────────────────

/// Additive uniform noise in \[-½, ½) (differentiable proxy for rounding).
pub fn noise_quantize<R: Rng>(x: &Tensor, rng: &mut R) -> Result<Tensor> {
    let n = x.elem_count();
    let noise: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
    let noise = Tensor::from_vec(noise, x.shape(), x.device())?.to_dtype(x.dtype())?;
    x + noise
}

/// Hard STE: `forward = round(x)`, `backward = identity`.
pub fn ste_round(x: &Tensor) -> Result<Tensor> {
    let rounded = x.round()?.detach();
    let residual = (x - &x.detach())?;
    rounded + residual
}

// ── Tests ───────────────────────────────────────────────────────────────────
