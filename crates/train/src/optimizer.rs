//! Adam over named parameters, with resumable moment state.
//!
//! candle-nn's `AdamW` keeps its moments private, so resuming a run would
//! restart them from zero. This optimiser keeps them per named slot and
//! exports them as tensors for the checkpoint.

use std::collections::HashMap;

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

/// Scalar optimiser state stored in checkpoint metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamMeta {
    pub step: usize,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl AdamMeta {
    pub fn with_lr(lr: f64) -> Self {
        Self {
            step: 0,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Which slots a checkpoint restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MomentReport {
    pub restored: usize,
    pub skipped: Vec<String>,
}

struct Slot {
    name: String,
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Adam with bias correction and optional decoupled weight decay.
pub struct Adam {
    slots: Vec<Slot>,
    meta: AdamMeta,
}

impl Adam {
    pub fn new(params: Vec<(String, Var)>, meta: AdamMeta) -> Result<Self> {
        let slots = params
            .into_iter()
            .map(|(name, var)| {
                let m = var.as_tensor().zeros_like()?;
                let v = var.as_tensor().zeros_like()?;
                Ok(Slot { name, var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots, meta })
    }

    pub fn learning_rate(&self) -> f64 {
        self.meta.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.meta.lr = lr;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn meta(&self) -> AdamMeta {
        self.meta
    }

    /// Total L2 norm of the gradients this optimiser owns.
    pub fn grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut total = 0.0f64;
        for slot in &self.slots {
            if let Some(g) = grads.get(slot.var.as_tensor()) {
                total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(total.sqrt())
    }

    /// Clip owned gradients so their global L2 norm ≤ `max_norm`. Returns the
    /// norm before clipping.
    pub fn clip_grad_norm(&self, grads: &mut GradStore, max_norm: f64) -> Result<f64> {
        let norm = self.grad_norm(grads)?;
        if norm <= max_norm || norm == 0.0 {
            return Ok(norm);
        }
        let scale = max_norm / norm;
        for slot in &self.slots {
            if let Some(g) = grads.remove(slot.var.as_tensor()) {
                grads.insert(slot.var.as_tensor(), g.affine(scale, 0.0)?);
            }
        }
        Ok(norm)
    }

    /// One Adam update from the gradients in `grads`. Parameters without a
    /// gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        if self.slots.is_empty() {
            return Ok(());
        }
        self.meta.step += 1;
        let AdamMeta {
            step,
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.meta;
        let bias1 = 1.0 - beta1.powi(step as i32);
        let bias2 = 1.0 - beta2.powi(step as i32);

        for slot in &mut self.slots {
            let Some(g) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let g = g.detach();
            let m = (slot.m.affine(beta1, 0.0)? + g.affine(1.0 - beta1, 0.0)?)?.detach();
            let v = (slot.v.affine(beta2, 0.0)? + g.sqr()?.affine(1.0 - beta2, 0.0)?)?.detach();

            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let denom = v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, eps)?;
            let update = (m_hat / denom)?.affine(lr, 0.0)?;

            let current = slot.var.as_tensor().detach();
            let decayed = if weight_decay != 0.0 {
                current.affine(1.0 - lr * weight_decay, 0.0)?
            } else {
                current
            };
            slot.var.set(&(decayed - update)?)?;
            slot.m = m;
            slot.v = v;
        }
        Ok(())
    }

    /// Moments as `{prefix}/m/{name}` and `{prefix}/v/{name}` tensors.
    pub fn state_tensors(&self, prefix: &str) -> HashMap<String, Tensor> {
        let mut out = HashMap::with_capacity(self.slots.len() * 2);
        for slot in &self.slots {
            out.insert(format!("{prefix}/m/{}", slot.name), slot.m.clone());
            out.insert(format!("{prefix}/v/{}", slot.name), slot.v.clone());
        }
        out
    }

    /// Restore scalar state and every moment pair whose name and shape match.
    /// Anything else keeps its fresh (zero) moments.
    pub fn load_state(
        &mut self,
        meta: &AdamMeta,
        tensors: &HashMap<String, Tensor>,
        prefix: &str,
    ) -> Result<MomentReport> {
        self.meta = *meta;
        let mut report = MomentReport::default();
        for slot in &mut self.slots {
            let m = tensors.get(&format!("{prefix}/m/{}", slot.name));
            let v = tensors.get(&format!("{prefix}/v/{}", slot.name));
            match (m, v) {
                (Some(m), Some(v)) if m.dims() == slot.var.dims() && v.dims() == slot.var.dims() => {
                    let device = slot.var.device();
                    let dtype = slot.var.dtype();
                    slot.m = m.to_dtype(dtype)?.to_device(device)?;
                    slot.v = v.to_dtype(dtype)?.to_device(device)?;
                    report.restored += 1;
                }
                _ => report.skipped.push(slot.name.clone()),
            }
        }
        if !report.skipped.is_empty() {
            tracing::warn!(
                prefix,
                skipped = report.skipped.len(),
                "optimizer moments not restored for some parameters"
            );
        }
        Ok(report)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
