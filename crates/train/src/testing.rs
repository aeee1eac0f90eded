//! Scripted collaborators shared by the unit tests of this crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use parking_lot::Mutex;

use stanh_common::{
    BatchProvider, BatchStream, DataConfig, ImageBatch, ModelConfig, ModelKind, RateLevel,
    RunConfig, TrainerConfig,
};
use stanh_core::{merge_state_dict, CompressionModel, LoadReport, ModelOutput, Quantize};

use crate::loss::{LossTerms, RateDistortionLoss};
use crate::tracking::ExperimentTracker;
use crate::visualize::{QuantizerCurve, VisualizationHook};

const LAMBDAS: [f64; 4] = [0.05, 0.25, 0.5, 1.0];

/// Run config writing into `dir` with the first `levels` of a fixed λ list.
pub fn run_config(dir: &Path, levels: usize) -> RunConfig {
    RunConfig {
        run_name: "probe".into(),
        model: ModelConfig {
            kind: ModelKind::Gain,
            n: 8,
            m: 8,
            ..Default::default()
        },
        trainer: TrainerConfig {
            epochs: 2,
            lr: 1e-2,
            save_path: dir.to_path_buf(),
            num_workers: 1,
            log_every: 1,
            ..Default::default()
        },
        data: DataConfig {
            dataset: dir.join("data"),
            test_dataset: dir.join("kodak"),
            num_images: 0,
            num_images_val: 0,
        },
        lambda_list: LAMBDAS[..levels].to_vec(),
        checkpoint: None,
        continue_train: false,
    }
}

// ── Data ────────────────────────────────────────────────────────────────────

/// Square RGB batch with every pixel set to `value`.
fn filled(batch: usize, size: usize, value: f32) -> ImageBatch {
    ImageBatch {
        data: vec![value; batch * 3 * size * size],
        batch,
        height: size,
        width: size,
    }
}

/// One two-image batch per entry of `values`, identical every epoch.
pub struct StaticProvider {
    values: Vec<f32>,
    size: usize,
    calls: Arc<AtomicUsize>,
}

impl StaticProvider {
    pub fn new(values: Vec<f32>, size: usize) -> Self {
        Self {
            values,
            size,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `batches` calls that outlives the boxed provider.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl BatchProvider for StaticProvider {
    fn len(&self) -> usize {
        2 * self.values.len()
    }

    fn batches(&self, _epoch: usize) -> Result<BatchStream<'_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let size = self.size;
        Ok(Box::new(
            self.values
                .iter()
                .map(move |&v| Ok(filled(2, size, v))),
        ))
    }
}

/// A single 4×4 batch whose pixel value depends on the epoch (last value
/// repeats once the script runs out).
pub struct ScriptedProvider {
    values: Vec<f32>,
}

impl ScriptedProvider {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }
}

impl BatchProvider for ScriptedProvider {
    fn len(&self) -> usize {
        1
    }

    fn batches(&self, epoch: usize) -> Result<BatchStream<'_>> {
        let value = self.values[epoch.min(self.values.len() - 1)];
        Ok(Box::new(std::iter::once(Ok(filled(1, 4, value)))))
    }
}

/// Yields one corrupt batch.
pub struct FailingProvider;

impl BatchProvider for FailingProvider {
    fn len(&self) -> usize {
        1
    }

    fn batches(&self, _epoch: usize) -> Result<BatchStream<'_>> {
        Ok(Box::new(std::iter::once(Err(anyhow::anyhow!(
            "corrupt image in batch"
        )))))
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// `x̂ = scale · x` with a constant likelihood of ½ per image.
pub struct ProbeModel {
    scale: Var,
    frozen: bool,
}

impl ProbeModel {
    pub fn new(scale: f32) -> Self {
        Self {
            scale: Var::new(&[scale], &Device::Cpu).unwrap(),
            frozen: false,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale.to_vec1::<f32>().unwrap()[0]
    }

    fn named(&self) -> Vec<(String, Var)> {
        vec![("probe.scale".to_string(), self.scale.clone())]
    }
}

impl CompressionModel for ProbeModel {
    fn forward(
        &self,
        x: &Tensor,
        _level: usize,
        _quantize: Quantize<'_>,
    ) -> candle_core::Result<ModelOutput> {
        let b = x.dim(0)?;
        Ok(ModelOutput {
            x_hat: x.broadcast_mul(self.scale.as_tensor())?,
            likelihoods: vec![Tensor::full(0.5f32, (b, 1, 1, 1), x.device())?],
        })
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        if self.frozen {
            Vec::new()
        } else {
            self.named()
        }
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named()
            .into_iter()
            .map(|(k, v)| (k, v.as_tensor().copy().unwrap()))
            .collect()
    }

    fn load_state_dict(
        &mut self,
        dict: &HashMap<String, Tensor>,
        strict: bool,
    ) -> anyhow::Result<LoadReport> {
        merge_state_dict(&self.named(), dict, strict)
    }

    fn quantizer_curve(&self, _level: usize, xs: &Tensor) -> candle_core::Result<Option<Tensor>> {
        Ok(Some(xs.clone()))
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Loss = mean(target) + `offsets[level]`, independent of the prediction.
pub struct ScriptedLoss {
    pub offsets: Vec<f64>,
}

impl RateDistortionLoss for ScriptedLoss {
    fn compute(
        &self,
        output: &ModelOutput,
        target: &Tensor,
        level: &RateLevel,
    ) -> candle_core::Result<LossTerms> {
        let base = target.mean_all()?.to_scalar::<f32>()? as f64 + self.offsets[level.index];
        let loss = output.x_hat.mean_all()?.affine(0.0, base)?;
        let zero = loss.affine(0.0, 0.0)?;
        Ok(LossTerms {
            loss,
            bpp: zero.clone(),
            mse: zero,
        })
    }
}

// ── Hook & tracker ──────────────────────────────────────────────────────────

/// Records `(level, encoder_epoch)` of every call.
#[derive(Default)]
pub struct RecordingHook {
    pub calls: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl VisualizationHook for RecordingHook {
    fn on_improvement(&mut self, curve: &QuantizerCurve) -> Result<()> {
        self.calls.lock().push((curve.level.index, curve.encoder_epoch));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum UploadMode {
    #[default]
    Succeed,
    Fail,
    Panic,
}

/// Tracker keeping everything in memory.
#[derive(Default)]
pub struct InMemoryTracker {
    logs: Mutex<Vec<(usize, Vec<(String, f64)>)>>,
    uploads: Mutex<Vec<PathBuf>>,
    mode: UploadMode,
}

impl InMemoryTracker {
    pub fn failing() -> Self {
        Self {
            mode: UploadMode::Fail,
            ..Default::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            mode: UploadMode::Panic,
            ..Default::default()
        }
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().clone()
    }

    pub fn logs(&self) -> Vec<(usize, Vec<(String, f64)>)> {
        self.logs.lock().clone()
    }

    /// Value of `key` in every logged record that has it.
    pub fn series(&self, key: &str) -> Vec<f64> {
        self.logs
            .lock()
            .iter()
            .filter_map(|(_, m)| m.iter().find(|(k, _)| k == key).map(|(_, v)| *v))
            .collect()
    }
}

impl ExperimentTracker for InMemoryTracker {
    fn log(&self, step: usize, metrics: &[(String, f64)]) {
        self.logs.lock().push((step, metrics.to_vec()));
    }

    fn upload(&self, path: &Path) -> Result<()> {
        match self.mode {
            UploadMode::Succeed => {
                self.uploads.lock().push(path.to_path_buf());
                Ok(())
            }
            UploadMode::Fail => anyhow::bail!("tracking service unreachable"),
            UploadMode::Panic => panic!("tracking client crashed"),
        }
    }
}
