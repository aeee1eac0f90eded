//! The compression-model contract and a compact reference codec.
//!
//! [`CompressionModel`] is everything the training loop needs from a codec:
//! a rate-level–conditioned forward pass, the trainable / auxiliary parameter
//! sets, a freeze switch, and state-dict I/O.
//!
//! [`ReferenceCodec`] implements it with a small factorised-prior
//! autoencoder: pixel-shuffle + 3×3 conv analysis/synthesis transforms,
//! optional per-level channel gains, and a per-channel logistic or Gaussian
//! entropy model. Annealed variants quantise with STanH at the slope held in
//! each level's [`HardnessCell`].

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Init, Module, VarBuilder, VarMap};
use rand::rngs::StdRng;

use stanh_common::ModelConfig;

use crate::quantize::{level_range, noise_quantize, stanh, ste_round, HardnessCell};
use crate::state::{merge_state_dict, LoadReport};

const LIKELIHOOD_FLOOR: f64 = 1e-9;
const QUANTILE_TAIL: f32 = 1e-3;
const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;

// ── Contract ────────────────────────────────────────────────────────────────

/// How the latent is discretised on this forward pass.
pub enum Quantize<'a> {
    /// Training: stochastic / soft proxy driven by the given generator.
    Noise(&'a mut StdRng),
    /// Evaluation: deterministic. Rounding for plain quantisers; STanH
    /// quantisers stay at their current hardness.
    Hard,
}

/// Reconstruction plus the likelihoods of every coded symbol.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub x_hat: Tensor,
    pub likelihoods: Vec<Tensor>,
}

/// A multi-rate learned image codec.
pub trait CompressionModel {
    fn forward(&self, x: &Tensor, level: usize, quantize: Quantize<'_>) -> Result<ModelOutput>;

    /// Parameters the main optimiser updates, given the current freeze state.
    fn parameters(&self) -> Vec<(String, Var)>;

    /// Parameters owned by the auxiliary (entropy-bound) optimiser.
    fn aux_parameters(&self) -> Vec<(String, Var)> {
        Vec::new()
    }

    /// Loss for the auxiliary optimiser, if the model has one.
    fn aux_loss(&self) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Number of scalars currently requiring gradient updates.
    fn active_parameter_count(&self) -> usize {
        self.parameters().iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Freeze the backbone; only per-level parameters stay trainable.
    fn freeze(&mut self);

    fn state_dict(&self) -> HashMap<String, Tensor>;

    fn load_state_dict(
        &mut self,
        dict: &HashMap<String, Tensor>,
        strict: bool,
    ) -> anyhow::Result<LoadReport>;

    /// Transfer curve of the level's quantiser sampled at `xs`, for models
    /// whose quantiser changes shape over training.
    fn quantizer_curve(&self, _level: usize, _xs: &Tensor) -> Result<Option<Tensor>> {
        Ok(None)
    }
}

// ── Options ─────────────────────────────────────────────────────────────────

/// STanH quantiser setup shared by every level.
#[derive(Debug, Clone, Copy)]
pub struct StanhOptions {
    pub lo: i64,
    pub hi: i64,
    pub beta_init: f64,
}

/// Resolved construction options for [`ReferenceCodec`].
#[derive(Debug, Clone)]
pub struct CodecOptions {
    pub n: usize,
    pub m: usize,
    pub levels: usize,
    pub level_gains: bool,
    pub stanh: Option<StanhOptions>,
    pub gaussian: bool,
    pub entropy_init_scale: f64,
}

impl CodecOptions {
    pub fn from_config(config: &ModelConfig, levels: usize) -> Self {
        let stanh = config.kind.is_annealed().then(|| {
            let (lo, hi) = level_range(config.latent.extrema, config.symmetry);
            StanhOptions {
                lo,
                hi,
                beta_init: config.latent.beta_init,
            }
        });
        Self {
            n: config.n,
            m: config.m,
            levels,
            level_gains: config.kind.has_level_gains(),
            stanh,
            gaussian: config.gauss_gp,
            entropy_init_scale: config.entropy_init_scale,
        }
    }
}

// ── Pixel shuffle ───────────────────────────────────────────────────────────

/// `(B, C, H, W)` → `(B, 4C, H/2, W/2)`.
fn space_to_depth(x: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    x.reshape(vec![b, c, h / 2, 2, w / 2, 2])?
        .permute(vec![0, 1, 3, 5, 2, 4])?
        .contiguous()?
        .reshape((b, c * 4, h / 2, w / 2))
}

/// `(B, 4C, H, W)` → `(B, C, 2H, 2W)`; inverse of [`space_to_depth`].
fn depth_to_space(x: &Tensor) -> Result<Tensor> {
    let (b, c4, h, w) = x.dims4()?;
    let c = c4 / 4;
    x.reshape(vec![b, c, 2, 2, h, w])?
        .permute(vec![0, 1, 4, 2, 5, 3])?
        .contiguous()?
        .reshape((b, c, h * 2, w * 2))
}

// ── ReferenceCodec ──────────────────────────────────────────────────────────

struct LevelGain {
    gain: Tensor,
    inv_gain: Tensor,
}

/// Factorised-prior codec with optional per-level gains and STanH quantisers.
pub struct ReferenceCodec {
    g_a0: Conv2d,
    g_a1: Conv2d,
    g_s0: Conv2d,
    g_s1: Conv2d,
    gains: Vec<LevelGain>,
    log_scale: Tensor,
    quantiles: Tensor,
    hardness: Vec<HardnessCell>,
    stanh: Option<StanhOptions>,
    levels: usize,
    gaussian: bool,
    frozen: bool,
    named: Vec<(String, Var)>,
    // Keeps the variables alive alongside `named`.
    _varmap: VarMap,
}

impl ReferenceCodec {
    pub fn new(options: &CodecOptions, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let (n, m) = (options.n, options.m);
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let g_a0 = conv2d(12, n, 3, cfg, vb.pp("analysis").pp("conv0"))?;
        let g_a1 = conv2d(4 * n, m, 3, cfg, vb.pp("analysis").pp("conv1"))?;
        let g_s0 = conv2d(m, 4 * n, 3, cfg, vb.pp("synthesis").pp("conv0"))?;
        let g_s1 = conv2d(n, 12, 3, cfg, vb.pp("synthesis").pp("conv1"))?;

        let gains = if options.level_gains {
            (0..options.levels)
                .map(|j| {
                    let vb = vb.pp("levels").pp(j);
                    Ok(LevelGain {
                        gain: vb.get_with_hints((1, m, 1, 1), "gain", Init::Const(1.0))?,
                        inv_gain: vb.get_with_hints((1, m, 1, 1), "inv_gain", Init::Const(1.0))?,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let entropy = vb.pp("entropy");
        let log_scale = entropy.get_with_hints(
            (1, m, 1, 1),
            "log_scale",
            Init::Const(options.entropy_init_scale.ln()),
        )?;
        let quantiles = entropy.get_with_hints((m, 3), "quantiles", Init::Const(0.0))?;

        let hardness = match options.stanh {
            Some(s) => (0..options.levels).map(|_| HardnessCell::new(s.beta_init)).collect(),
            None => Vec::new(),
        };

        let mut named: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));

        // Quantile bounds start at ±10 scales around a zero median.
        let init: Vec<f32> = (0..m).flat_map(|_| [-10.0f32, 0.0, 10.0]).collect();
        if let Some((_, var)) = named.iter().find(|(k, _)| k == "entropy.quantiles") {
            var.set(&Tensor::from_vec(init, (m, 3), device)?)?;
        }

        Ok(Self {
            g_a0,
            g_a1,
            g_s0,
            g_s1,
            gains,
            log_scale,
            quantiles,
            hardness,
            stanh: options.stanh,
            levels: options.levels,
            gaussian: options.gaussian,
            frozen: false,
            named,
            _varmap: varmap,
        })
    }

    /// Handles to the per-level STanH slopes (empty for non-annealed codecs).
    pub fn hardness_cells(&self) -> Vec<HardnessCell> {
        self.hardness.clone()
    }

    fn analysis(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.g_a0.forward(&space_to_depth(x)?)?.relu()?;
        self.g_a1.forward(&space_to_depth(&h)?)
    }

    fn synthesis(&self, y: &Tensor) -> Result<Tensor> {
        let h = depth_to_space(&self.g_s0.forward(y)?)?.relu()?;
        depth_to_space(&self.g_s1.forward(&h)?)
    }

    fn quantize(&self, y: &Tensor, level: usize, quantize: Quantize<'_>) -> Result<Tensor> {
        match (self.stanh, quantize) {
            (Some(s), _) => stanh(y, self.hardness[level].get(), s.lo, s.hi),
            (None, Quantize::Noise(rng)) => noise_quantize(y, rng),
            (None, Quantize::Hard) => ste_round(y),
        }
    }

    fn cdf(&self, z: &Tensor) -> Result<Tensor> {
        if self.gaussian {
            let cube = (z.sqr()? * z)?;
            (z + cube.affine(0.044_715, 0.0)?)?
                .affine(SQRT_2_OVER_PI, 0.0)?
                .tanh()?
                .affine(0.5, 0.5)
        } else {
            z.affine(0.5, 0.0)?.tanh()?.affine(0.5, 0.5)
        }
    }

    /// Probability mass of each integer bin around `y_q`.
    fn likelihood(&self, y_q: &Tensor) -> Result<Tensor> {
        let scale = self.log_scale.exp()?;
        let upper = self.cdf(&y_q.affine(1.0, 0.5)?.broadcast_div(&scale)?)?;
        let lower = self.cdf(&y_q.affine(1.0, -0.5)?.broadcast_div(&scale)?)?;
        (upper - lower)?.clamp(LIKELIHOOD_FLOOR, 1.0)
    }

    fn is_aux(name: &str) -> bool {
        name == "entropy.quantiles"
    }
}

impl CompressionModel for ReferenceCodec {
    fn forward(&self, x: &Tensor, level: usize, quantize: Quantize<'_>) -> Result<ModelOutput> {
        if level >= self.levels {
            candle_core::bail!("rate level {level} out of range (codec has {})", self.levels);
        }
        let mut y = self.analysis(x)?;
        if let Some(g) = self.gains.get(level) {
            y = y.broadcast_mul(&g.gain)?;
        }
        let y_q = self.quantize(&y, level, quantize)?;
        let likelihoods = self.likelihood(&y_q)?;
        let y_hat = match self.gains.get(level) {
            Some(g) => y_q.broadcast_mul(&g.inv_gain)?,
            None => y_q,
        };
        let x_hat = self.synthesis(&y_hat)?;
        Ok(ModelOutput {
            x_hat,
            likelihoods: vec![likelihoods],
        })
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.named
            .iter()
            .filter(|(k, _)| !Self::is_aux(k))
            .filter(|(k, _)| !self.frozen || k.starts_with("levels."))
            .cloned()
            .collect()
    }

    fn aux_parameters(&self) -> Vec<(String, Var)> {
        if self.frozen {
            return Vec::new();
        }
        self.named
            .iter()
            .filter(|(k, _)| Self::is_aux(k))
            .cloned()
            .collect()
    }

    fn aux_loss(&self) -> Result<Option<Tensor>> {
        let m = self.quantiles.dim(0)?;
        let scale = self.log_scale.detach().reshape((m, 1))?.exp()?;
        let cdf = self.cdf(&self.quantiles.broadcast_div(&scale)?)?;
        let target = Tensor::new(
            &[[QUANTILE_TAIL, 0.5, 1.0 - QUANTILE_TAIL]],
            self.quantiles.device(),
        )?;
        Ok(Some(cdf.broadcast_sub(&target)?.abs()?.sum_all()?))
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named
            .iter()
            .map(|(k, v)| (k.clone(), v.as_tensor().clone()))
            .collect()
    }

    fn load_state_dict(
        &mut self,
        dict: &HashMap<String, Tensor>,
        strict: bool,
    ) -> anyhow::Result<LoadReport> {
        merge_state_dict(&self.named, dict, strict)
    }

    fn quantizer_curve(&self, level: usize, xs: &Tensor) -> Result<Option<Tensor>> {
        match (self.stanh, self.hardness.get(level)) {
            (Some(s), Some(cell)) => Ok(Some(stanh(xs, cell.get(), s.lo, s.hi)?)),
            _ => Ok(None),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
