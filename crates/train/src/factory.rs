//! Model-family factory.
//!
//! Maps a [`ModelKind`] to a codec plus whatever schedule state that family
//! needs, so callers never branch on the family themselves.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;

use stanh_common::{LatentPolicy, ModelConfig, ModelKind, RateLevels};
use stanh_core::{CodecOptions, ReferenceCodec};

use crate::scheduler::AnnealingController;
use crate::visualize::{NoopHook, SosCurveWriter, VisualizationHook};

/// A freshly built model and its optional annealing state.
pub struct ModelBundle<M> {
    pub model: M,
    /// Present only for annealed families.
    pub annealing: Option<AnnealingController>,
    /// Quantiser settings of annealed families; decides whether there is a
    /// transfer curve worth dumping.
    pub latent_policy: Option<LatentPolicy>,
}

impl<M> ModelBundle<M> {
    /// Curve dumps under `dir` for annealed families, a no-op otherwise.
    /// Nothing is created on disk for families without a latent policy.
    pub fn curve_hook(&self, dir: &Path) -> Result<Box<dyn VisualizationHook>> {
        match &self.latent_policy {
            Some(policy) => {
                tracing::info!(
                    dir = %dir.display(),
                    extrema = policy.extrema,
                    beta_init = policy.beta_init,
                    beta_max = policy.beta_max,
                    "dumping quantiser curves"
                );
                Ok(Box::new(SosCurveWriter::new(dir)?))
            }
            None => Ok(Box::new(NoopHook)),
        }
    }
}

pub fn build_model(
    config: &ModelConfig,
    levels: &RateLevels,
    device: &Device,
) -> Result<ModelBundle<ReferenceCodec>> {
    config.validate().context("invalid model config")?;
    let options = CodecOptions::from_config(config, levels.len());
    let model = ReferenceCodec::new(&options, device)
        .with_context(|| format!("build {} codec", config.kind.as_str()))?;

    let bundle = match config.kind {
        ModelKind::Base | ModelKind::Gain => ModelBundle {
            model,
            annealing: None,
            latent_policy: None,
        },
        ModelKind::Stanh => {
            let policy = config.latent.clone();
            let annealing = AnnealingController::new(model.hardness_cells(), policy.clone());
            ModelBundle {
                model,
                annealing: Some(annealing),
                latent_policy: Some(policy),
            }
        }
    };

    tracing::info!(
        kind = config.kind.as_str(),
        n = config.n,
        m = config.m,
        levels = levels.len(),
        annealed = bundle.annealing.is_some(),
        "built model"
    );
    Ok(bundle)
}
