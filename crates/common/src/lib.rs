//! # stanh-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`RunConfig`]** — model / trainer / data configuration plus the λ list.
//! * **[`RateLevels`]** — the validated, ordered rate–distortion operating points.
//! * **[`DataLoader`]** / **[`BatchProvider`]** — image loading & batching.

pub mod config;
pub mod data;

pub use config::{
    parse_lambda_list, AnnealingStrategy, DataConfig, LatentPolicy, ModelConfig, ModelKind,
    RateLevel, RateLevels, RunConfig, TrainerConfig, SPATIAL_ALIGN,
};
pub use data::{
    load_image, mix_seed, BatchProvider, BatchStream, Crop, DataLoader, ImageBatch, ImageFolder,
    LoaderConfig, PREFETCH_BUFFER,
};
