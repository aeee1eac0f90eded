use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use stanh_common::{
    parse_lambda_list, BatchProvider, Crop, DataConfig, DataLoader, ImageFolder, LoaderConfig,
    ModelConfig, ModelKind, RunConfig, TrainerConfig, SPATIAL_ALIGN,
};
use stanh_core::CompressionModel;
use stanh_train::{
    build_model, CheckpointPaths, CheckpointRecord, Collaborators, ExperimentTracker,
    LocalTracker, MseRateDistortion, NoopHook, NullTracker, TrainingOrchestrator, VisualizationHook,
};

#[derive(Parser, Debug)]
#[command(name = "stanh", about = "Multi-rate learned image compression trainer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a multi-rate codec from scratch, from pretrained weights, or resume a run.
    Train(TrainArgs),
    /// Print the metadata of a checkpoint record.
    Inspect(InspectArgs),
}

// ── Train ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Model family: base, gain or stanh.
    #[arg(long, default_value = "stanh")]
    model: ModelKind,
    /// Architecture JSON; written with defaults if missing.
    #[arg(long, default_value = "model_config.json")]
    model_config: PathBuf,
    /// Comma-separated λ values, one per rate level.
    #[arg(long, default_value = "0.0018,0.0035,0.0067,0.0130,0.025,0.0483")]
    lambda_list: String,
    #[arg(long, default_value = "")]
    run_name: String,
    /// Root with train/ and test/ image folders.
    #[arg(long)]
    dataset: PathBuf,
    /// Full-resolution held-out images.
    #[arg(long)]
    test_dataset: PathBuf,
    #[arg(long, default_value_t = 0)]
    num_images: usize,
    #[arg(long, default_value_t = 0)]
    num_images_val: usize,
    /// Checkpoint to initialise from (weights only unless --continue-train).
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    continue_train: bool,
    #[arg(long, default_value_t = 200)]
    epochs: usize,
    #[arg(long, default_value_t = 1e-4)]
    lr: f64,
    #[arg(long, default_value_t = 1e-3)]
    aux_lr: f64,
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
    #[arg(long, default_value_t = 64)]
    test_batch_size: usize,
    #[arg(long, default_value_t = 256)]
    patch_size: usize,
    #[arg(long, default_value_t = 1.0)]
    clip_max_norm: f64,
    #[arg(long, default_value_t = 4)]
    patience: usize,
    #[arg(long, default_value_t = 0.5)]
    factor: f64,
    #[arg(long, default_value_t = 0.0)]
    threshold: f64,
    #[arg(long, default_value_t = 4)]
    num_workers: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Do not write checkpoints.
    #[arg(long)]
    no_save: bool,
    #[arg(long, default_value = "checkpoints")]
    save_path: PathBuf,
    #[arg(long, default_value_t = 150)]
    upload_after_epoch: usize,
    /// Freeze the backbone; only per-level parameters train.
    #[arg(long)]
    freeze: bool,
    #[arg(long, default_value_t = 100)]
    log_every: usize,
    /// Skip metrics and artefact tracking.
    #[arg(long)]
    no_tracking: bool,
    /// Skip quantiser curve dumps.
    #[arg(long)]
    no_curves: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    checkpoint: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Inspect(args) => cmd_inspect(args),
    }
}

// ── Command implementations ─────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut model_config = if args.model_config.exists() {
        ModelConfig::load(&args.model_config)?
    } else {
        let default = ModelConfig::default();
        default.save(&args.model_config)?;
        eprintln!("Created default model config at {}", args.model_config.display());
        default
    };
    model_config.kind = args.model;

    let config = RunConfig {
        run_name: args.run_name.clone(),
        model: model_config,
        trainer: TrainerConfig {
            epochs: args.epochs,
            lr: args.lr,
            aux_lr: args.aux_lr,
            batch_size: args.batch_size,
            test_batch_size: args.test_batch_size,
            patch_size: args.patch_size,
            clip_max_norm: args.clip_max_norm,
            patience: args.patience,
            factor: args.factor,
            threshold: args.threshold,
            num_workers: args.num_workers,
            seed: args.seed,
            save: !args.no_save,
            save_path: args.save_path.clone(),
            upload_after_epoch: args.upload_after_epoch,
            freeze: args.freeze,
            log_every: args.log_every,
            ..Default::default()
        },
        data: DataConfig {
            dataset: args.dataset.clone(),
            test_dataset: args.test_dataset.clone(),
            num_images: args.num_images,
            num_images_val: args.num_images_val,
        },
        lambda_list: parse_lambda_list(&args.lambda_list)?,
        checkpoint: args.checkpoint.clone(),
        continue_train: args.continue_train,
    };
    config.validate()?;
    config.data.check_paths()?;

    let (train, valid, test) = open_splits(&config)?;
    eprintln!(
        "Images: {} train, {} validation, {} test",
        train.len(),
        valid.len(),
        test.len()
    );

    let device = Device::cuda_if_available(0)?;
    let levels = config.rate_levels()?;
    let bundle = build_model(&config.model, &levels, &device)?;
    eprintln!(
        "Model: {} ({} trainable scalars, {} rate levels)",
        config.model.kind.as_str(),
        bundle.model.active_parameter_count(),
        levels.len()
    );

    let paths = CheckpointPaths::resolve(&config.trainer.save_path, &config)?;
    let tracker: Arc<dyn ExperimentTracker> = if args.no_tracking {
        Arc::new(NullTracker)
    } else {
        Arc::new(LocalTracker::create(&paths.dir.join("tracking"))?)
    };
    let hook: Box<dyn VisualizationHook> = if args.no_curves {
        Box::new(NoopHook)
    } else {
        bundle.curve_hook(&paths.dir.join("sos"))?
    };

    let parts = Collaborators {
        model: bundle.model,
        loss: MseRateDistortion,
        annealing: bundle.annealing,
        train,
        valid,
        test,
        tracker,
        hook,
    };
    let mut orchestrator = TrainingOrchestrator::new(config, parts, device)?;
    let summary = orchestrator.run()?;
    eprintln!(
        "Finished {} epochs: best aggregate loss {:.4}, {} steps. Checkpoints in {}",
        summary.epochs_run,
        summary.best_loss,
        summary.global_step,
        paths.dir.display()
    );
    Ok(())
}

type Split = Box<dyn BatchProvider>;

fn open_splits(config: &RunConfig) -> Result<(Split, Split, Split)> {
    let t = &config.trainer;
    let loader = |dir: &Path, limit: usize, batch_size: usize, crop: Crop, shuffle: bool| -> Result<Split> {
        let folder = ImageFolder::open(dir, limit)
            .with_context(|| format!("open image folder {}", dir.display()))?;
        let split = DataLoader::new(
            folder,
            LoaderConfig {
                batch_size,
                crop,
                shuffle,
                seed: t.seed,
                num_workers: t.num_workers,
            },
        )?;
        Ok(Box::new(split))
    };
    let train = loader(
        &config.data.train_dir(),
        config.data.num_images,
        t.batch_size,
        Crop::Random(t.patch_size),
        true,
    )?;
    let valid = loader(
        &config.data.valid_dir(),
        config.data.num_images_val,
        t.test_batch_size,
        Crop::Center(t.patch_size),
        false,
    )?;
    // Full-resolution images differ in size, so they go one at a time.
    let test = loader(
        &config.data.test_dataset,
        0,
        1,
        Crop::Align(SPATIAL_ALIGN),
        false,
    )?;
    Ok((train, valid, test))
}

// ── Inspect ─────────────────────────────────────────────────────────────────

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let record = CheckpointRecord::load(&args.checkpoint, &Device::Cpu)?;
    let json = serde_json::to_string_pretty(&record.meta)?;
    println!("{json}");
    let mut names: Vec<&String> = record.tensors.keys().collect();
    names.sort();
    eprintln!("{} tensors:", names.len());
    for name in names {
        eprintln!("  {name} {:?}", record.tensors[name].dims());
    }
    Ok(())
}
