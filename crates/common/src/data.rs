//! Data pipeline: image folders, cropping, prefetching batches.
//!
//! Images are decoded to RGB `f32` in \[0, 1\], laid out `(batch, 3, H, W)`.
//!
//! * **[`ImageFolder`]** — sorted list of PNG/JPEG files under a directory.
//! * **[`Crop`]** — random / center patch for train / validation, alignment
//!   crop for full-resolution test images.
//! * **[`DataLoader`]** — one producer thread per pass, decoding each batch on
//!   a rayon pool and feeding a bounded queue the training loop drains.
//! * **[`BatchProvider`]** — the restartable stream contract the trainer and
//!   evaluator consume.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Number of batches decoded ahead of the consumer.
pub const PREFETCH_BUFFER: usize = 8;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

// ── Batches ─────────────────────────────────────────────────────────────────

/// One decoded RGB image, channel-major.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub data: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl DecodedImage {
    fn from_rgb(img: &image::RgbImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let plane = w * h;
        let mut data = vec![0f32; 3 * plane];
        for (x, y, px) in img.enumerate_pixels() {
            let offset = y as usize * w + x as usize;
            for c in 0..3 {
                data[c * plane + offset] = px[c] as f32 / 255.0;
            }
        }
        Self {
            data,
            height: h,
            width: w,
        }
    }
}

/// Immutable batch handed from the loader to the training thread.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub data: Vec<f32>,
    pub batch: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageBatch {
    /// Stack same-sized images into one batch.
    pub fn from_images(images: Vec<DecodedImage>) -> Result<Self> {
        let Some(first) = images.first() else {
            bail!("cannot build an empty batch");
        };
        let (height, width) = (first.height, first.width);
        let mut data = Vec::with_capacity(images.len() * 3 * height * width);
        for img in &images {
            if img.height != height || img.width != width {
                bail!(
                    "images in one batch differ in size: {}x{} vs {}x{}",
                    img.width,
                    img.height,
                    width,
                    height
                );
            }
            data.extend_from_slice(&img.data);
        }
        Ok(Self {
            data,
            batch: images.len(),
            height,
            width,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(&self.data, (self.batch, 3, self.height, self.width), device)
    }
}

// ── Cropping ────────────────────────────────────────────────────────────────

/// How an image is cut down before batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crop {
    /// Uniformly placed square patch (training).
    Random(usize),
    /// Centered square patch (validation).
    Center(usize),
    /// Keep the image, trimming right/bottom edges to a multiple of the value.
    Align(usize),
}

impl Crop {
    /// `(x, y, width, height)` of the window to keep.
    fn window(&self, w: usize, h: usize, rng: &mut impl Rng) -> Result<(usize, usize, usize, usize)> {
        match *self {
            Crop::Random(p) | Crop::Center(p) if w < p || h < p => {
                bail!("image {w}x{h} is smaller than the {p}x{p} patch")
            }
            Crop::Random(p) => Ok((rng.gen_range(0..=w - p), rng.gen_range(0..=h - p), p, p)),
            Crop::Center(p) => Ok(((w - p) / 2, (h - p) / 2, p, p)),
            Crop::Align(a) => {
                let a = a.max(1);
                let (cw, ch) = (w - w % a, h - h % a);
                if cw == 0 || ch == 0 {
                    bail!("image {w}x{h} is smaller than the alignment {a}");
                }
                Ok((0, 0, cw, ch))
            }
        }
    }
}

/// Decode one image file and apply `crop`.
pub fn load_image(path: &Path, crop: Crop, rng: &mut impl Rng) -> Result<DecodedImage> {
    let img = image::open(path)
        .with_context(|| format!("decode image {}", path.display()))?
        .to_rgb8();
    let (x, y, cw, ch) = crop
        .window(img.width() as usize, img.height() as usize, rng)
        .with_context(|| format!("crop image {}", path.display()))?;
    let patch = image::imageops::crop_imm(&img, x as u32, y as u32, cw as u32, ch as u32).to_image();
    Ok(DecodedImage::from_rgb(&patch))
}

// ── ImageFolder ─────────────────────────────────────────────────────────────

/// Image files of one split, sorted by path so index order is stable.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    paths: Vec<PathBuf>,
}

impl ImageFolder {
    /// Collect images under `dir`; `limit > 0` keeps only the first `limit`.
    pub fn open(dir: &Path, limit: usize) -> Result<Self> {
        if !dir.is_dir() {
            bail!("image directory not found: {}", dir.display());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("list {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        paths.sort();
        if limit > 0 {
            paths.truncate(limit);
        }
        if paths.is_empty() {
            bail!("no images found in {}", dir.display());
        }
        Ok(Self { paths })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// ── BatchProvider ───────────────────────────────────────────────────────────

/// Lazy stream of batches for one pass over a split.
pub type BatchStream<'a> = Box<dyn Iterator<Item = Result<ImageBatch>> + 'a>;

/// A restartable dataset split. Each call to [`batches`](Self::batches)
/// starts a fresh pass; `epoch` keys any shuffling so passes are reproducible.
pub trait BatchProvider: Send + Sync {
    /// Number of samples in the split.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(&self, epoch: usize) -> Result<BatchStream<'_>>;
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Loader knobs for one split.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub crop: Crop,
    /// Reorder samples every epoch (training split only).
    pub shuffle: bool,
    pub seed: u64,
    pub num_workers: usize,
}

/// Prefetching loader over an [`ImageFolder`].
pub struct DataLoader {
    folder: Arc<ImageFolder>,
    config: LoaderConfig,
    pool: Arc<rayon::ThreadPool>,
}

impl DataLoader {
    pub fn new(folder: ImageFolder, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            bail!("batch size must be positive");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers.max(1))
            .thread_name(|i| format!("image-decode-{i}"))
            .build()
            .context("build image decode pool")?;
        Ok(Self {
            folder: Arc::new(folder),
            config,
            pool: Arc::new(pool),
        })
    }

    /// Sample order for `epoch`: identity, or a permutation keyed on (seed, epoch).
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.folder.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(mix_seed(self.config.seed, epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }
}

impl BatchProvider for DataLoader {
    fn len(&self) -> usize {
        self.folder.len()
    }

    fn batches(&self, epoch: usize) -> Result<BatchStream<'_>> {
        let order = self.order(epoch);
        let folder = Arc::clone(&self.folder);
        let pool = Arc::clone(&self.pool);
        let crop = self.config.crop;
        let batch_size = self.config.batch_size;
        let epoch_seed = mix_seed(self.config.seed ^ 0x5eed, epoch as u64);

        let (tx, rx) = mpsc::sync_channel::<Result<ImageBatch>>(PREFETCH_BUFFER);
        let producer = thread::Builder::new()
            .name("image-prefetch".into())
            .spawn(move || {
                for chunk in order.chunks(batch_size) {
                    let decoded: Result<Vec<DecodedImage>> = pool.install(|| {
                        chunk
                            .par_iter()
                            .map(|&idx| {
                                let mut rng = StdRng::seed_from_u64(mix_seed(epoch_seed, idx as u64));
                                load_image(&folder.paths()[idx], crop, &mut rng)
                            })
                            .collect()
                    });
                    let batch = decoded.and_then(ImageBatch::from_images);
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        return;
                    }
                }
            })
            .context("spawn prefetch thread")?;

        Ok(Box::new(PrefetchIter {
            rx: Some(rx),
            producer: Some(producer),
        }))
    }
}

/// Consumer side of the prefetch queue. Dropping it stops the producer.
struct PrefetchIter {
    rx: Option<Receiver<Result<ImageBatch>>>,
    producer: Option<JoinHandle<()>>,
}

impl Iterator for PrefetchIter {
    type Item = Result<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let received = self.rx.as_ref()?.recv();
        match received {
            Ok(item) => Some(item),
            Err(_) => {
                self.rx = None;
                match self.producer.take().map(JoinHandle::join) {
                    Some(Err(_)) => Some(Err(anyhow::anyhow!("image prefetch thread panicked"))),
                    _ => None,
                }
            }
        }
    }
}

impl Drop for PrefetchIter {
    fn drop(&mut self) {
        // Closing the receiver first unblocks a producer waiting on a full queue.
        self.rx.take();
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                tracing::warn!("image prefetch thread panicked");
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// SplitMix64 over `seed ^ salt`; derives independent per-epoch / per-sample seeds.
pub fn mix_seed(seed: u64, salt: u64) -> u64 {
    let mut z = seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ── Tests ───────────────────────────────────────────────────────────────────
