use std::path::{Path, PathBuf};

use anyhow::Context;
use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::preprocess::{load_cached_pair, read_processed_index, ProcessedRow};
use crate::spectrogram::FREQ_BINS;

/// Frames per training patch; divisible by `2^model::DEPTH`.
pub const PATCH_FRAMES: usize = 128;

#[derive(Clone, Debug)]
pub struct TrackSample {
    pub cache_path: PathBuf,
    pub frames: usize,
}

#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub bins: usize,
    pub patch_frames: usize,
    /// Pick a random patch offset instead of starting at frame 0.
    pub random_offset: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            bins: FREQ_BINS,
            patch_frames: PATCH_FRAMES,
            random_offset: true,
        }
    }
}

#[derive(Debug)]
pub struct SampleTensors {
    pub mix: Vec<f32>,
    pub source: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct SpectrogramDataset {
    pub samples: Vec<TrackSample>,
    pub cfg: DatasetConfig,
}

impl SpectrogramDataset {
    pub fn new(samples: Vec<TrackSample>, cfg: DatasetConfig) -> anyhow::Result<Self> {
        if samples.is_empty() {
            anyhow::bail!("No samples were provided");
        }
        Ok(Self { samples, cfg })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn patch_len(&self) -> usize {
        self.cfg.bins * self.cfg.patch_frames
    }

    /// Reads one cached track and cuts a `(bins, patch_frames)` window from it.
    pub fn load_item(&self, index: usize, rng: &mut StdRng) -> anyhow::Result<SampleTensors> {
        let sample = self
            .samples
            .get(index)
            .with_context(|| format!("Sample index out of bounds: {index}"))?;

        let pair = load_cached_pair(&sample.cache_path)?;
        let (bins, frames) = pair.mix.dim();
        if bins != self.cfg.bins {
            anyhow::bail!(
                "Cache entry has {bins} frequency bins, expected {}: {}",
                self.cfg.bins,
                sample.cache_path.display()
            );
        }

        let max_offset = frames.saturating_sub(self.cfg.patch_frames);
        let offset = if self.cfg.random_offset && max_offset > 0 {
            rng.random_range(0..=max_offset)
        } else {
            0
        };

        Ok(SampleTensors {
            mix: crop_patch(&pair.mix, offset, self.cfg.patch_frames),
            source: crop_patch(&pair.source, offset, self.cfg.patch_frames),
        })
    }
}

/// Row-major `(bins, width)` window starting at `offset`, zero padded past the end.
fn crop_patch(spec: &Array2<f32>, offset: usize, width: usize) -> Vec<f32> {
    let (bins, frames) = spec.dim();
    let end = (offset + width).min(frames);
    let mut patch = Array2::<f32>::zeros((bins, width));
    if offset < end {
        patch
            .slice_mut(s![.., ..(end - offset)])
            .assign(&spec.slice(s![.., offset..end]));
    }
    patch.into_raw_vec_and_offset().0
}

pub fn discover_samples(index_csv: &Path) -> anyhow::Result<Vec<TrackSample>> {
    if !index_csv.exists() {
        anyhow::bail!("Processed CSV does not exist: {}", index_csv.display());
    }
    let rows = read_processed_index(index_csv)?;
    let base = index_csv.parent().unwrap_or_else(|| Path::new("."));
    Ok(rows
        .into_iter()
        .map(|row: ProcessedRow| {
            let cache_path = PathBuf::from(&row.cache_path);
            let cache_path = if cache_path.exists() || cache_path.is_absolute() {
                cache_path
            } else {
                base.join(cache_path)
            };
            TrackSample {
                cache_path,
                frames: row.frames,
            }
        })
        .collect())
}

pub fn split_samples(
    mut samples: Vec<TrackSample>,
    val_fraction: f32,
    seed: u64,
) -> anyhow::Result<(Vec<TrackSample>, Vec<TrackSample>)> {
    if !(0.0..1.0).contains(&val_fraction) {
        anyhow::bail!("--val_fraction must be in [0, 1), got {val_fraction}");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    if val_fraction == 0.0 || samples.len() < 2 {
        return Ok((samples, Vec::new()));
    }

    let len = samples.len();
    let val_count = (((len as f32) * val_fraction).floor() as usize).clamp(1, len - 1);
    let train_count = len - val_count;
    let val_samples = samples.split_off(train_count);
    Ok((samples, val_samples))
}
