//! Turns a subset CSV of `(mix, source)` audio pairs into cached
//! spectrogram archives plus an index CSV the training loop reads.

use std::fs::{self, File};
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use blake2::{Blake2s256, Digest};
use indicatif::ProgressBar;
use ndarray::{s, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};

use crate::audio::load_for_model;
use crate::paths::{resolve_under, ExpandHome};
use crate::progress::progress_style;
use crate::spectrogram::{Stft, HOP_LENGTH, N_FFT, SAMPLE_RATE};

/// One row of the subset CSV handed to `preprocess`.
#[derive(Clone, Debug, Deserialize)]
pub struct SubsetRow {
    #[serde(alias = "mix_path", alias = "mixture")]
    pub mix: String,
    #[serde(alias = "source_path", alias = "target")]
    pub source: String,
}

/// One row of the processed CSV consumed by `train`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRow {
    pub mix_path: String,
    pub source_path: String,
    pub cache_path: String,
    pub bins: usize,
    pub frames: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub written: usize,
    pub skipped: usize,
}

/// Spectrogram pair stored in one cache archive.
#[derive(Debug, Clone)]
pub struct CachedPair {
    pub mix: Array2<f32>,
    pub source: Array2<f32>,
}

pub fn prepare_dataset(
    data_path: &str,
    data_subset: &str,
    out_dir: &str,
    processed_csv_dir: &str,
    overwrite: bool,
) -> anyhow::Result<PrepareReport> {
    let data_root = data_path.expand_home();
    if !data_root.is_dir() {
        anyhow::bail!("Data directory does not exist: {}", data_root.display());
    }
    let subset_path = data_subset.expand_home();
    let rows = read_subset(&subset_path)?;
    if rows.is_empty() {
        anyhow::bail!("Subset CSV lists no tracks: {}", subset_path.display());
    }

    let cache_root = out_dir.expand_home();
    fs::create_dir_all(&cache_root)
        .with_context(|| format!("Failed to create cache root: {}", cache_root.display()))?;

    tracing::info!(
        tracks = rows.len(),
        cache = %cache_root.display(),
        "preprocessing dataset"
    );

    let stft = Stft::new(N_FFT, HOP_LENGTH)?;
    let started = Instant::now();
    let progress = ProgressBar::new(rows.len() as u64);
    progress.set_style(progress_style());

    let mut report = PrepareReport::default();
    let mut processed = Vec::with_capacity(rows.len());
    for row in &rows {
        let mix_path = resolve_under(&data_root, &row.mix);
        let source_path = resolve_under(&data_root, &row.source);
        let cache_file = cache_root.join(cache_file_name(&mix_path, &source_path));
        progress.set_message(short_name(&mix_path));

        let (bins, frames) = match read_cached_shape(&cache_file) {
            Some(shape) if !overwrite => {
                report.skipped += 1;
                shape
            }
            _ => {
                let pair = encode_pair(&stft, &mix_path, &source_path)?;
                let shape = pair.mix.dim();
                save_cached_pair(&cache_file, &pair)?;
                report.written += 1;
                shape
            }
        };

        processed.push(ProcessedRow {
            mix_path: mix_path.to_string_lossy().into_owned(),
            source_path: source_path.to_string_lossy().into_owned(),
            cache_path: cache_file.to_string_lossy().into_owned(),
            bins,
            frames,
        });
        progress.inc(1);
    }
    progress.finish_and_clear();

    let csv_path = processed_csv_dir.expand_home();
    write_processed_index(&csv_path, &processed)?;

    println!(
        "Preprocessing complete: total={} written={} skipped={} elapsed={:.1}s",
        rows.len(),
        report.written,
        report.skipped,
        started.elapsed().as_secs_f64()
    );
    println!("Processed index written to: {}", csv_path.display());
    Ok(report)
}

pub fn read_subset(path: &Path) -> anyhow::Result<Vec<SubsetRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open subset CSV: {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<SubsetRow>, _>>()
        .with_context(|| format!("Malformed subset CSV: {}", path.display()))
}

pub fn write_processed_index(path: &Path, rows: &[ProcessedRow]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create processed CSV: {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed writing processed CSV: {}", path.display()))?;
    Ok(())
}

pub fn read_processed_index(path: &Path) -> anyhow::Result<Vec<ProcessedRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open processed CSV: {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<ProcessedRow>, _>>()
        .with_context(|| format!("Malformed processed CSV: {}", path.display()))
}

/// Decodes both files and returns their spectrograms scaled by the mix peak.
pub fn encode_pair(stft: &Stft, mix_path: &Path, source_path: &Path) -> anyhow::Result<CachedPair> {
    let mix_audio = load_for_model(mix_path, SAMPLE_RATE)?;
    let source_audio = load_for_model(source_path, SAMPLE_RATE)?;

    let mix = stft.magnitude(&mix_audio.samples)?;
    let source = stft.magnitude(&source_audio.samples)?;

    let frames = mix.ncols().min(source.ncols());
    let mut mix = mix.slice(s![.., ..frames]).to_owned();
    let mut source = source.slice(s![.., ..frames]).to_owned();

    let peak = mix.iter().copied().fold(0f32, f32::max);
    if peak > 0.0 {
        mix.mapv_inplace(|v| v / peak);
        source.mapv_inplace(|v| v / peak);
    } else {
        tracing::warn!(mix = %mix_path.display(), "mix is silent, storing unscaled");
    }

    Ok(CachedPair { mix, source })
}

/// `<track dir>_<8-byte blake2 of both paths>.npz`, stable across runs.
///
/// The track directory is the parent folder of the mix, or the mix file stem
/// when the mix sits at the top level.
pub fn cache_file_name(mix_path: &Path, source_path: &Path) -> String {
    let key = format!(
        "{}|{}",
        mix_path.to_string_lossy(),
        source_path.to_string_lossy()
    );
    let mut hasher = Blake2s256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let stem = mix_path
        .parent()
        .and_then(|parent| parent.file_name())
        .or_else(|| mix_path.file_stem())
        .and_then(|name| name.to_str())
        .unwrap_or("track");
    let stem: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{stem}_{}.npz", hex::encode(&digest[..8]))
}

pub fn save_cached_pair(cache_file: &Path, pair: &CachedPair) -> anyhow::Result<()> {
    if let Some(parent) = cache_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
    }
    let file = File::create(cache_file)
        .with_context(|| format!("Failed to create cache file: {}", cache_file.display()))?;
    let mut npz = NpzWriter::new(file);
    npz.add_array("mix", &pair.mix)
        .context("Failed writing 'mix' to cache")?;
    npz.add_array("source", &pair.source)
        .context("Failed writing 'source' to cache")?;
    npz.finish().context("Failed finalizing cache npz")?;
    Ok(())
}

pub fn load_cached_pair(cache_file: &Path) -> anyhow::Result<CachedPair> {
    let file = File::open(cache_file)
        .with_context(|| format!("Failed to open cache file: {}", cache_file.display()))?;
    let mut npz = NpzReader::new(file)
        .with_context(|| format!("Not an npz archive: {}", cache_file.display()))?;
    let mix: Array2<f32> = read_member(&mut npz, "mix")
        .with_context(|| format!("Missing 'mix' in {}", cache_file.display()))?;
    let source: Array2<f32> = read_member(&mut npz, "source")
        .with_context(|| format!("Missing 'source' in {}", cache_file.display()))?;
    if mix.dim() != source.dim() {
        anyhow::bail!(
            "Cache entry has mismatched shapes {:?} vs {:?}: {}",
            mix.dim(),
            source.dim(),
            cache_file.display()
        );
    }
    Ok(CachedPair { mix, source })
}

fn read_member(npz: &mut NpzReader<File>, name: &str) -> anyhow::Result<Array2<f32>> {
    match npz.by_name(&format!("{name}.npy")) {
        Ok(arr) => Ok(arr),
        Err(_) => Ok(npz.by_name(name)?),
    }
}

fn read_cached_shape(cache_file: &Path) -> Option<(usize, usize)> {
    if !cache_file.exists() {
        return None;
    }
    load_cached_pair(cache_file).ok().map(|pair| pair.mix.dim())
}

fn short_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
