use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use chrono::Utc;
use indicatif::ProgressBar;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::config::TrainConfig;
use crate::dataset::{
    discover_samples, split_samples, DatasetConfig, SpectrogramDataset, TrackSample,
};
use crate::error::{find_stop, StopTraining};
use crate::model::Generator;
use crate::paths::ExpandHome;
use crate::preview::save_preview_montage;
use crate::progress::progress_style;
use crate::scheduler::{SchedulerKind, StepLr};

pub const DEFAULT_LR: f64 = 1e-4;
pub const DEFAULT_LOG_DIR: &str = "runs";

/// Everything the training loop needs besides the model itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainRequest {
    pub data_path: String,
    pub scheduler: SchedulerKind,
    pub gpu: bool,
    pub epochs: usize,
    pub lr: Option<f64>,
    pub batch_size: usize,
    pub model_weight_name: String,
    pub log_dir: Option<String>,
    pub log_name: Option<String>,
    pub train_info_file: Option<String>,
    pub val_fraction: f32,
    pub seed: u64,
    pub patience: usize,
    pub log_every_batches: usize,
    pub preview_samples: usize,
}

impl TrainRequest {
    pub fn from_config(cfg: &TrainConfig) -> Self {
        Self {
            data_path: cfg.data_path.clone(),
            scheduler: SchedulerKind::StepLr {
                step_size: cfg.step_size,
                gamma: cfg.gamma,
            },
            gpu: cfg.use_gpu(),
            epochs: cfg.epochs,
            lr: cfg.lr,
            batch_size: cfg.batch_size,
            model_weight_name: cfg.model_weight_name.clone(),
            log_dir: cfg.log_dir.clone(),
            log_name: cfg.log_name.clone(),
            train_info_file: cfg.train_info_file.clone(),
            val_fraction: cfg.val_fraction,
            seed: cfg.seed,
            patience: cfg.patience,
            log_every_batches: cfg.log_every_batches,
            preview_samples: cfg.preview_samples,
        }
    }

    pub fn base_lr(&self) -> f64 {
        self.lr.unwrap_or(DEFAULT_LR)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub lr: f64,
    pub train: EpochMetrics,
    pub val: EpochMetrics,
    pub epoch_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainInfo {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub device: String,
    pub started_at: String,
    pub train_tracks: usize,
    pub val_tracks: usize,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub model_weights: PathBuf,
    pub stopped_early: Option<String>,
    pub history: Vec<EpochSummary>,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum MetricRecord<'a> {
    Step {
        step: usize,
        epoch: usize,
        loss: f64,
        rmse: f64,
        lr: f64,
    },
    Epoch(&'a EpochSummary),
}

/// Appends one JSON object per line to `metrics.jsonl` in the run directory.
struct MetricsLog {
    writer: BufWriter<File>,
}

impl MetricsLog {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed creating metrics log: {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn record(&mut self, record: &MetricRecord<'_>) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Tracks the best validation loss and how long it has gone unimproved.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: f64,
    best_epoch: usize,
    stale_epochs: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f64::INFINITY,
            best_epoch: 0,
            stale_epochs: 0,
        }
    }

    /// Returns true when `val_loss` is a new best.
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> bool {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = epoch;
            self.stale_epochs = 0;
            true
        } else {
            self.stale_epochs += 1;
            false
        }
    }

    /// Patience 0 never stops.
    pub fn exhausted(&self) -> bool {
        self.patience > 0 && self.stale_epochs >= self.patience
    }

    pub fn stop_signal(&self, epoch: usize) -> StopTraining {
        StopTraining::new(
            epoch,
            format!(
                "validation loss has not improved for {} epochs (best {:.5} at epoch {})",
                self.stale_epochs, self.best_loss, self.best_epoch
            ),
        )
    }
}

struct Trainer<'a> {
    model: &'a Generator,
    req: &'a TrainRequest,
    device: Device,
    train_dataset: SpectrogramDataset,
    val_dataset: SpectrogramDataset,
    preview_dataset: Option<SpectrogramDataset>,
    optimizer: AdamW,
    scheduler: StepLr,
    rng: StdRng,
    metrics_log: MetricsLog,
    previews_dir: PathBuf,
    weights_path: PathBuf,
    best_meta: PathBuf,
    last_weights: PathBuf,
    global_step: usize,
    early_stopping: EarlyStopping,
    info: TrainInfo,
}

pub fn train(model: Generator, req: &TrainRequest) -> anyhow::Result<TrainInfo> {
    let index_path = req.data_path.expand_home();
    let all_samples = discover_samples(&index_path)?;
    if all_samples.is_empty() {
        anyhow::bail!("Processed CSV lists no tracks: {}", index_path.display());
    }

    let (train_samples, val_samples) = split_samples(all_samples, req.val_fraction, req.seed)?;
    println!(
        "Discovered {} tracks: train={}, val={}",
        train_samples.len() + val_samples.len(),
        train_samples.len(),
        val_samples.len()
    );
    let total_frames: usize = train_samples.iter().map(|s| s.frames).sum();
    tracing::debug!(total_frames, "training frames available");

    let eval_cfg = DatasetConfig {
        random_offset: false,
        ..DatasetConfig::default()
    };
    let train_dataset = SpectrogramDataset::new(train_samples.clone(), DatasetConfig::default())?;
    let eval_source = if val_samples.is_empty() {
        train_samples
    } else {
        val_samples.clone()
    };
    let val_dataset = SpectrogramDataset::new(eval_source.clone(), eval_cfg.clone())?;
    let preview_count = req.preview_samples.min(eval_source.len());
    let preview_dataset = if preview_count > 0 {
        Some(SpectrogramDataset::new(
            eval_source
                .into_iter()
                .take(preview_count)
                .collect::<Vec<TrackSample>>(),
            eval_cfg,
        )?)
    } else {
        None
    };

    let device = model.device().clone();
    println!("Using device: {device:?}");
    if req.gpu && device.is_cpu() {
        tracing::warn!("GPU requested but unavailable, training on CPU");
    }
    tracing::info!(parameters = model.parameter_count(), "generator ready");

    let base_lr = req.base_lr();
    let optimizer = AdamW::new(
        model.varmap().all_vars(),
        ParamsAdamW {
            lr: base_lr,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let started_at = Utc::now();
    let run_id = req
        .log_name
        .clone()
        .unwrap_or_else(|| started_at.format("%Y%m%d-%H%M%S").to_string());
    let run_dir = req
        .log_dir
        .as_deref()
        .unwrap_or(DEFAULT_LOG_DIR)
        .expand_home()
        .join(&run_id);
    let previews_dir = run_dir.join("previews");
    fs::create_dir_all(&previews_dir).with_context(|| {
        format!(
            "Failed creating preview directory: {}",
            previews_dir.display()
        )
    })?;

    let config_path = run_dir.join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(req)?)
        .with_context(|| format!("Failed writing config: {}", config_path.display()))?;
    let metrics_log = MetricsLog::create(&run_dir.join("metrics.jsonl"))?;

    let weights_path = req.model_weight_name.expand_home();
    let info = TrainInfo {
        run_id: run_id.clone(),
        run_dir: run_dir.clone(),
        device: format!("{device:?}"),
        started_at: started_at.to_rfc3339(),
        train_tracks: train_dataset.len(),
        val_tracks: val_samples.len(),
        best_epoch: 0,
        best_val_loss: f64::INFINITY,
        model_weights: weights_path.clone(),
        stopped_early: None,
        history: Vec::new(),
    };

    let mut trainer = Trainer {
        model: &model,
        req,
        device,
        train_dataset,
        val_dataset,
        preview_dataset,
        optimizer,
        scheduler: req.scheduler.build(base_lr),
        rng: StdRng::seed_from_u64(req.seed),
        metrics_log,
        previews_dir,
        best_meta: weights_path.with_extension("json"),
        last_weights: last_weights_path(&weights_path),
        weights_path,
        global_step: 0,
        early_stopping: EarlyStopping::new(req.patience),
        info,
    };

    let outcome = trainer.fit();
    let mut info = trainer.info;
    if let Err(err) = &outcome {
        if let Some(stop) = find_stop(err) {
            info.stopped_early = Some(stop.reason.clone());
        }
    }

    if let Some(info_file) = &req.train_info_file {
        write_train_info(&info_file.expand_home(), &info)?;
    }

    outcome?;

    println!("Run ID: {run_id}");
    println!(
        "Best validation loss: {:.5} at epoch {}",
        info.best_val_loss, info.best_epoch
    );
    println!("Model weights written to: {}", info.model_weights.display());
    println!("Logs written to: {}", info.run_dir.display());
    Ok(info)
}

fn write_train_info(path: &Path, info: &TrainInfo) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(path, serde_json::to_string_pretty(info)?)
        .with_context(|| format!("Failed writing training info: {}", path.display()))
}

impl Trainer<'_> {
    fn fit(&mut self) -> anyhow::Result<()> {
        for epoch in 1..=self.req.epochs {
            let epoch_started = Instant::now();
            let lr = self.scheduler.lr_at(epoch);
            self.optimizer.set_learning_rate(lr);

            let train = self.run_epoch(epoch, lr, true)?;
            let val = self.run_epoch(epoch, lr, false)?;

            let summary = EpochSummary {
                epoch,
                lr,
                train,
                val,
                epoch_seconds: epoch_started.elapsed().as_secs_f64(),
            };
            self.metrics_log.record(&MetricRecord::Epoch(&summary))?;
            println!(
                "Epoch {epoch}/{}: train_loss={:.5}, val_loss={:.5}, train_rmse={:.5}, val_rmse={:.5}, lr={:.2e} ({:.1}s)",
                self.req.epochs,
                summary.train.loss,
                summary.val.loss,
                summary.train.rmse,
                summary.val.rmse,
                lr,
                summary.epoch_seconds
            );

            if let Some(preview_dataset) = &self.preview_dataset {
                write_epoch_previews(
                    self.model,
                    preview_dataset,
                    &self.device,
                    &self.previews_dir,
                    epoch,
                )?;
            }

            self.model.save(&self.last_weights)?;

            if self.early_stopping.observe(epoch, summary.val.loss) {
                self.info.best_val_loss = summary.val.loss;
                self.info.best_epoch = epoch;
                self.model.save(&self.weights_path)?;
                fs::write(&self.best_meta, serde_json::to_string_pretty(&summary)?)
                    .with_context(|| {
                        format!(
                            "Failed writing best checkpoint metadata: {}",
                            self.best_meta.display()
                        )
                    })?;
            }
            self.info.history.push(summary);

            if self.early_stopping.exhausted() {
                return Err(self.early_stopping.stop_signal(epoch).into());
            }
        }
        Ok(())
    }

    fn run_epoch(&mut self, epoch: usize, lr: f64, is_training: bool) -> anyhow::Result<EpochMetrics> {
        let dataset = if is_training {
            &self.train_dataset
        } else {
            &self.val_dataset
        };
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if is_training {
            indices.shuffle(&mut self.rng);
        }

        let batch_size = self.req.batch_size;
        let log_every = self.req.log_every_batches;
        let num_batches = indices.len().div_ceil(batch_size);
        let progress = ProgressBar::new(num_batches as u64);
        progress.set_style(progress_style());

        let mut total_abs = 0f64;
        let mut total_sq = 0f64;
        let mut total_batches = 0usize;

        let mut interval_abs = 0f64;
        let mut interval_sq = 0f64;
        let mut interval_batches = 0usize;

        for batch_indices in indices.chunks(batch_size) {
            if is_training {
                self.global_step += 1;
            }

            let (mix, source) = load_batch(dataset, batch_indices, &mut self.rng, &self.device)?;
            let prediction = self.model.forward_t(&mix, is_training)?;

            let diff = prediction.sub(&source)?;
            let loss = diff.abs()?.mean_all()?;
            let loss_value = f64::from(loss.to_scalar::<f32>()?);
            if !loss_value.is_finite() {
                progress.finish_and_clear();
                return Err(StopTraining::new(
                    epoch,
                    format!(
                        "loss became non-finite ({loss_value}) at step {}",
                        self.global_step
                    ),
                )
                .into());
            }

            if is_training {
                self.optimizer.backward_step(&loss)?;
            }

            let sq_value = f64::from(diff.sqr()?.mean_all()?.to_scalar::<f32>()?);
            total_abs += loss_value;
            total_sq += sq_value;
            total_batches += 1;
            interval_abs += loss_value;
            interval_sq += sq_value;
            interval_batches += 1;

            progress.set_message(format!("loss={loss_value:.5}"));
            progress.inc(1);

            if is_training && log_every > 0 && self.global_step % log_every == 0 {
                let loss = interval_abs / interval_batches as f64;
                let rmse = (interval_sq / interval_batches as f64).sqrt();
                tracing::info!(step = self.global_step, loss, rmse, "train");
                self.metrics_log.record(&MetricRecord::Step {
                    step: self.global_step,
                    epoch,
                    loss,
                    rmse,
                    lr,
                })?;
                interval_abs = 0.0;
                interval_sq = 0.0;
                interval_batches = 0;
            }
        }
        progress.finish_and_clear();

        if total_batches == 0 {
            anyhow::bail!("No batches were produced for epoch {epoch}");
        }

        Ok(EpochMetrics {
            loss: total_abs / total_batches as f64,
            rmse: (total_sq / total_batches as f64).sqrt(),
        })
    }
}

fn load_batch(
    dataset: &SpectrogramDataset,
    batch_indices: &[usize],
    rng: &mut StdRng,
    device: &Device,
) -> anyhow::Result<(Tensor, Tensor)> {
    let cpu = Device::Cpu;
    let shape = (1, dataset.cfg.bins, dataset.cfg.patch_frames);
    let mut mix_tensors = Vec::with_capacity(batch_indices.len());
    let mut source_tensors = Vec::with_capacity(batch_indices.len());

    for sample_idx in batch_indices {
        let sample = dataset.load_item(*sample_idx, rng)?;
        let mix = Tensor::from_vec(sample.mix, shape, &cpu).context("Failed to build mix tensor")?;
        let source = Tensor::from_vec(sample.source, shape, &cpu)
            .context("Failed to build source tensor")?;
        mix_tensors.push(mix);
        source_tensors.push(source);
    }

    let mix = Tensor::stack(&mix_tensors, 0)?;
    let source = Tensor::stack(&source_tensors, 0)?;
    Ok((mix.to_device(device)?, source.to_device(device)?))
}

fn write_epoch_previews(
    model: &Generator,
    preview_dataset: &SpectrogramDataset,
    device: &Device,
    preview_root: &Path,
    epoch: usize,
) -> anyhow::Result<()> {
    let epoch_dir = preview_root.join(format!("epoch_{epoch:04}"));
    let mut rng = StdRng::seed_from_u64(0);
    let bins = preview_dataset.cfg.bins;
    let frames = preview_dataset.cfg.patch_frames;

    for index in 0..preview_dataset.len() {
        let sample = preview_dataset.load_item(index, &mut rng)?;
        let input = Tensor::from_vec(sample.mix.clone(), (1, 1, bins, frames), &Device::Cpu)?
            .to_device(device)?;
        let pred = model.forward_t(&input, false)?;
        let pred_map = pred.to_device(&Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;

        let save_path = epoch_dir.join(format!("sample_{index:03}.png"));
        save_preview_montage(&save_path, &sample.mix, &sample.source, &pred_map, bins, frames)?;
    }

    Ok(())
}

/// GPU-preferring: CUDA when requested and available, CPU otherwise.
pub fn resolve_device(gpu: bool) -> Device {
    if !gpu {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(err) => {
            tracing::warn!("CUDA unavailable ({err}), falling back to CPU");
            Device::Cpu
        }
    }
}

/// `weights.safetensors` → `weights_last.safetensors` in the same directory.
pub fn last_weights_path(weights_path: &Path) -> PathBuf {
    let stem = weights_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model_weights".to_string());
    weights_path.with_file_name(format!("{stem}_last.safetensors"))
}
