use std::ffi::OsString;

use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;

pub const DEFAULT_WEIGHT_NAME: &str = "model_weights.safetensors";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "scunet",
    about = "U-Net model for music source separation",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Option<Mode>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Mode {
    /// Decode raw audio once and cache spectrograms for quicker training
    Preprocess(PreprocessConfig),
    /// Train the generator on a preprocessed dataset
    Train(TrainConfig),
}

#[derive(Debug, Clone, Serialize, Args)]
pub struct PreprocessConfig {
    #[arg(short = 'd', long = "data_path", help = "path to your data directory")]
    pub data_path: String,

    #[arg(
        short = 's',
        long = "data_subset",
        help = "path to your CSV file linking paths of mixes and sources"
    )]
    pub data_subset: String,

    #[arg(
        short = 'o',
        long = "out_dir",
        default_value = "./numpy_data",
        help = "Directory to save processed data"
    )]
    pub out_dir: String,

    #[arg(
        short = 'p',
        long = "processed_csv_dir",
        default_value = "./processed_dataset.csv",
        help = "Path to save processed CSV"
    )]
    pub processed_csv_dir: String,

    #[arg(long, default_value_t = false, help = "Re-encode cache entries that already exist")]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Args)]
pub struct TrainConfig {
    #[arg(
        short = 'd',
        long = "data_path",
        help = "path to your preprocessed CSV data file"
    )]
    pub data_path: String,

    #[arg(short = 'e', long, default_value_t = 5, help = "Number of epochs to train")]
    pub epochs: usize,

    #[arg(long, help = "Learning Rate")]
    pub lr: Option<f64>,

    #[arg(long = "batch_size", default_value_t = 3, help = "Batch Size")]
    pub batch_size: usize,

    #[arg(
        long = "model_weight_name",
        default_value = DEFAULT_WEIGHT_NAME,
        help = "file name of Model Weights"
    )]
    pub model_weight_name: String,

    #[arg(long = "log_dir", help = "Dir for logs")]
    pub log_dir: Option<String>,

    #[arg(long = "log_name", help = "Name for this experiment's log")]
    pub log_name: Option<String>,

    #[arg(
        long = "pretrained_model",
        default_value = "",
        help = "file name of PreTrained Weights to be loaded"
    )]
    pub pretrained_model: String,

    #[arg(long = "train_info_file", help = "File to store training info")]
    pub train_info_file: Option<String>,

    #[arg(long, conflicts_with = "gpu", help = "train on CPU")]
    pub cpu: bool,

    #[arg(long, help = "train on GPU")]
    pub gpu: bool,

    #[arg(long = "val_fraction", default_value_t = 0.1)]
    pub val_fraction: f32,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long = "step_size", default_value_t = 10, help = "Epochs between learning rate decays")]
    pub step_size: usize,

    #[arg(long, default_value_t = 0.5, help = "Learning rate decay factor")]
    pub gamma: f64,

    #[arg(
        long,
        default_value_t = 0,
        help = "Stop after this many epochs without validation improvement (0 disables)"
    )]
    pub patience: usize,

    #[arg(long = "log_every_batches", default_value_t = 10)]
    pub log_every_batches: usize,

    #[arg(long = "preview_samples", default_value_t = 2)]
    pub preview_samples: usize,
}

impl TrainConfig {
    /// GPU is preferred unless `--cpu` was given.
    pub fn use_gpu(&self) -> bool {
        !self.cpu
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("--batch_size must be > 0");
        }
        if let Some(lr) = self.lr {
            if !(lr.is_finite() && lr > 0.0) {
                anyhow::bail!("--lr must be a positive number, got {lr}");
            }
        }
        if !(0.0..1.0).contains(&self.val_fraction) {
            anyhow::bail!(
                "--val_fraction must be in [0, 1), got {}",
                self.val_fraction
            );
        }
        if self.step_size == 0 {
            anyhow::bail!("--step_size must be > 0");
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            anyhow::bail!("--gamma must be in (0, 1], got {}", self.gamma);
        }
        if self.model_weight_name.trim().is_empty() {
            anyhow::bail!("--model_weight_name must not be empty");
        }
        Ok(())
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.out_dir.trim().is_empty() {
            anyhow::bail!("--out_dir must not be empty");
        }
        if self.processed_csv_dir.trim().is_empty() {
            anyhow::bail!("--processed_csv_dir must not be empty");
        }
        Ok(())
    }
}

/// What the process should do with its argument list.
#[derive(Debug)]
pub enum Invocation {
    /// No arguments at all: print help to stderr and exit with status 1.
    Usage,
    Run(Cli),
}

pub fn parse_args<I, T>(args: I) -> Result<Invocation, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if args.len() <= 1 {
        return Ok(Invocation::Usage);
    }
    Cli::try_parse_from(args).map(Invocation::Run)
}

pub fn render_help() -> String {
    Cli::command().render_help().to_string()
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    fn run(args: &[&str]) -> Result<Invocation, clap::Error> {
        parse_args(std::iter::once("scunet").chain(args.iter().copied()))
    }

    fn train(args: &[&str]) -> TrainConfig {
        match run(args) {
            Ok(Invocation::Run(Cli {
                mode: Some(Mode::Train(cfg)),
            })) => cfg,
            other => panic!("expected train config, got {other:?}"),
        }
    }

    #[test]
    fn no_arguments_means_usage() {
        assert!(matches!(run(&[]), Ok(Invocation::Usage)));
        assert!(render_help().contains("preprocess"));
    }

    #[test]
    fn preprocess_requires_subset() {
        let err = run(&["preprocess", "-d", "/data"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn preprocess_defaults() {
        let Ok(Invocation::Run(Cli {
            mode: Some(Mode::Preprocess(cfg)),
        })) = run(&["preprocess", "-d", "/data", "-s", "subset.csv"])
        else {
            panic!("expected preprocess config");
        };
        assert_eq!(cfg.data_path, "/data");
        assert_eq!(cfg.data_subset, "subset.csv");
        assert_eq!(cfg.out_dir, "./numpy_data");
        assert_eq!(cfg.processed_csv_dir, "./processed_dataset.csv");
        assert!(!cfg.overwrite);
    }

    #[test]
    fn train_requires_data_path() {
        let err = run(&["train", "-e", "3"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn train_defaults_prefer_gpu() {
        let cfg = train(&["train", "-d", "processed.csv"]);
        assert_eq!(cfg.epochs, 5);
        assert_eq!(cfg.batch_size, 3);
        assert_eq!(cfg.lr, None);
        assert_eq!(cfg.model_weight_name, DEFAULT_WEIGHT_NAME);
        assert_eq!(cfg.pretrained_model, "");
        assert!(cfg.log_dir.is_none() && cfg.log_name.is_none());
        assert!(cfg.train_info_file.is_none());
        assert!(cfg.use_gpu());
        cfg.validate().unwrap();
    }

    #[test]
    fn train_flags_use_snake_case_names() {
        let cfg = train(&[
            "train",
            "--data_path",
            "p.csv",
            "--epochs",
            "7",
            "--lr",
            "0.001",
            "--batch_size",
            "8",
            "--model_weight_name",
            "w.safetensors",
            "--log_dir",
            "logs",
            "--log_name",
            "exp1",
            "--pretrained_model",
            "old.safetensors",
            "--train_info_file",
            "info.json",
            "--cpu",
        ]);
        assert_eq!(cfg.epochs, 7);
        assert_eq!(cfg.lr, Some(0.001));
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.model_weight_name, "w.safetensors");
        assert_eq!(cfg.log_dir.as_deref(), Some("logs"));
        assert_eq!(cfg.log_name.as_deref(), Some("exp1"));
        assert_eq!(cfg.pretrained_model, "old.safetensors");
        assert_eq!(cfg.train_info_file.as_deref(), Some("info.json"));
        assert!(!cfg.use_gpu());
    }

    #[test]
    fn cpu_and_gpu_conflict() {
        let err = run(&["train", "-d", "p.csv", "--cpu", "--gpu"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = train(&["train", "-d", "p.csv"]);
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
        cfg.batch_size = 2;
        cfg.lr = Some(-1.0);
        assert!(cfg.validate().is_err());
        cfg.lr = None;
        cfg.gamma = 0.0;
        assert!(cfg.validate().is_err());
        cfg.gamma = 0.5;
        cfg.val_fraction = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_epochs_is_accepted() {
        let cfg = train(&["train", "-d", "p.csv", "-e", "0"]);
        assert_eq!(cfg.epochs, 0);
        assert!(cfg.validate().is_ok());
    }
}
