use std::path::Path;

use crate::config::{Mode, PreprocessConfig, TrainConfig};
use crate::error::CheckpointError;
use crate::model::Generator;
use crate::paths::ExpandHome;
use crate::preprocess::prepare_dataset;
use crate::train::{resolve_device, train, TrainRequest};

/// Channels of the spectrogram fed to the generator.
pub const INPUT_CHANNELS: usize = 1;

pub const BAD_PRETRAINED_MESSAGE: &str = "The pretrained model path is not correct!";

/// The collaborators the dispatcher drives.
pub trait Pipeline {
    type Model;

    fn prepare_dataset(&mut self, cfg: &PreprocessConfig) -> anyhow::Result<()>;

    fn build_model(&mut self, channels: usize, gpu: bool) -> anyhow::Result<Self::Model>;

    fn load_pretrained(
        &mut self,
        model: &mut Self::Model,
        path: &Path,
    ) -> Result<(), CheckpointError>;

    fn train(&mut self, model: Self::Model, request: TrainRequest) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Preprocessed,
    Trained,
    /// The pretrained checkpoint was missing or unreadable; training never started.
    PretrainedRejected,
    /// No subcommand was given.
    Idle,
}

pub fn dispatch<P: Pipeline>(mode: Option<Mode>, pipeline: &mut P) -> anyhow::Result<Outcome> {
    match mode {
        Some(Mode::Preprocess(cfg)) => {
            cfg.validate()?;
            pipeline.prepare_dataset(&cfg)?;
            Ok(Outcome::Preprocessed)
        }
        Some(Mode::Train(cfg)) => run_train(&cfg, pipeline),
        None => Ok(Outcome::Idle),
    }
}

fn run_train<P: Pipeline>(cfg: &TrainConfig, pipeline: &mut P) -> anyhow::Result<Outcome> {
    cfg.validate()?;
    let mut model = pipeline.build_model(INPUT_CHANNELS, cfg.use_gpu())?;

    if !cfg.pretrained_model.is_empty() {
        let path = cfg.pretrained_model.expand_home();
        match pipeline.load_pretrained(&mut model, &path) {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                println!("{err}");
                println!("{BAD_PRETRAINED_MESSAGE}");
                return Ok(Outcome::PretrainedRejected);
            }
            Err(CheckpointError::Other(err)) => return Err(err),
            Err(err) => return Err(err.into()),
        }
    }

    pipeline.train(model, TrainRequest::from_config(cfg))?;
    Ok(Outcome::Trained)
}

/// The real pipeline: audio preprocessing and Candle training.
#[derive(Debug, Default)]
pub struct CandlePipeline;

impl Pipeline for CandlePipeline {
    type Model = Generator;

    fn prepare_dataset(&mut self, cfg: &PreprocessConfig) -> anyhow::Result<()> {
        prepare_dataset(
            &cfg.data_path,
            &cfg.data_subset,
            &cfg.out_dir,
            &cfg.processed_csv_dir,
            cfg.overwrite,
        )?;
        Ok(())
    }

    fn build_model(&mut self, channels: usize, gpu: bool) -> anyhow::Result<Generator> {
        let device = resolve_device(gpu);
        Ok(Generator::new(channels, &device)?)
    }

    fn load_pretrained(
        &mut self,
        model: &mut Generator,
        path: &Path,
    ) -> Result<(), CheckpointError> {
        model.load_pretrained(path)
    }

    fn train(&mut self, model: Generator, request: TrainRequest) -> anyhow::Result<()> {
        train(model, &request)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder, VarMap};
    use clap::Parser;

    use super::*;
    use crate::checkpoint;
    use crate::config::Cli;
    use crate::error::StopTraining;
    use crate::scheduler::SchedulerKind;

    /// Records collaborator calls; checkpoints go through the real loader.
    #[derive(Default)]
    struct RecordingPipeline {
        prepared: Vec<PreprocessConfig>,
        built: Vec<(usize, bool)>,
        trained: Vec<TrainRequest>,
        stop_on_train: bool,
    }

    impl Pipeline for RecordingPipeline {
        type Model = VarMap;

        fn prepare_dataset(&mut self, cfg: &PreprocessConfig) -> anyhow::Result<()> {
            self.prepared.push(cfg.clone());
            Ok(())
        }

        fn build_model(&mut self, channels: usize, gpu: bool) -> anyhow::Result<VarMap> {
            self.built.push((channels, gpu));
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            vb.get_with_hints((channels, 2), "head.weight", Init::Const(0.0))?;
            Ok(varmap)
        }

        fn load_pretrained(
            &mut self,
            model: &mut VarMap,
            path: &Path,
        ) -> Result<(), CheckpointError> {
            checkpoint::load_into(model, path, &Device::Cpu)
        }

        fn train(&mut self, _model: VarMap, request: TrainRequest) -> anyhow::Result<()> {
            self.trained.push(request);
            if self.stop_on_train {
                return Err(StopTraining::new(1, "requested").into());
            }
            Ok(())
        }
    }

    fn mode(args: &[&str]) -> Option<Mode> {
        Cli::try_parse_from(std::iter::once("scunet").chain(args.iter().copied()))
            .unwrap()
            .mode
    }

    #[test]
    fn preprocess_forwards_paths() {
        let mut pipeline = RecordingPipeline::default();
        let outcome = dispatch(
            mode(&["preprocess", "-d", "/data", "-s", "s.csv", "-o", "cache", "-p", "p.csv"]),
            &mut pipeline,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Preprocessed);
        assert_eq!(pipeline.prepared.len(), 1);
        let cfg = &pipeline.prepared[0];
        assert_eq!(
            (
                cfg.data_path.as_str(),
                cfg.data_subset.as_str(),
                cfg.out_dir.as_str(),
                cfg.processed_csv_dir.as_str()
            ),
            ("/data", "s.csv", "cache", "p.csv")
        );
        assert!(pipeline.trained.is_empty());
    }

    #[test]
    fn train_without_pretrained_runs_once_with_forwarded_values() {
        let mut pipeline = RecordingPipeline::default();
        let outcome = dispatch(
            mode(&[
                "train",
                "-d",
                "processed.csv",
                "-e",
                "12",
                "--lr",
                "0.0005",
                "--batch_size",
                "4",
                "--model_weight_name",
                "w.safetensors",
                "--log_dir",
                "logs",
                "--log_name",
                "exp",
                "--train_info_file",
                "info.json",
            ]),
            &mut pipeline,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Trained);
        assert_eq!(pipeline.built, vec![(INPUT_CHANNELS, true)]);
        assert_eq!(pipeline.trained.len(), 1);

        let req = &pipeline.trained[0];
        assert_eq!(req.data_path, "processed.csv");
        assert_eq!(req.epochs, 12);
        assert_eq!(req.lr, Some(0.0005));
        assert_eq!(req.batch_size, 4);
        assert_eq!(req.model_weight_name, "w.safetensors");
        assert_eq!(req.log_dir.as_deref(), Some("logs"));
        assert_eq!(req.log_name.as_deref(), Some("exp"));
        assert_eq!(req.train_info_file.as_deref(), Some("info.json"));
        assert!(req.gpu);
        assert!(matches!(req.scheduler, SchedulerKind::StepLr { .. }));
    }

    #[test]
    fn missing_pretrained_file_aborts_training() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.safetensors");
        let mut pipeline = RecordingPipeline::default();
        let outcome = dispatch(
            mode(&[
                "train",
                "-d",
                "p.csv",
                "--pretrained_model",
                missing.to_str().unwrap(),
            ]),
            &mut pipeline,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::PretrainedRejected);
        assert!(pipeline.trained.is_empty());
    }

    #[test]
    fn corrupt_pretrained_file_aborts_training() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("weights.safetensors");
        fs::write(&garbage, b"\x80\x04 not safetensors").unwrap();
        let mut pipeline = RecordingPipeline::default();
        let outcome = dispatch(
            mode(&[
                "train",
                "-d",
                "p.csv",
                "--cpu",
                "--pretrained_model",
                garbage.to_str().unwrap(),
            ]),
            &mut pipeline,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::PretrainedRejected);
        assert_eq!(pipeline.built, vec![(INPUT_CHANNELS, false)]);
        assert!(pipeline.trained.is_empty());
    }

    #[test]
    fn valid_pretrained_file_is_loaded_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let mut pipeline = RecordingPipeline::default();
        let saved = pipeline.build_model(INPUT_CHANNELS, false).unwrap();
        checkpoint::save(&saved, &path).unwrap();
        pipeline.built.clear();

        let outcome = dispatch(
            mode(&["train", "-d", "p.csv", "--pretrained_model", path.to_str().unwrap()]),
            &mut pipeline,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::Trained);
        assert_eq!(pipeline.trained.len(), 1);
    }

    #[test]
    fn incompatible_pretrained_file_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let other = VarMap::new();
        let vb = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu);
        vb.get_with_hints((7,), "head.weight", Init::Const(1.0))
            .unwrap();
        checkpoint::save(&other, &path).unwrap();

        let mut pipeline = RecordingPipeline::default();
        let result = dispatch(
            mode(&["train", "-d", "p.csv", "--pretrained_model", path.to_str().unwrap()]),
            &mut pipeline,
        );
        assert!(result.is_err());
        assert!(pipeline.trained.is_empty());
    }

    #[test]
    fn stop_signal_reaches_the_caller() {
        let mut pipeline = RecordingPipeline {
            stop_on_train: true,
            ..Default::default()
        };
        let err = dispatch(mode(&["train", "-d", "p.csv"]), &mut pipeline).unwrap_err();
        assert!(crate::error::find_stop(&err).is_some());
    }

    #[test]
    fn invalid_options_never_reach_collaborators() {
        let mut pipeline = RecordingPipeline::default();
        let result = dispatch(
            mode(&["train", "-d", "p.csv", "--batch_size", "0"]),
            &mut pipeline,
        );
        assert!(result.is_err());
        assert!(pipeline.built.is_empty());
        assert!(pipeline.trained.is_empty());
    }

    #[test]
    fn no_mode_does_nothing() {
        let mut pipeline = RecordingPipeline::default();
        assert_eq!(dispatch(None, &mut pipeline).unwrap(), Outcome::Idle);
        assert!(pipeline.prepared.is_empty() && pipeline.trained.is_empty());
    }
}
