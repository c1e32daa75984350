use std::path::PathBuf;

use thiserror::Error;

/// Raised from deep inside the training loop to end the run early.
///
/// It travels through ordinary `anyhow::Result` channels and is recognised
/// at the top level with `downcast_ref`, where it is printed and the process
/// exits successfully.
#[derive(Debug, Error)]
#[error("Training stopped at epoch {epoch}: {reason}")]
pub struct StopTraining {
    pub epoch: usize,
    pub reason: String,
}

impl StopTraining {
    pub fn new(epoch: usize, reason: impl Into<String>) -> Self {
        Self {
            epoch,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No such file or directory: '{}'", path.display())]
    NotFound { path: PathBuf },

    #[error("Invalid checkpoint '{}': {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CheckpointError {
    /// NotFound and Corrupt abort training gracefully; everything else is a crash.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Corrupt { .. })
    }
}

/// Walks an error chain looking for the stop signal.
pub fn find_stop(err: &anyhow::Error) -> Option<&StopTraining> {
    err.chain().find_map(|cause| cause.downcast_ref::<StopTraining>())
}
