pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod paths;
pub mod preprocess;
pub mod preview;
pub mod progress;
pub mod scheduler;
pub mod spectrogram;
pub mod train;
