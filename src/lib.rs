//! CPM pose training - Rust implementation
//!
//! Training core for a multi-stage convolutional pose machine: a frozen
//! VGG-19 front end feeds a cascade of refinement stages that predict
//! keypoint heatmaps and part-affinity fields.
//!
//! # Architecture
//!
//! - **Prefetch queue**: background workers stack samples into mini-batches
//! - **Graph**: backbone + refinement stages, built once and then executed
//! - **Loss**: deep supervision over every stage
//! - **Optimizer**: Adam with an exponential staircase learning rate
//! - **Checkpoints/telemetry**: safetensors snapshots and JSONL summaries
//!
//! # Example
//!
//! ```ignore
//! use cpm_pose_train::{TrainConfig, training::Trainer, data::SyntheticProducer};
//!
//! let config = TrainConfig::default();
//! let producer = SyntheticProducer::zeros(config.sample_shape(), 100);
//! let mut trainer = Trainer::new(config, Device::Cpu, vec![Box::new(producer)])?;
//! let report = trainer.run()?;
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{LossMode, SampleShape, TrainConfig};
pub use training::{Trainer, TrainingReport};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum PoseError {
    /// Missing/incompatible backbone snapshot or unusable run directory.
    #[error("Startup error: {0}")]
    Startup(String),

    /// A single unusable sample; the producer skips it.
    #[error("Sample error: {0}")]
    Sample(String),

    /// Producer worker crash or queue failure; stops the whole pipeline.
    #[error("Pipeline failure: {0}")]
    Pipeline(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Checkpoint write error: {0}")]
    CheckpointWrite(String),

    #[error("Resume error: {0}")]
    Resume(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PoseError {
    /// Whether the error aborts training (everything except skipped samples
    /// and telemetry hiccups).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PoseError::Sample(_) | PoseError::Telemetry(_))
    }
}

pub type Result<T> = std::result::Result<T, PoseError>;
