//! Error types for slnet-rs.
//!
//! Errors fall in three groups:
//!
//! - configuration errors (`Config`, `ConfigParse`, `Checkpoint`) are raised at
//!   startup, before any training iteration runs;
//! - numeric errors (`Decomposition`, `Candle`) are fatal for the run and are
//!   wrapped in [`SlnetError::Stage`] by the trainer so the offending
//!   stage/epoch/sub-group is visible;
//! - NaN gradients are *not* errors: the trainer skips the step and logs it.
//!
//! # Example
//!
//! ```rust
//! use slnet_rs::{SlnetConfig, SlnetError};
//!
//! # fn main() {
//! match SlnetConfig::from_preset("not-a-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(SlnetError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for slnet-rs operations.
pub type Result<T> = std::result::Result<T, SlnetError>;

/// Errors that can occur in slnet-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SlnetError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Truncated SVD / thresholding failure.
    #[error("decomposition error: {0}")]
    Decomposition(String),

    /// Checkpoint error (malformed file, missing keys, IO during save).
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A fatal error raised inside the training loop.
    #[error("{stage} stage failed at epoch {epoch}, sub-group {subgroup}: {source}")]
    Stage {
        /// Stage name (`train`, `val`, `test`).
        stage: String,
        /// Epoch index.
        epoch: usize,
        /// Sub-group index (0..4).
        subgroup: usize,
        /// Underlying error.
        #[source]
        source: Box<SlnetError>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Safetensors (de)serialization error.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Debug image encoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for SlnetError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        SlnetError::Template(err.to_string())
    }
}

impl SlnetError {
    /// Attach training-loop context to an error.
    pub fn in_stage(self, stage: impl Into<String>, epoch: usize, subgroup: usize) -> Self {
        SlnetError::Stage {
            stage: stage.into(),
            epoch,
            subgroup,
            source: Box::new(self),
        }
    }
}
