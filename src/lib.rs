//! # slnet-rs
//!
//! Ensemble trainer for learned sparse + low-rank decomposition of
//! multi-view microscopy time series.
//!
//! Each volume `[view, depth, H, W]` is cut into four temporal sub-groups.
//! Every sub-group has its own small convolutional estimator that predicts
//! the dense (background) component; a randomized truncated SVD with soft
//! singular-value thresholding keeps that estimate low-rank, and the sparse
//! component is what remains.
//!
//! ## Features
//!
//! - **YAML Configuration** - Whole runs described in one file, with presets
//! - **Rank-constrained decomposition** - Differentiable reconstruction from
//!   a randomized top-`k` basis
//! - **NaN-safe training** - Bad gradients skip the step instead of poisoning
//!   weights or optimizer state
//! - **Hybrid resume** - Checkpoint config plus a whitelist of overrides
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! slnet init config.yaml --preset synthetic-small
//!
//! # Validate it
//! slnet validate config.yaml
//!
//! # Train, or resume with a new learning rate
//! slnet train --config config.yaml
//! slnet train --config config.yaml --checkpoint runs/.../model_10 --learning-rate 5e-5
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use slnet_rs::{EnsembleTrainer, SlnetConfig};
//!
//! # fn main() -> slnet_rs::Result<()> {
//! let mut config = SlnetConfig::from_preset("synthetic-small")?;
//! config.training.max_epochs = 5;
//!
//! let mut trainer = EnsembleTrainer::new(config)?;
//! for summary in trainer.train()? {
//!     println!("{} {}: {:.4}", summary.epoch, summary.stage, summary.aggregates.eigen_crop_ratio);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Decomposing a Batch Directly
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use slnet_rs::RankConstrainedDecomposer;
//!
//! # fn main() -> slnet_rs::Result<()> {
//! let dense = Tensor::ones((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
//! let decomposer = RankConstrainedDecomposer::new(1, 1e-2);
//! let out = decomposer.decompose(&dense)?;
//! assert_eq!(out.reconstructed.dims(), dense.dims());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregates;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod decomposition;
pub mod error;
pub mod estimator;
pub mod loss;
pub mod metrics;
pub mod noise;
pub mod normalization;
pub mod optimizer;
pub mod reporter;
pub mod scaler;
pub mod trainer;

pub use config::{ResumeOverrides, SlnetConfig, ENSEMBLE_SIZE};
pub use decomposition::{Decomposition, RankConstrainedDecomposer};
pub use error::{Result, SlnetError};
pub use estimator::{Estimator, SlnetEstimator};
pub use metrics::PerformanceMetrics;
pub use reporter::{EvaluationReport, MetricsReporter};
pub use trainer::{EnsembleTrainer, Stage, StageSummary};
