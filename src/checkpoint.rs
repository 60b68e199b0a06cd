//! Checkpoint persistence and hybrid resume.
//!
//! A checkpoint is a directory `model_{epoch}` inside the run directory:
//!
//! - `checkpoint.json`: epoch, effective config, normalization statistics,
//!   optimizer metadata (learning rate, per-parameter steps), loss scaler
//!   state and the last loss;
//! - `optimizer.safetensors`: Adam moment tensors (absent before the first
//!   optimizer step).
//!
//! Estimator weights are not part of a checkpoint.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{ResumeOverrides, SlnetConfig};
use crate::error::{Result, SlnetError};
use crate::normalization::NormalizationStatistics;
use crate::optimizer::EnsembleOptimizer;
use crate::scaler::{LossScaler, LossScalerState};

/// Metadata file name.
pub const METADATA_FILE: &str = "checkpoint.json";
/// Optimizer moments file name.
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";

/// Keys `checkpoint.json` must contain.
pub const REQUIRED_KEYS: [&str; 6] = ["epoch", "config", "statistics", "optimizer", "scaler", "loss"];

/// Optimizer bookkeeping stored next to the moment tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerMetadata {
    /// Learning rate at save time.
    pub learning_rate: f64,
    /// Adam step count per parameter.
    pub steps: BTreeMap<String, usize>,
}

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch the checkpoint was written after.
    pub epoch: usize,
    /// Effective run configuration.
    pub config: SlnetConfig,
    /// Normalization statistics computed at startup.
    pub statistics: NormalizationStatistics,
    /// Optimizer metadata.
    pub optimizer: OptimizerMetadata,
    /// Loss scaler state.
    pub scaler: LossScalerState,
    /// Sub-group 0 loss of the last stage.
    pub loss: f64,
    /// RFC 3339 save time.
    #[serde(default)]
    pub timestamp: String,
}

/// A loaded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Metadata.
    pub metadata: CheckpointMetadata,
    /// Optimizer moments, keyed as produced by [`EnsembleOptimizer::state_tensors`].
    pub optimizer_tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Epoch a resumed run starts at.
    ///
    /// The saved epoch is re-run: resumption starts one epoch earlier,
    /// saturating at 0.
    pub fn resume_epoch(&self) -> usize {
        self.metadata.epoch.saturating_sub(1)
    }

    /// Configuration of a resumed run: the checkpoint's, except the
    /// whitelisted fields taken from `current`.
    pub fn resume_config(&self, current: &SlnetConfig) -> SlnetConfig {
        ResumeOverrides::from_config(current).apply(self.metadata.config.clone())
    }

    /// Restore optimizer moments and scaler state, then set the learning rate
    /// from the resumed configuration.
    pub fn restore(&self, optimizer: &mut EnsembleOptimizer, learning_rate: f64) -> Result<LossScaler> {
        optimizer.load_state(&self.optimizer_tensors, &self.metadata.optimizer.steps)?;
        optimizer.set_learning_rate(learning_rate);
        Ok(LossScaler::from_state(self.metadata.scaler.clone()))
    }
}

/// Writes checkpoints into a run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    run_dir: PathBuf,
}

impl CheckpointManager {
    /// Manager writing under `run_dir`.
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// Directory of the checkpoint for `epoch`.
    pub fn checkpoint_dir(&self, epoch: usize) -> PathBuf {
        self.run_dir.join(format!("model_{epoch}"))
    }

    /// Persist a checkpoint; returns its directory.
    pub fn save(
        &self,
        epoch: usize,
        config: &SlnetConfig,
        statistics: &NormalizationStatistics,
        optimizer: &EnsembleOptimizer,
        scaler: &LossScaler,
        loss: f64,
    ) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(epoch);
        std::fs::create_dir_all(&dir)?;

        let tensors = optimizer
            .state_tensors()
            .into_iter()
            .map(|(k, t)| Ok((k, t.to_device(&Device::Cpu)?)))
            .collect::<Result<HashMap<String, Tensor>>>()?;
        if !tensors.is_empty() {
            candle_core::safetensors::save(&tensors, dir.join(OPTIMIZER_FILE))?;
        }

        let metadata = CheckpointMetadata {
            epoch,
            config: config.clone(),
            statistics: *statistics,
            optimizer: OptimizerMetadata {
                learning_rate: optimizer.learning_rate(),
                steps: optimizer.state_steps(),
            },
            scaler: scaler.state().clone(),
            loss,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        std::fs::write(dir.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;

        tracing::info!("Saved checkpoint to: {}", dir.display());
        Ok(dir)
    }

    /// Load a checkpoint from its directory or its `checkpoint.json`.
    ///
    /// # Errors
    ///
    /// Returns [`SlnetError::Checkpoint`] if the file is unreadable, a required
    /// key is missing, or optimizer tensors are missing.
    pub fn load(path: &Path, device: &Device) -> Result<Checkpoint> {
        let (dir, meta_path) = if path.is_dir() {
            (path.to_path_buf(), path.join(METADATA_FILE))
        } else {
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            (dir, path.to_path_buf())
        };

        let content = std::fs::read_to_string(&meta_path).map_err(|e| {
            SlnetError::Checkpoint(format!("failed to read {}: {e}", meta_path.display()))
        })?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| SlnetError::Checkpoint(format!("failed to parse {}: {e}", meta_path.display())))?;
        let object = value
            .as_object()
            .ok_or_else(|| SlnetError::Checkpoint("checkpoint metadata is not an object".into()))?;
        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !object.contains_key(**k)) {
            return Err(SlnetError::Checkpoint(format!("missing required key `{missing}`")));
        }
        let metadata: CheckpointMetadata = serde_json::from_value(value)
            .map_err(|e| SlnetError::Checkpoint(format!("malformed checkpoint metadata: {e}")))?;

        let opt_path = dir.join(OPTIMIZER_FILE);
        let optimizer_tensors = if opt_path.exists() {
            candle_core::safetensors::load(&opt_path, device)?
        } else if metadata.optimizer.steps.is_empty() {
            HashMap::new()
        } else {
            return Err(SlnetError::Checkpoint(format!(
                "{} is missing but the optimizer has state",
                opt_path.display()
            )));
        };

        tracing::info!(
            "Loaded checkpoint from {} (epoch {})",
            dir.display(),
            metadata.epoch
        );
        Ok(Checkpoint {
            metadata,
            optimizer_tensors,
        })
    }
}
