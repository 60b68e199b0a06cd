//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlnetError};
use crate::normalization::NormalizationScheme;

/// Number of estimators in the ensemble, one per temporal sub-group.
pub const ENSEMBLE_SIZE: usize = 4;

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use slnet_rs::SlnetConfig;
///
/// # fn main() -> slnet_rs::Result<()> {
/// let mut config = SlnetConfig::from_preset("synthetic-small")?;
/// config.training.max_epochs = 3;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlnetConfig {
    /// Data source and sub-group slicing.
    pub data: DataConfig,

    /// Optimization hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Synthetic sensor noise injection.
    #[serde(default)]
    pub noise: NoiseConfig,

    /// Dark-current offsets and normalization.
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    /// Rank constraint and loss weights.
    #[serde(default)]
    pub decomposition: DecompositionConfig,

    /// Estimator network shape and initialization.
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Evaluation metrics and debug images.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Root directory for run folders.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Prefix appended to the run folder name.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_output_dir() -> String {
    "experiments".into()
}

fn default_prefix() -> String {
    "fishy".into()
}

/// Where volumes come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    /// A safetensors file with a `volumes` tensor `[N, C, D, H, W]`.
    #[default]
    Safetensors,
    /// Seeded low-rank background with sparse transients.
    Synthetic,
}

/// Data configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Source kind.
    #[serde(default)]
    pub source: DataSourceKind,

    /// Training data path (ignored for synthetic data).
    #[serde(default)]
    pub path: PathBuf,

    /// Held-out test data path.
    #[serde(default)]
    pub test_path: Option<PathBuf>,

    /// Indices of volumes to train on. Empty means all.
    #[serde(default)]
    pub images_to_use: Vec<usize>,

    /// Fraction of volumes reserved for validation.
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,

    /// Shuffle indices before splitting.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Load sparse ground truth next to the observed volume.
    #[serde(default)]
    pub load_sparse: bool,

    /// Frames per temporal sub-group.
    #[serde(default = "default_depth_window")]
    pub depth_window: usize,

    /// Index of the first depth window used by sub-group 0.
    #[serde(default = "default_first_window")]
    pub first_window: usize,

    /// Synthetic volume geometry.
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

fn default_validation_split() -> f64 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_depth_window() -> usize {
    20
}
fn default_first_window() -> usize {
    1
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: DataSourceKind::default(),
            path: PathBuf::new(),
            test_path: None,
            images_to_use: Vec::new(),
            validation_split: default_validation_split(),
            shuffle: true,
            load_sparse: false,
            depth_window: default_depth_window(),
            first_window: default_first_window(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

/// Geometry of generated volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Number of volumes.
    pub volumes: usize,
    /// Views (channels) per volume.
    pub views: usize,
    /// Depth/time frames per volume.
    pub depth: usize,
    /// Frame side length.
    pub side: usize,
    /// Rank of the generated background.
    pub background_rank: usize,
    /// Fraction of pixels carrying a transient.
    pub sparse_fraction: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            volumes: 4,
            views: 3,
            depth: 10,
            side: 16,
            background_rank: 1,
            sparse_fraction: 0.02,
        }
    }
}

/// Numeric precision used for the estimator forward pass.
///
/// The truncated SVD always runs in `F32`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Full precision.
    #[default]
    F32,
    /// Half precision with dynamic loss scaling.
    F16,
    /// Brain float.
    Bf16,
}

impl Precision {
    /// Candle dtype for this precision.
    pub fn dtype(self) -> candle_core::DType {
        match self {
            Precision::F32 => candle_core::DType::F32,
            Precision::F16 => candle_core::DType::F16,
            Precision::Bf16 => candle_core::DType::BF16,
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Volumes per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Adam learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Number of epochs to run.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    /// Validation and metrics cadence in epochs.
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,

    /// Checkpoint cadence in epochs.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Estimator forward precision.
    #[serde(default)]
    pub precision: Precision,

    /// Seed for splits, noise and synthetic data.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_batch_size() -> usize {
    8
}
fn default_lr() -> f64 {
    1e-4
}
fn default_max_epochs() -> usize {
    1001
}
fn default_eval_every() -> usize {
    10
}
fn default_checkpoint_every() -> usize {
    10
}
fn default_seed() -> u64 {
    261_290
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            max_epochs: default_max_epochs(),
            eval_every: default_eval_every(),
            checkpoint_every: default_checkpoint_every(),
            precision: Precision::default(),
            seed: default_seed(),
        }
    }
}

/// Sensor noise injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Apply noise during train/validation stages.
    #[serde(default)]
    pub enabled: bool,

    /// Lower end of the sampled peak signal.
    #[serde(default = "default_signal_power_min")]
    pub signal_power_min: f64,

    /// Upper end of the sampled peak signal.
    #[serde(default = "default_signal_power_max")]
    pub signal_power_max: f64,

    /// Photon to electron conversion.
    #[serde(default = "default_quantum_efficiency")]
    pub quantum_efficiency: f64,

    /// Read noise standard deviation in electrons.
    #[serde(default = "default_read_noise")]
    pub read_noise: f64,

    /// ADU per electron.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,

    /// Camera bit depth; output is clamped to `[0, 2^bits - 1]`.
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u32,
}

fn default_signal_power_min() -> f64 {
    3600.0
}
fn default_signal_power_max() -> f64 {
    900.0
}
fn default_quantum_efficiency() -> f64 {
    0.82
}
fn default_read_noise() -> f64 {
    2.29
}
fn default_sensitivity() -> f64 {
    1.0
}
fn default_bit_depth() -> u32 {
    16
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            signal_power_min: default_signal_power_min(),
            signal_power_max: default_signal_power_max(),
            quantum_efficiency: default_quantum_efficiency(),
            read_noise: default_read_noise(),
            sensitivity: default_sensitivity(),
            bit_depth: default_bit_depth(),
        }
    }
}

/// Dark-current subtraction and normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Camera dark current subtracted from observed volumes.
    #[serde(default = "default_dark_current")]
    pub dark_current: f64,

    /// Dark current subtracted from sparse ground truth.
    #[serde(default)]
    pub dark_current_sparse: f64,

    /// Normalization scheme.
    #[serde(default)]
    pub norm_scheme: NormalizationScheme,
}

fn default_dark_current() -> f64 {
    106.0
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            dark_current: default_dark_current(),
            dark_current_sparse: 0.0,
            norm_scheme: NormalizationScheme::default(),
        }
    }
}

/// Rank constraint and loss weights, shared by all estimators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionConfig {
    /// Singular triples kept by the truncated SVD.
    #[serde(default = "default_rank")]
    pub rank: usize,

    /// Weight of the sparse L1 term.
    #[serde(default = "default_sparsity_weight")]
    pub sparsity_weight: f64,

    /// Soft threshold applied to singular values.
    #[serde(default = "default_shrink_threshold")]
    pub shrink_threshold: f64,

    /// Extra sketch columns for the randomized range finder.
    #[serde(default = "default_oversample")]
    pub oversample: usize,

    /// Subspace iterations for the randomized range finder.
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,
}

fn default_rank() -> usize {
    3
}
fn default_sparsity_weight() -> f64 {
    0.1
}
fn default_shrink_threshold() -> f64 {
    1e-2
}
fn default_oversample() -> usize {
    2
}
fn default_power_iterations() -> usize {
    2
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            rank: default_rank(),
            sparsity_weight: default_sparsity_weight(),
            shrink_threshold: default_shrink_threshold(),
            oversample: default_oversample(),
            power_iterations: default_power_iterations(),
        }
    }
}

/// Estimator network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Channels of the hidden convolutions.
    #[serde(default = "default_hidden_channels")]
    pub hidden_channels: usize,

    /// Number of 3x3 convolutions (at least 1).
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Add a bias to each convolution.
    #[serde(default)]
    pub use_bias: bool,

    /// Scale applied to the non-negative initial weights.
    #[serde(default = "default_weight_multiplier")]
    pub weight_multiplier: f64,
}

fn default_hidden_channels() -> usize {
    8
}
fn default_num_layers() -> usize {
    3
}
fn default_weight_multiplier() -> f64 {
    0.5
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            hidden_channels: default_hidden_channels(),
            num_layers: default_num_layers(),
            use_bias: false,
            weight_multiplier: default_weight_multiplier(),
        }
    }
}

/// Evaluation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// View shown in metrics and debug images.
    #[serde(default)]
    pub frame_to_grab: usize,

    /// Flattened batch slice used for the rank metric and debug images.
    #[serde(default)]
    pub slice_to_grab: usize,

    /// Relative threshold for sparse occupancy.
    #[serde(default = "default_l0_threshold")]
    pub l0_threshold: f64,

    /// Write debug PNGs next to the metrics log.
    #[serde(default)]
    pub write_images: bool,
}

fn default_l0_threshold() -> f64 {
    0.05
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            frame_to_grab: 0,
            slice_to_grab: 0,
            l0_threshold: default_l0_threshold(),
            write_images: false,
        }
    }
}

impl SlnetConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"xlfm-fish"` - light-field fish recordings (safetensors volumes)
    /// - `"synthetic-small"` - tiny generated volumes, runs on CPU in seconds
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "xlfm-fish" => Ok(Self::xlfm_fish_preset()),
            "synthetic-small" => Ok(Self::synthetic_small_preset()),
            _ => Err(SlnetError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Light-field fish recordings, 3 temporal shifts, 600x600 lenslet crops.
    #[must_use]
    pub fn xlfm_fish_preset() -> Self {
        Self {
            data: DataConfig {
                path: "./data/fish3/volumes.safetensors".into(),
                images_to_use: (0..30).collect(),
                ..Default::default()
            },
            training: TrainingConfig::default(),
            noise: NoiseConfig::default(),
            preprocessing: PreprocessingConfig::default(),
            decomposition: DecompositionConfig::default(),
            estimator: EstimatorConfig::default(),
            evaluation: EvaluationConfig::default(),
            output_dir: default_output_dir(),
            prefix: default_prefix(),
        }
    }

    /// Small generated volumes for smoke runs and tests.
    #[must_use]
    pub fn synthetic_small_preset() -> Self {
        Self {
            data: DataConfig {
                source: DataSourceKind::Synthetic,
                validation_split: 0.25,
                depth_window: 2,
                first_window: 1,
                ..Default::default()
            },
            training: TrainingConfig {
                batch_size: 2,
                learning_rate: 1e-3,
                max_epochs: 2,
                eval_every: 1,
                checkpoint_every: 1,
                ..Default::default()
            },
            noise: NoiseConfig::default(),
            preprocessing: PreprocessingConfig {
                dark_current: 0.0,
                ..Default::default()
            },
            decomposition: DecompositionConfig::default(),
            estimator: EstimatorConfig {
                hidden_channels: 4,
                num_layers: 2,
                ..Default::default()
            },
            evaluation: EvaluationConfig::default(),
            output_dir: default_output_dir(),
            prefix: "synthetic".into(),
        }
    }

    /// Validate the configuration.
    ///
    /// Shape checks that need the data (rank budget vs. matrix size, depth
    /// coverage) run later in [`crate::EnsembleTrainer::new`].
    pub fn validate(&self) -> Result<()> {
        if self.data.source == DataSourceKind::Safetensors && self.data.path.as_os_str().is_empty() {
            return Err(SlnetError::Config("data.path is required".into()));
        }
        if !(0.0..1.0).contains(&self.data.validation_split) {
            return Err(SlnetError::Config(
                "data.validation_split must be in [0, 1)".into(),
            ));
        }
        if self.data.depth_window == 0 {
            return Err(SlnetError::Config("data.depth_window must be > 0".into()));
        }
        if self.training.batch_size == 0 {
            return Err(SlnetError::Config("training.batch_size must be > 0".into()));
        }
        if self.training.learning_rate.is_nan() || self.training.learning_rate <= 0.0 {
            return Err(SlnetError::Config(
                "training.learning_rate must be > 0".into(),
            ));
        }
        if self.training.eval_every == 0 || self.training.checkpoint_every == 0 {
            return Err(SlnetError::Config(
                "training.eval_every and training.checkpoint_every must be > 0".into(),
            ));
        }
        if self.decomposition.rank == 0 {
            return Err(SlnetError::Config("decomposition.rank must be > 0".into()));
        }
        if self.decomposition.shrink_threshold < 0.0 || self.decomposition.sparsity_weight < 0.0 {
            return Err(SlnetError::Config(
                "decomposition weights and thresholds must be non-negative".into(),
            ));
        }
        if self.estimator.num_layers == 0 {
            return Err(SlnetError::Config("estimator.num_layers must be > 0".into()));
        }
        if self.noise.enabled
            && (self.noise.signal_power_min <= 0.0 || self.noise.signal_power_max <= 0.0)
        {
            return Err(SlnetError::Config(
                "noise signal power bounds must be > 0".into(),
            ));
        }
        if self.data.source == DataSourceKind::Synthetic {
            let s = &self.data.synthetic;
            if s.volumes == 0 || s.views == 0 || s.depth == 0 || s.side == 0 {
                return Err(SlnetError::Config(
                    "data.synthetic dimensions must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Fields a resumed run takes from the current invocation instead of the
/// checkpoint.
///
/// Everything else, including the rank budget and loss weights, is frozen to
/// the checkpoint's values.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeOverrides {
    /// `training.max_epochs`
    pub max_epochs: usize,
    /// `data.images_to_use`
    pub images_to_use: Vec<usize>,
    /// `preprocessing.dark_current`
    pub dark_current: f64,
    /// `training.learning_rate`
    pub learning_rate: f64,
    /// `training.batch_size`
    pub batch_size: usize,
    /// `data.test_path`
    pub test_path: Option<PathBuf>,
    /// `preprocessing.dark_current_sparse`
    pub dark_current_sparse: f64,
}

impl ResumeOverrides {
    /// Capture the whitelisted fields of the current invocation.
    pub fn from_config(config: &SlnetConfig) -> Self {
        Self {
            max_epochs: config.training.max_epochs,
            images_to_use: config.data.images_to_use.clone(),
            dark_current: config.preprocessing.dark_current,
            learning_rate: config.training.learning_rate,
            batch_size: config.training.batch_size,
            test_path: config.data.test_path.clone(),
            dark_current_sparse: config.preprocessing.dark_current_sparse,
        }
    }

    /// Overwrite the whitelisted fields of a checkpoint's config.
    #[must_use]
    pub fn apply(self, mut checkpoint_config: SlnetConfig) -> SlnetConfig {
        checkpoint_config.training.max_epochs = self.max_epochs;
        checkpoint_config.data.images_to_use = self.images_to_use;
        checkpoint_config.preprocessing.dark_current = self.dark_current;
        checkpoint_config.training.learning_rate = self.learning_rate;
        checkpoint_config.training.batch_size = self.batch_size;
        checkpoint_config.data.test_path = self.test_path;
        checkpoint_config.preprocessing.dark_current_sparse = self.dark_current_sparse;
        checkpoint_config
    }
}
