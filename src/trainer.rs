//! Ensemble training loop.
//!
//! For every epoch the trainer runs the train stage, then (every
//! `eval_every` epochs) the validation and test stages. Each batch is cut
//! into [`ENSEMBLE_SIZE`] temporal sub-groups, processed in index order, each
//! by its own estimator:
//!
//! 1. dark-current subtraction (no gradient), optional sensor noise,
//!    normalization;
//! 2. `dense = relu(estimator(x))` and its rank-constrained reconstruction
//!    `recon`;
//! 3. `sparse = relu(x - recon)`, `residual = x - dense - sparse` and the
//!    three-term loss;
//! 4. train stage only: backward and a NaN-safe optimizer step on the
//!    sub-group's parameter group; under loss scaling a non-finite gradient
//!    backs the scale off instead;
//! 5. denormalized tensors feed the running aggregates, and the final
//!    batch's tensors feed the evaluation report.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::aggregates::{Aggregator, RunningAggregates, StepValues};
use crate::checkpoint::CheckpointManager;
use crate::config::{SlnetConfig, ENSEMBLE_SIZE};
use crate::dataset::{
    check_depth_coverage, load_test_volumes, load_training_volumes, split_channels,
    temporal_subgroup, train_validation_split, InMemoryVolumes, StageLoader, VolumeSource,
};
use crate::decomposition::RankConstrainedDecomposer;
use crate::error::{Result, SlnetError};
use crate::estimator::{Estimator, EstimatorHyperparameters, SlnetEstimator};
use crate::loss::decomposition_loss;
use crate::metrics::{EvaluationTensors, PerformanceMetrics};
use crate::noise::{rescale_to_signal_power, sample_signal_power, CameraNoise, NoiseModel};
use crate::normalization::{NormalizationStatistics, Normalizer, SchemeNormalizer};
use crate::optimizer::{AdamConfig, EnsembleOptimizer, StepOutcome, TrainableParameterSet};
use crate::reporter::{
    DebugImageSet, EvaluationReport, JsonlReporter, MetricsReporter, MultiReporter, TracingReporter,
};
use crate::scaler::LossScaler;

/// Phase of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Gradient steps on the training split.
    Train,
    /// Evaluation on the validation split.
    Val,
    /// Evaluation on held-out data, never noised.
    Test,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 3] = [Stage::Train, Stage::Val, Stage::Test];

    /// Short name used in logs and metric names.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Train => "train",
            Stage::Val => "val",
            Stage::Test => "test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one (epoch, stage).
#[derive(Debug, Clone)]
pub struct StageSummary {
    /// Stage.
    pub stage: Stage,
    /// Epoch.
    pub epoch: usize,
    /// Finalized aggregates.
    pub aggregates: RunningAggregates,
    /// Per-sub-group metrics, present on evaluation epochs.
    pub metrics: Option<Vec<PerformanceMetrics>>,
}

struct SubgroupOutput {
    values: Option<StepValues>,
    samples: usize,
    tensors: EvaluationTensors,
}

/// Trains the four-estimator ensemble.
///
/// # Example
///
/// ```no_run
/// use slnet_rs::{EnsembleTrainer, SlnetConfig};
///
/// # fn main() -> slnet_rs::Result<()> {
/// let config = SlnetConfig::from_preset("synthetic-small")?;
/// let mut trainer = EnsembleTrainer::new(config)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct EnsembleTrainer {
    config: SlnetConfig,
    device: Device,
    run_dir: PathBuf,
    train_data: InMemoryVolumes,
    test_data: Option<InMemoryVolumes>,
    train_indices: Vec<usize>,
    val_indices: Vec<usize>,
    statistics: NormalizationStatistics,
    normalizer: SchemeNormalizer,
    noise: Box<dyn NoiseModel>,
    signal_rng: StdRng,
    estimators: Vec<Box<dyn Estimator>>,
    decomposers: Vec<RankConstrainedDecomposer>,
    optimizer: EnsembleOptimizer,
    scaler: LossScaler,
    checkpoints: CheckpointManager,
    reporter: Box<dyn MetricsReporter>,
    aggregator: Aggregator,
    start_epoch: usize,
    history: Vec<StageSummary>,
}

/// Pick the training device.
///
/// CUDA is used when the `cuda` feature is enabled and a device is present,
/// unless `SLNET_FORCE_CPU=1`. `SLNET_CUDA_DEVICE` selects the ordinal.
pub fn select_device() -> Device {
    let force_cpu = std::env::var("SLNET_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let ordinal = std::env::var("SLNET_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if force_cpu || !cfg!(feature = "cuda") {
        tracing::info!("Training device: CPU");
        return Device::Cpu;
    }
    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {})", ordinal);
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

impl EnsembleTrainer {
    /// Create a trainer for a fresh run.
    ///
    /// Loads the data, checks the rank budget and depth windows against it,
    /// creates the run directory and saves the effective config there.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or inconsistent with
    /// the data.
    pub fn new(config: SlnetConfig) -> Result<Self> {
        Self::build(config, select_device(), false)
    }

    /// Resume from a checkpoint directory.
    ///
    /// The checkpoint's configuration is used except for the whitelisted
    /// fields taken from `current` (see [`crate::config::ResumeOverrides`]).
    /// Optimizer moments and loss scaler state are restored and the learning
    /// rate is set from the resumed configuration. Estimator weights are
    /// re-initialized.
    pub fn resume(current: SlnetConfig, checkpoint: &Path) -> Result<Self> {
        let device = select_device();
        let ckpt = CheckpointManager::load(checkpoint, &device)?;
        let config = ckpt.resume_config(&current);
        let mut trainer = Self::build(config, device, true)?;
        trainer.scaler = ckpt.restore(&mut trainer.optimizer, trainer.config.training.learning_rate)?;
        trainer.start_epoch = ckpt.resume_epoch();
        tracing::warn!(
            "Checkpoints do not carry estimator weights; resuming at epoch {} with freshly initialized estimators",
            trainer.start_epoch
        );
        Ok(trainer)
    }

    fn build(config: SlnetConfig, device: Device, resumed: bool) -> Result<Self> {
        config.validate()?;
        let seed = config.training.seed;

        let train_data = load_training_volumes(&config.data, seed, &device)?;
        if train_data.is_empty() {
            return Err(SlnetError::Dataset("no training volumes selected".into()));
        }
        let test_data = load_test_volumes(&config.data, seed, &device)?;
        let (views, depth, h, w) = train_data.volume_dims();
        check_depth_coverage(depth, config.data.depth_window, config.data.first_window)?;
        if let Some(test) = &test_data {
            let (tv, td, th, tw) = test.volume_dims();
            if (tv, th, tw) != (views, h, w) {
                return Err(SlnetError::Config(format!(
                    "test volumes {:?} do not match training volumes {:?}",
                    (tv, th, tw),
                    (views, h, w)
                )));
            }
            check_depth_coverage(td, config.data.depth_window, config.data.first_window)?;
        }
        if config.evaluation.frame_to_grab >= views {
            return Err(SlnetError::Config(format!(
                "evaluation.frame_to_grab {} out of range for {views} views",
                config.evaluation.frame_to_grab
            )));
        }

        let hyper = EstimatorHyperparameters::from(&config.decomposition);
        let decomposers: Vec<RankConstrainedDecomposer> = (0..ENSEMBLE_SIZE)
            .map(|i| {
                RankConstrainedDecomposer::new(hyper.rank_budget, hyper.shrink_threshold)
                    .with_sketch(config.decomposition.oversample, config.decomposition.power_iterations)
                    .with_seed(seed.wrapping_add(100 + i as u64))
            })
            .collect();
        decomposers[0]
            .check_shape(views, h * w)
            .map_err(|e| SlnetError::Config(e.to_string()))?;

        let statistics = train_data.statistics()?;
        let normalizer = SchemeNormalizer::new(config.preprocessing.norm_scheme, statistics);
        tracing::info!(
            "Statistics: mean {:.3} std {:.3} max {:.3} max_sparse {:.3}",
            statistics.mean,
            statistics.std,
            statistics.max,
            statistics.max_sparse
        );

        let (train_indices, val_indices) = train_validation_split(
            train_data.len(),
            config.data.validation_split,
            config.data.shuffle,
            seed,
        );
        if train_indices.is_empty() {
            return Err(SlnetError::Dataset(
                "validation split leaves no training volumes".into(),
            ));
        }

        let estimators: Vec<Box<dyn Estimator>> = (0..ENSEMBLE_SIZE)
            .map(|i| {
                SlnetEstimator::new(
                    views,
                    &config.estimator,
                    hyper,
                    config.training.precision,
                    seed.wrapping_add(i as u64),
                    &device,
                )
                .map(|e| Box::new(e) as Box<dyn Estimator>)
            })
            .collect::<Result<_>>()?;
        let params = TrainableParameterSet::from_estimators(&estimators)?;
        tracing::info!(
            "Initialized {} estimators, {} trainable params",
            estimators.len(),
            params.num_parameters()
        );
        let optimizer = EnsembleOptimizer::new(
            params,
            AdamConfig {
                learning_rate: config.training.learning_rate,
                ..AdamConfig::default()
            },
        );

        let mut run_name = format!(
            "{}__{}",
            chrono::Local::now().format("%Y_%m_%d__%H:%M:%S"),
            config.prefix
        );
        if resumed {
            run_name.push_str("_C");
        }
        let run_dir = create_run_dir(Path::new(&config.output_dir), &run_name)?;
        config.to_file(run_dir.join("config.yaml"))?;
        tracing::info!("Logging directory: {}", run_dir.display());

        let reporter = MultiReporter::new()
            .with(Box::new(TracingReporter))
            .with(Box::new(JsonlReporter::new(&run_dir, config.evaluation.write_images)?));

        Ok(Self {
            noise: Box::new(CameraNoise::new(&config.noise, seed ^ 0x5eed)),
            signal_rng: StdRng::seed_from_u64(seed.wrapping_add(7)),
            scaler: LossScaler::for_precision(config.training.precision),
            checkpoints: CheckpointManager::new(&run_dir),
            reporter: Box::new(reporter),
            aggregator: Aggregator::new(ENSEMBLE_SIZE),
            start_epoch: 0,
            history: Vec::new(),
            config,
            device,
            run_dir,
            train_data,
            test_data,
            train_indices,
            val_indices,
            statistics,
            normalizer,
            estimators,
            decomposers,
            optimizer,
        })
    }

    /// Replace the evaluation sink.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Box<dyn MetricsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replace the sensor noise model.
    #[must_use]
    pub fn with_noise_model(mut self, noise: Box<dyn NoiseModel>) -> Self {
        self.noise = noise;
        self
    }

    /// Effective configuration.
    pub fn config(&self) -> &SlnetConfig {
        &self.config
    }

    /// Run directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// First epoch [`EnsembleTrainer::train`] runs.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Shared optimizer.
    pub fn optimizer(&self) -> &EnsembleOptimizer {
        &self.optimizer
    }

    /// Completed stages.
    pub fn history(&self) -> &[StageSummary] {
        &self.history
    }

    /// Device tensors live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run epochs `start_epoch..max_epochs`.
    ///
    /// # Errors
    ///
    /// NaN gradients are skipped; any other failure aborts the run with
    /// [`SlnetError::Stage`] context.
    pub fn train(&mut self) -> Result<&[StageSummary]> {
        let max_epochs = self.config.training.max_epochs;
        tracing::info!("Starting training");
        tracing::info!("  Epochs: {}..{}", self.start_epoch, max_epochs);
        tracing::info!("  Train/val volumes: {}/{}", self.train_indices.len(), self.val_indices.len());
        tracing::info!("  Rank budget: {}", self.decomposers[0].rank());

        for epoch in self.start_epoch..max_epochs {
            let mut last_loss = 0.0;
            for stage in Stage::ALL {
                if let Some(summary) = self.run_stage(epoch, stage)? {
                    last_loss = summary.aggregates.subgroups.first().map_or(0.0, |s| s.loss);
                    self.history.push(summary);
                }
            }
            if epoch % self.config.training.checkpoint_every == 0 {
                self.checkpoints.save(
                    epoch,
                    &self.config,
                    &self.statistics,
                    &self.optimizer,
                    &self.scaler,
                    last_loss,
                )?;
            }
        }

        tracing::info!("Training complete");
        Ok(&self.history)
    }

    /// Run one stage of one epoch. Returns `None` when the stage is skipped.
    pub fn run_stage(&mut self, epoch: usize, stage: Stage) -> Result<Option<StageSummary>> {
        let eval_epoch = epoch % self.config.training.eval_every == 0;
        if stage != Stage::Train && !eval_epoch {
            return Ok(None);
        }
        let (source, indices) = match stage {
            Stage::Train => (self.train_data.clone(), self.train_indices.clone()),
            Stage::Val => (self.train_data.clone(), self.val_indices.clone()),
            Stage::Test => match &self.test_data {
                Some(test) => (test.clone(), (0..test.len()).collect()),
                None => return Ok(None),
            },
        };
        if indices.is_empty() {
            return Ok(None);
        }

        self.aggregator.reset();
        let loader = StageLoader::new(&source, indices, self.config.training.batch_size);
        let pb = ProgressBar::new(loader.num_batches() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_message(format!("epoch {epoch} {stage}"));

        let mut final_batch: Vec<Option<EvaluationTensors>> = vec![None; ENSEMBLE_SIZE];
        for batch in loader.batches() {
            let (_, batch) = batch.map_err(|e| e.in_stage(stage.as_str(), epoch, 0))?;
            for (i, slot) in final_batch.iter_mut().enumerate() {
                let out = self
                    .process_subgroup(stage, i, &batch)
                    .map_err(|e| e.in_stage(stage.as_str(), epoch, i))?;
                if let Some(values) = out.values {
                    self.aggregator
                        .accumulate(i, out.samples, values)
                        .map_err(|e| e.in_stage(stage.as_str(), epoch, i))?;
                }
                *slot = Some(out.tensors);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let aggregates = self.aggregator.finalize();
        tracing::info!(
            "{} {} loss: {:.6} eigenCrop: {:.4} time: {:.4}",
            epoch,
            stage,
            aggregates.subgroups.first().map_or(0.0, |s| s.loss),
            aggregates.eigen_crop_ratio,
            aggregates.mean_time
        );

        let metrics = if eval_epoch {
            Some(self.report(epoch, stage, &aggregates, &final_batch)?)
        } else {
            None
        };

        Ok(Some(StageSummary {
            stage,
            epoch,
            aggregates,
            metrics,
        }))
    }

    fn report(
        &self,
        epoch: usize,
        stage: Stage,
        aggregates: &RunningAggregates,
        final_batch: &[Option<EvaluationTensors>],
    ) -> Result<Vec<PerformanceMetrics>> {
        let eval = &self.config.evaluation;
        let mut all = Vec::with_capacity(final_batch.len());
        for (i, tensors) in final_batch.iter().enumerate() {
            let Some(tensors) = tensors else {
                continue;
            };
            let metrics = PerformanceMetrics::compute(tensors, eval.frame_to_grab, eval.slice_to_grab, eval.l0_threshold)
                .map_err(|e| e.in_stage(stage.as_str(), epoch, i))?;
            let images = if eval.write_images {
                Some(DebugImageSet::from_evaluation(tensors, eval.frame_to_grab, eval.slice_to_grab)?)
            } else {
                None
            };
            self.reporter.report(EvaluationReport {
                stage,
                epoch,
                subgroup: i,
                metrics,
                aggregates: aggregates.subgroups.get(i).cloned().unwrap_or_default(),
                eigen_crop_ratio: aggregates.eigen_crop_ratio,
                mean_time: aggregates.mean_time,
                learning_rate: self.optimizer.learning_rate(),
                images,
            });
            all.push(metrics);
        }
        Ok(all)
    }

    fn process_subgroup(&mut self, stage: Stage, index: usize, batch: &Tensor) -> Result<SubgroupOutput> {
        let started = Instant::now();
        let data = &self.config.data;
        let sub = temporal_subgroup(batch, index, data.depth_window, data.first_window)?;
        let (observed, sparse_reference) = split_channels(&sub)?;
        let samples = observed.dims()[0];

        let pre = &self.config.preprocessing;
        let x = subtract_dark_current(&observed, pre.dark_current)?;
        let sparse_reference = subtract_dark_current(&sparse_reference, pre.dark_current_sparse)?;

        let x = if self.config.noise.enabled && stage != Stage::Test {
            let power = sample_signal_power(
                &mut self.signal_rng,
                self.config.noise.signal_power_min,
                self.config.noise.signal_power_max,
            );
            let x = rescale_to_signal_power(&x, power)?;
            self.noise.add_sensor_noise(&x)?.detach()
        } else {
            x
        };
        let x = self.normalizer.normalize(&x)?;

        let estimator = &self.estimators[index];
        let hyper = estimator.hyperparameters();
        let dense = estimator.forward(&x)?.relu()?;

        let decomposition = self.decomposers[index].decompose(&dense)?;
        let reconstructed = &decomposition.reconstructed;
        let sparse = (&x - reconstructed)?.relu()?;
        let residual = ((&x - &dense)? - &sparse)?;
        let loss = decomposition_loss(reconstructed, &x, &sparse, &residual, hyper.sparsity_weight)?;

        let raw = batch_mean(&decomposition.raw_singular_values)?;
        let shrunk = batch_mean(&decomposition.shrunk_singular_values)?;
        self.aggregator.record_singular_values(&raw, &shrunk)?;

        let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let mut applied = true;
        if stage == Stage::Train {
            let grads = self.scaler.scale_loss(&loss)?.backward()?;
            let outcome = self.optimizer.step_group(index, &grads, self.scaler.inv_scale())?;
            // Under loss scaling, overflow often surfaces as NaN (inf - inf).
            match outcome {
                StepOutcome::Applied => self.scaler.update(false),
                StepOutcome::SkippedNan if !self.scaler.state().enabled => {
                    tracing::warn!("NaN gradient in sub-group {index}; optimizer step skipped");
                    applied = false;
                }
                StepOutcome::SkippedNan | StepOutcome::SkippedOverflow => {
                    tracing::warn!(
                        "Non-finite gradient in sub-group {index} at loss scale {}; step skipped",
                        self.scaler.scale()
                    );
                    self.scaler.update(true);
                    applied = false;
                }
            }
            if !applied {
                self.aggregator.record_skip(index)?;
            }
        }

        let observed_raw = self.normalizer.denormalize(&x.detach())?;
        let dense_raw = self.normalizer.denormalize(&dense.detach())?;
        let reconstructed_raw = self.normalizer.denormalize(&reconstructed.detach())?;
        let sparse_raw = (&observed_raw - &dense_raw)?.relu()?;
        let sparse_l1 = sparse_raw.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;

        tracing::debug!(
            "{stage} sub-group {index}: loss {loss_value:.6} sparse_l1 {sparse_l1:.4}"
        );

        Ok(SubgroupOutput {
            values: applied.then_some(StepValues {
                loss: loss_value,
                sparse_l1,
                seconds: started.elapsed().as_secs_f64(),
            }),
            samples,
            tensors: EvaluationTensors {
                observed: observed_raw,
                dense: dense_raw,
                reconstructed: reconstructed_raw,
                sparse: sparse_raw,
                sparse_reference,
            },
        })
    }
}

/// Create `{output_dir}/{name}`, appending `_1`, `_2`, ... when it already exists.
fn create_run_dir(output_dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let mut dir = output_dir.join(name);
    let mut attempt = 0;
    loop {
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                attempt += 1;
                dir = output_dir.join(format!("{name}_{attempt}"));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// `relu(x - dark_current)`, detached.
pub fn subtract_dark_current(x: &Tensor, dark_current: f64) -> Result<Tensor> {
    Ok(x.affine(1.0, -dark_current)?.relu()?.detach())
}

/// Mean over the batch dimension of a `[B, k]` tensor.
fn batch_mean(values: &Tensor) -> Result<Vec<f64>> {
    Ok(values.detach().mean(0)?.to_dtype(DType::F64)?.to_vec1::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::scaler::LossScalerState;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct Collect(Arc<Mutex<Vec<(Stage, usize, usize)>>>);

    impl MetricsReporter for Collect {
        fn report(&self, report: EvaluationReport) {
            self.0
                .lock()
                .unwrap()
                .push((report.stage, report.epoch, report.subgroup));
        }
    }

    fn small_config(output: &Path) -> SlnetConfig {
        let mut config = SlnetConfig::synthetic_small_preset();
        config.output_dir = output.to_string_lossy().into_owned();
        config.data.synthetic.side = 6;
        config
    }

    struct PeakRecorder(Arc<Mutex<Vec<f32>>>);

    impl NoiseModel for PeakRecorder {
        fn add_sensor_noise(&self, x: &Tensor) -> Result<Tensor> {
            let peak = x.flatten_all()?.max(0)?.to_scalar::<f32>()?;
            self.0.lock().unwrap().push(peak);
            Ok(x.clone())
        }
    }

    #[test]
    fn test_dark_current_below_value_clips_to_zero() {
        let x = Tensor::full(3f32, (2, 3, 4, 4), &candle_core::Device::Cpu).unwrap();
        let out = subtract_dark_current(&x, 5.0).unwrap();
        let total = out.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_noise_sees_input_rescaled_to_signal_power() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.noise.enabled = true;
        config.noise.signal_power_min = 500.0;
        config.noise.signal_power_max = 600.0;
        let peaks = Arc::new(Mutex::new(Vec::new()));
        let mut trainer = EnsembleTrainer::new(config)
            .unwrap()
            .with_reporter(Box::new(TracingReporter))
            .with_noise_model(Box::new(PeakRecorder(peaks.clone())));
        trainer.run_stage(0, Stage::Train).unwrap();
        trainer.run_stage(0, Stage::Test).unwrap();

        let peaks = peaks.lock().unwrap();
        // Two train batches of four sub-groups; the test stage is never noised.
        assert_eq!(peaks.len(), 8);
        for &p in peaks.iter() {
            assert!((500.0 - 1e-2..=600.0 + 1e-2).contains(&p), "peak {p}");
        }
    }

    #[test]
    fn test_runs_started_together_get_separate_directories() {
        let dir = tempdir().unwrap();
        let first = create_run_dir(dir.path(), "2024_01_01__00:00:00__run").unwrap();
        let second = create_run_dir(dir.path(), "2024_01_01__00:00:00__run").unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("__run_1"));

        let config = small_config(dir.path());
        let a = EnsembleTrainer::new(config.clone()).unwrap();
        let b = EnsembleTrainer::new(config).unwrap();
        assert_ne!(a.run_dir(), b.run_dir());
    }

    #[test]
    fn test_half_precision_overflow_backs_off_loss_scale() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.training.precision = Precision::F16;
        let mut trainer = EnsembleTrainer::new(config)
            .unwrap()
            .with_reporter(Box::new(TracingReporter));
        // Scaled gradients overflow half precision and come back as NaN.
        trainer.scaler = LossScaler::from_state(LossScalerState {
            scale: 1e12,
            ..LossScalerState::default()
        });

        for epoch in 0..10 {
            trainer.run_stage(epoch, Stage::Train).unwrap();
            if trainer.optimizer().steps() > 0 {
                break;
            }
        }
        assert!(trainer.scaler.scale() < 1e12);
        assert!(trainer.optimizer().steps() > 0, "scale stuck at {}", trainer.scaler.scale());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Train.to_string(), "train");
        assert_eq!(serde_json::to_string(&Stage::Val).unwrap(), "\"val\"");
    }

    #[test]
    fn test_rank_budget_checked_at_startup() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.decomposition.rank = 4; // only 3 views
        let err = EnsembleTrainer::new(config).err().unwrap();
        assert!(matches!(err, SlnetError::Config(_)), "{err}");
    }

    #[test]
    fn test_depth_coverage_checked_at_startup() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.data.depth_window = 5;
        assert!(EnsembleTrainer::new(config).is_err());
    }

    #[test]
    fn test_run_reports_each_subgroup_once_per_stage() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.training.max_epochs = 2;
        config.training.eval_every = 2;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut trainer = EnsembleTrainer::new(config)
            .unwrap()
            .with_reporter(Box::new(Collect(seen.clone())));
        let history = trainer.train().unwrap().to_vec();

        // Epoch 0: train, val, test. Epoch 1: train only.
        let stages: Vec<(Stage, usize)> = history.iter().map(|s| (s.stage, s.epoch)).collect();
        assert_eq!(
            stages,
            vec![(Stage::Train, 0), (Stage::Val, 0), (Stage::Test, 0), (Stage::Train, 1)]
        );
        assert!(history[3].metrics.is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 12);
        for stage in [Stage::Train, Stage::Val, Stage::Test] {
            let subgroups: Vec<usize> = seen.iter().filter(|r| r.0 == stage).map(|r| r.2).collect();
            assert_eq!(subgroups, vec![0, 1, 2, 3]);
        }

        for summary in &history {
            assert!(summary.aggregates.eigen_crop_ratio >= 0.0);
            assert!(summary.aggregates.eigen_crop_ratio <= 1.0);
            for sg in &summary.aggregates.subgroups {
                assert!(sg.loss.is_finite());
            }
        }
        assert!(trainer.run_dir().join("config.yaml").exists());
        assert!(trainer.run_dir().join("model_0/checkpoint.json").exists());
        assert!(trainer.optimizer().steps() > 0);
    }

    #[test]
    fn test_all_zero_input_gives_zero_loss() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        // Dark current above every synthetic value clips the input to zero.
        config.preprocessing.dark_current = 1e6;
        config.training.max_epochs = 1;
        config.decomposition.rank = 3;
        config.decomposition.shrink_threshold = 0.01;
        let mut trainer = EnsembleTrainer::new(config)
            .unwrap()
            .with_reporter(Box::new(TracingReporter));
        let summary = trainer.run_stage(0, Stage::Val).unwrap().unwrap();
        for sg in &summary.aggregates.subgroups {
            assert_eq!(sg.loss, 0.0);
            assert_eq!(sg.sparse_l1, 0.0);
        }
    }

    #[test]
    fn test_half_precision_run_completes() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.training.max_epochs = 1;
        config.training.precision = Precision::F16;
        let mut trainer = EnsembleTrainer::new(config)
            .unwrap()
            .with_reporter(Box::new(TracingReporter));
        let summary = trainer.run_stage(0, Stage::Train).unwrap().unwrap();
        assert_eq!(summary.aggregates.subgroups.len(), ENSEMBLE_SIZE);
    }

    #[test]
    fn test_resume_uses_override_learning_rate_and_previous_epoch() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path());
        config.training.max_epochs = 1;
        config.training.learning_rate = 1e-3;
        let mut trainer = EnsembleTrainer::new(config.clone())
            .unwrap()
            .with_reporter(Box::new(TracingReporter));
        trainer.train().unwrap();
        let ckpt = trainer.run_dir().join("model_0");

        let mut current = config;
        current.training.learning_rate = 2e-4;
        current.training.max_epochs = 3;
        current.decomposition.rank = 1;
        let resumed = EnsembleTrainer::resume(current, &ckpt).unwrap();
        assert_eq!(resumed.optimizer().learning_rate(), 2e-4);
        assert_eq!(resumed.start_epoch(), 0);
        assert_eq!(resumed.config().training.max_epochs, 3);
        // Not whitelisted: taken from the checkpoint.
        assert_eq!(resumed.config().decomposition.rank, 3);
        assert!(resumed.run_dir().to_string_lossy().ends_with("_C"));
        assert!(resumed.optimizer().steps() > 0);
    }
}
