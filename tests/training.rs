//! End-to-end training runs on synthetic volumes.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use candle_core::Tensor;
use slnet_rs::noise::NoiseModel;
use slnet_rs::{EnsembleTrainer, EvaluationReport, MetricsReporter, SlnetConfig, SlnetError, Stage};
use tempfile::TempDir;

fn config(output: &Path) -> SlnetConfig {
    std::env::set_var("SLNET_FORCE_CPU", "1");
    let mut config = SlnetConfig::synthetic_small_preset();
    config.output_dir = output.to_string_lossy().into_owned();
    config.data.synthetic.side = 6;
    config
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<EvaluationReport>>>);

impl MetricsReporter for Recorder {
    fn report(&self, report: EvaluationReport) {
        self.0.lock().unwrap().push(report);
    }
}

struct Saturate;

impl NoiseModel for Saturate {
    fn add_sensor_noise(&self, x: &Tensor) -> slnet_rs::Result<Tensor> {
        Ok(x.affine(0.0, f64::INFINITY)?)
    }
}

#[test]
fn test_synthetic_run_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.training.max_epochs = 3;
    config.training.eval_every = 2;
    config.training.checkpoint_every = 2;

    let recorder = Recorder::default();
    let mut trainer = EnsembleTrainer::new(config)
        .unwrap()
        .with_reporter(Box::new(recorder.clone()));
    let history = trainer.train().unwrap().to_vec();

    // Epochs 0 and 2 evaluate, epoch 1 only trains.
    let evaluated: Vec<(usize, Stage)> = history
        .iter()
        .filter(|s| s.metrics.is_some())
        .map(|s| (s.epoch, s.stage))
        .collect();
    assert_eq!(
        evaluated,
        vec![
            (0, Stage::Train),
            (0, Stage::Val),
            (0, Stage::Test),
            (2, Stage::Train),
            (2, Stage::Val),
            (2, Stage::Test),
        ]
    );

    let reports = recorder.0.lock().unwrap();
    assert_eq!(reports.len(), 6 * 4);
    for report in reports.iter() {
        let scalars = report.scalars();
        let key = format!("metrics/Fro_Ratio_SLNet_{}{}", report.stage, report.subgroup);
        assert!(scalars.contains_key(&key), "missing {key}");
        assert!(report.metrics.fro.is_finite());
        assert!(report.metrics.l1 >= 0.0 && report.metrics.l1 <= 1.0);
        // Rank of the estimator output, not bounded by the rank budget.
        assert!(report.metrics.rank <= 6);
        assert!(report.eigen_crop_ratio >= 0.0 && report.eigen_crop_ratio <= 1.0);
    }

    let run_dir = trainer.run_dir();
    assert!(run_dir.join("model_0").is_dir());
    assert!(!run_dir.join("model_1").exists());
    assert!(run_dir.join("model_2").is_dir());
    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("model_2/checkpoint.json")).unwrap()).unwrap();
    for key in ["epoch", "config", "statistics", "optimizer", "scaler", "loss"] {
        assert!(saved.get(key).is_some(), "checkpoint lacks {key}");
    }
    assert_eq!(saved["epoch"], 2);
}

#[test]
fn test_resume_continues_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut first = config(dir.path());
    first.training.max_epochs = 3;
    first.training.eval_every = 1;
    first.training.checkpoint_every = 2;
    let mut trainer = EnsembleTrainer::new(first.clone()).unwrap();
    trainer.train().unwrap();
    let checkpoint = trainer.run_dir().join("model_2");
    let steps_before = trainer.optimizer().steps();
    drop(trainer);

    let mut current = first;
    current.training.max_epochs = 3;
    current.training.learning_rate = 5e-4;
    let mut resumed = EnsembleTrainer::resume(current, &checkpoint).unwrap();
    assert_eq!(resumed.start_epoch(), 1);
    assert_eq!(resumed.optimizer().learning_rate(), 5e-4);
    assert!(resumed.optimizer().steps() <= steps_before);

    let history = resumed.train().unwrap();
    assert_eq!(history.first().map(|s| (s.epoch, s.stage)), Some((1, Stage::Train)));
    assert!(resumed.run_dir().join("model_2").is_dir());
}

#[test]
fn test_resume_rejects_malformed_checkpoint() {
    let dir = TempDir::new().unwrap();
    let ckpt = dir.path().join("model_5");
    fs::create_dir_all(&ckpt).unwrap();
    fs::write(ckpt.join("checkpoint.json"), r#"{"epoch": 5}"#).unwrap();

    let err = EnsembleTrainer::resume(config(dir.path()), &ckpt).err().unwrap();
    assert!(matches!(err, SlnetError::Checkpoint(_)), "{err}");
}

#[test]
fn test_non_finite_input_aborts_with_stage_context() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.noise.enabled = true;
    config.training.max_epochs = 1;
    let mut trainer = EnsembleTrainer::new(config)
        .unwrap()
        .with_noise_model(Box::new(Saturate));

    match trainer.train().err().unwrap() {
        SlnetError::Stage {
            stage,
            epoch,
            subgroup,
            source,
        } => {
            assert_eq!(stage, "train");
            assert_eq!(epoch, 0);
            assert_eq!(subgroup, 0);
            assert!(matches!(*source, SlnetError::Decomposition(_)), "{source}");
        }
        other => panic!("unexpected error {other}"),
    }
}
