//! Evaluation sinks.
//!
//! The trainer hands one [`EvaluationReport`] per (epoch, stage, sub-group)
//! to a [`MetricsReporter`]. Reports own plain host values, never tensors, so
//! sinks may move them to other threads. `report` must not block the
//! training loop.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use candle_core::{DType, Tensor};
use chrono::{DateTime, Utc};
use image::{GrayImage, ImageBuffer};
use serde::Serialize;

use crate::aggregates::SubgroupAggregate;
use crate::error::{Result, SlnetError};
use crate::metrics::{EvaluationTensors, PerformanceMetrics};
use crate::trainer::Stage;

/// One grayscale frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugImage {
    /// Image name, used in the file name.
    pub name: String,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Row-major raw values.
    pub pixels: Vec<f32>,
}

impl DebugImage {
    /// Copy a `[H, W]` tensor to the host.
    pub fn from_frame(name: impl Into<String>, frame: &Tensor) -> Result<Self> {
        let (height, width) = frame.dims2()?;
        Ok(Self {
            name: name.into(),
            width,
            height,
            pixels: frame.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    /// Min-max scale to 8 bits; a constant frame maps to black.
    pub fn to_luma8(&self) -> Option<GrayImage> {
        let (lo, hi) = self
            .pixels
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = hi - lo;
        let bytes: Vec<u8> = self
            .pixels
            .iter()
            .map(|&v| {
                if range > 0.0 && v.is_finite() {
                    (((v - lo) / range) * 255.0).round() as u8
                } else {
                    0
                }
            })
            .collect();
        ImageBuffer::from_vec(self.width as u32, self.height as u32, bytes)
    }
}

/// Frames of one sample and view taken from the designated batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugImageSet {
    /// Images in a fixed order.
    pub images: Vec<DebugImage>,
}

impl DebugImageSet {
    /// Observed, sparse, dense, reconstructed and sparse reference frames
    /// of sample `slice`, view `frame` (both clamped).
    pub fn from_evaluation(t: &EvaluationTensors, frame: usize, slice: usize) -> Result<Self> {
        let (n, c, _, _) = t.observed.dims4()?;
        if n == 0 || c == 0 {
            return Ok(Self::default());
        }
        let (slice, frame) = (slice.min(n - 1), frame.min(c - 1));
        let pick = |x: &Tensor| -> Result<Tensor> { Ok(x.get(slice)?.get(frame)?) };
        let images = vec![
            DebugImage::from_frame("input_noisy", &pick(&t.observed)?)?,
            DebugImage::from_frame("image_intermediate_sparse", &pick(&t.sparse)?)?,
            DebugImage::from_frame("image_intermediate_dense", &pick(&t.dense)?)?,
            DebugImage::from_frame("image_reconSVC_dense", &pick(&t.reconstructed)?)?,
            DebugImage::from_frame("image_intermediate_sparse_GT", &pick(&t.sparse_reference)?)?,
        ];
        Ok(Self { images })
    }
}

/// Everything reported for one (epoch, stage, sub-group).
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    /// Stage.
    pub stage: Stage,
    /// Epoch.
    pub epoch: usize,
    /// Sub-group index.
    pub subgroup: usize,
    /// Metrics on the designated batch.
    pub metrics: PerformanceMetrics,
    /// Finalized aggregates of this sub-group.
    pub aggregates: SubgroupAggregate,
    /// Stage-wide eigenvalue crop ratio.
    pub eigen_crop_ratio: f64,
    /// Stage-wide mean processing time per sample.
    pub mean_time: f64,
    /// Learning rate during the stage.
    pub learning_rate: f64,
    /// Optional debug frames.
    #[serde(skip)]
    pub images: Option<DebugImageSet>,
}

impl EvaluationReport {
    /// Named scalars.
    pub fn scalars(&self) -> BTreeMap<String, f64> {
        let s = self.stage.as_str();
        let i = self.subgroup;
        let m = &self.metrics;
        BTreeMap::from([
            (format!("Loss/{s}{i}"), self.aggregates.loss),
            (format!("Loss/mean_sparse_l1_{s}{i}"), self.aggregates.sparse_l1),
            ("regularization_weights/eigen_crop_percentage".to_string(), self.eigen_crop_ratio),
            (format!("times/{s}"), self.mean_time),
            (format!("lr/{s}"), self.learning_rate),
            (format!("skipped_steps/{s}{i}"), self.aggregates.skipped_steps as f64),
            (format!("metrics/Rank_SLNet_{s}{i}"), m.rank as f64),
            (format!("metrics/Fro_SLNet_{s}{i}"), m.fro),
            (format!("metrics/Fro_Ratio_SLNet_{s}{i}"), m.fro_ratio),
            (format!("metrics/mean_error_SLNet_{s}{i}"), m.mean_error),
            (format!("metrics/L1_SLNet_{s}{i}"), m.l1),
        ])
    }
}

/// A sink for evaluation reports.
pub trait MetricsReporter {
    /// Hand over a report. Must not block on IO.
    fn report(&self, report: EvaluationReport);
}

/// Logs reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl MetricsReporter for TracingReporter {
    fn report(&self, report: EvaluationReport) {
        let m = &report.metrics;
        tracing::info!(
            target: "slnet::metrics",
            "epoch {} {}{}: loss {:.6} rank {} fro {:.4} fro_ratio {:.4} mean_error {:.4e} l1 {:.4}",
            report.epoch,
            report.stage,
            report.subgroup,
            report.aggregates.loss,
            m.rank,
            m.fro,
            m.fro_ratio,
            m.mean_error,
            m.l1
        );
        for (name, value) in report.scalars() {
            tracing::debug!(target: "slnet::metrics", "{name} = {value}");
        }
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: DateTime<Utc>,
    stage: Stage,
    epoch: usize,
    subgroup: usize,
    scalars: &'a BTreeMap<String, f64>,
}

/// Appends reports to `metrics.jsonl` from a background thread and,
/// optionally, writes debug frames as PNGs under `images/`.
pub struct JsonlReporter {
    sender: Option<Sender<EvaluationReport>>,
    worker: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl JsonlReporter {
    /// Open (append) `{run_dir}/metrics.jsonl` and start the writer thread.
    pub fn new(run_dir: &Path, write_images: bool) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join("metrics.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let image_dir = write_images.then(|| run_dir.join("images"));
        if let Some(dir) = &image_dir {
            std::fs::create_dir_all(dir)?;
        }

        let (sender, receiver) = mpsc::channel::<EvaluationReport>();
        let worker = thread::Builder::new()
            .name("slnet-metrics".into())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for report in receiver {
                    if let Err(e) = write_record(&mut out, &report) {
                        tracing::warn!("Failed to write metrics record: {e}");
                    }
                    if let (Some(dir), Some(images)) = (&image_dir, &report.images) {
                        if let Err(e) = write_images_for(dir, &report, images) {
                            tracing::warn!("Failed to write debug images: {e}");
                        }
                    }
                }
                if let Err(e) = out.flush() {
                    tracing::warn!("Failed to flush metrics log: {e}");
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            path,
        })
    }

    /// Path of the JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_record(out: &mut BufWriter<File>, report: &EvaluationReport) -> Result<()> {
    let scalars = report.scalars();
    let record = JsonRecord {
        timestamp: Utc::now(),
        stage: report.stage,
        epoch: report.epoch,
        subgroup: report.subgroup,
        scalars: &scalars,
    };
    serde_json::to_writer(&mut *out, &record)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn write_images_for(dir: &Path, report: &EvaluationReport, images: &DebugImageSet) -> Result<()> {
    for image in &images.images {
        let buffer = image.to_luma8().ok_or_else(|| {
            SlnetError::Dataset(format!("debug image {} has inconsistent size", image.name))
        })?;
        let file = dir.join(format!(
            "{}_{}{}_epoch{:05}.png",
            image.name, report.stage, report.subgroup, report.epoch
        ));
        buffer.save(file)?;
    }
    Ok(())
}

impl MetricsReporter for JsonlReporter {
    fn report(&self, report: EvaluationReport) {
        if let Some(sender) = &self.sender {
            if sender.send(report).is_err() {
                tracing::warn!("Metrics writer thread has stopped; report dropped");
            }
        }
    }
}

impl Drop for JsonlReporter {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Metrics writer thread panicked");
            }
        }
    }
}

/// Fans reports out to several sinks.
#[derive(Default)]
pub struct MultiReporter {
    sinks: Vec<Box<dyn MetricsReporter>>,
}

impl MultiReporter {
    /// Empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: Box<dyn MetricsReporter>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsReporter for MultiReporter {
    fn report(&self, report: EvaluationReport) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.report(report.clone());
            }
            last.report(report);
        }
    }
}
