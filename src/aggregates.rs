//! Per-(epoch, stage) running sums.

use serde::{Deserialize, Serialize};

use crate::decomposition::eigen_crop_ratio;
use crate::error::{Result, SlnetError};

/// Values produced by one sub-group on one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepValues {
    /// Loss of the batch.
    pub loss: f64,
    /// Mean of the raw-scale sparse component.
    pub sparse_l1: f64,
    /// Wall time spent on the sub-group, in seconds.
    pub seconds: f64,
}

/// Finalized per-sub-group values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubgroupAggregate {
    /// Sample-weighted mean loss.
    pub loss: f64,
    /// Sample-weighted mean sparse L1.
    pub sparse_l1: f64,
    /// Mean processing time per sample, in seconds.
    pub time_per_sample: f64,
    /// Samples accumulated.
    pub samples: usize,
    /// Steps skipped because of NaN or overflowing gradients.
    pub skipped_steps: usize,
}

/// Finalized aggregates of one (epoch, stage).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningAggregates {
    /// One entry per sub-group.
    pub subgroups: Vec<SubgroupAggregate>,
    /// Mean raw singular value vector.
    pub mean_singular_values: Vec<f64>,
    /// Mean thresholded singular value vector.
    pub mean_shrunk_singular_values: Vec<f64>,
    /// `sum(shrunk) / sum(raw)`, 0 when nothing was recorded.
    pub eigen_crop_ratio: f64,
    /// Mean processing time per sample over all sub-groups.
    pub mean_time: f64,
}

#[derive(Debug, Clone, Default)]
struct Sums {
    loss: f64,
    sparse_l1: f64,
    seconds: f64,
    samples: usize,
    skipped: usize,
}

/// Accumulates sub-group values over one (epoch, stage).
#[derive(Debug, Clone)]
pub struct Aggregator {
    sums: Vec<Sums>,
    raw_sum: Vec<f64>,
    shrunk_sum: Vec<f64>,
    records: usize,
}

impl Aggregator {
    /// Aggregator for `subgroups` sub-groups.
    pub fn new(subgroups: usize) -> Self {
        Self {
            sums: vec![Sums::default(); subgroups],
            raw_sum: Vec::new(),
            shrunk_sum: Vec::new(),
            records: 0,
        }
    }

    /// Clear every sum.
    pub fn reset(&mut self) {
        let n = self.sums.len();
        *self = Self::new(n);
    }

    fn sums_mut(&mut self, subgroup: usize) -> Result<&mut Sums> {
        let n = self.sums.len();
        self.sums.get_mut(subgroup).ok_or_else(|| {
            SlnetError::Config(format!("sub-group {subgroup} out of range ({n})"))
        })
    }

    /// Add one batch of a sub-group, weighted by `sample_count`.
    pub fn accumulate(&mut self, subgroup: usize, sample_count: usize, values: StepValues) -> Result<()> {
        let s = self.sums_mut(subgroup)?;
        let w = sample_count as f64;
        s.loss += values.loss * w;
        s.sparse_l1 += values.sparse_l1 * w;
        s.seconds += values.seconds;
        s.samples += sample_count;
        Ok(())
    }

    /// Count a skipped optimizer step.
    pub fn record_skip(&mut self, subgroup: usize) -> Result<()> {
        self.sums_mut(subgroup)?.skipped += 1;
        Ok(())
    }

    /// Add batch-mean raw and thresholded singular value vectors.
    pub fn record_singular_values(&mut self, raw: &[f64], shrunk: &[f64]) -> Result<()> {
        if raw.len() != shrunk.len() {
            return Err(SlnetError::Decomposition(format!(
                "singular value vectors differ in length ({} vs {})",
                raw.len(),
                shrunk.len()
            )));
        }
        if self.records == 0 {
            self.raw_sum = vec![0.0; raw.len()];
            self.shrunk_sum = vec![0.0; raw.len()];
        } else if raw.len() != self.raw_sum.len() {
            return Err(SlnetError::Decomposition(format!(
                "singular value vector length changed from {} to {}",
                self.raw_sum.len(),
                raw.len()
            )));
        }
        for (acc, v) in self.raw_sum.iter_mut().zip(raw) {
            *acc += v;
        }
        for (acc, v) in self.shrunk_sum.iter_mut().zip(shrunk) {
            *acc += v;
        }
        self.records += 1;
        Ok(())
    }

    /// Divide sums by their counts.
    pub fn finalize(&self) -> RunningAggregates {
        let subgroups: Vec<SubgroupAggregate> = self
            .sums
            .iter()
            .map(|s| {
                let n = s.samples as f64;
                let div = |v: f64| if s.samples == 0 { 0.0 } else { v / n };
                SubgroupAggregate {
                    loss: div(s.loss),
                    sparse_l1: div(s.sparse_l1),
                    time_per_sample: div(s.seconds),
                    samples: s.samples,
                    skipped_steps: s.skipped,
                }
            })
            .collect();

        let records = self.records.max(1) as f64;
        let mean_time = if subgroups.is_empty() {
            0.0
        } else {
            subgroups.iter().map(|s| s.time_per_sample).sum::<f64>() / subgroups.len() as f64
        };

        RunningAggregates {
            eigen_crop_ratio: eigen_crop_ratio(self.raw_sum.iter().sum(), self.shrunk_sum.iter().sum()),
            mean_singular_values: self.raw_sum.iter().map(|v| v / records).collect(),
            mean_shrunk_singular_values: self.shrunk_sum.iter().map(|v| v / records).collect(),
            mean_time,
            subgroups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_weighted_means() {
        let mut agg = Aggregator::new(4);
        agg.accumulate(1, 2, StepValues { loss: 1.0, sparse_l1: 4.0, seconds: 0.2 }).unwrap();
        agg.accumulate(1, 6, StepValues { loss: 3.0, sparse_l1: 0.0, seconds: 0.6 }).unwrap();
        let out = agg.finalize();
        let s = &out.subgroups[1];
        assert_eq!(s.samples, 8);
        assert!((s.loss - 2.5).abs() < 1e-12);
        assert!((s.sparse_l1 - 1.0).abs() < 1e-12);
        assert!((s.time_per_sample - 0.1).abs() < 1e-12);
        assert_eq!(out.subgroups[0], SubgroupAggregate::default());
    }

    #[test]
    fn test_eigen_crop_ratio_bounds() {
        let mut agg = Aggregator::new(4);
        assert_eq!(agg.finalize().eigen_crop_ratio, 0.0);

        agg.record_singular_values(&[3.0, 1.0], &[2.99, 0.99]).unwrap();
        agg.record_singular_values(&[5.0, 0.005], &[4.99, 0.0]).unwrap();
        let out = agg.finalize();
        assert!(out.eigen_crop_ratio > 0.0 && out.eigen_crop_ratio <= 1.0);
        assert!((out.mean_singular_values[0] - 4.0).abs() < 1e-12);

        let mut zero = Aggregator::new(4);
        zero.record_singular_values(&[0.0, 0.0], &[0.0, 0.0]).unwrap();
        assert_eq!(zero.finalize().eigen_crop_ratio, 0.0);
    }

    #[test]
    fn test_reset_and_skips() {
        let mut agg = Aggregator::new(4);
        agg.record_skip(3).unwrap();
        agg.accumulate(0, 1, StepValues { loss: 1.0, ..Default::default() }).unwrap();
        assert_eq!(agg.finalize().subgroups[3].skipped_steps, 1);
        agg.reset();
        let out = agg.finalize();
        assert_eq!(out.subgroups.len(), 4);
        assert!(out.subgroups.iter().all(|s| s.samples == 0 && s.skipped_steps == 0));
        assert!(agg.record_skip(4).is_err());
    }

    #[test]
    fn test_mismatched_singular_values_rejected() {
        let mut agg = Aggregator::new(4);
        assert!(agg.record_singular_values(&[1.0], &[1.0, 2.0]).is_err());
        agg.record_singular_values(&[1.0], &[1.0]).unwrap();
        assert!(agg.record_singular_values(&[1.0, 2.0], &[1.0, 2.0]).is_err());
    }
}
