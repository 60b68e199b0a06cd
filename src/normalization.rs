//! Intensity normalization between raw camera counts and training scale.
//!
//! Statistics are computed once at startup from the selected training volumes
//! and passed through unchanged to checkpoints. Every scheme has an exact
//! algebraic inverse so metrics can be computed on the raw scale.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use slnet_rs::normalization::{NormalizationScheme, NormalizationStatistics, Normalizer, SchemeNormalizer};
//!
//! # fn main() -> slnet_rs::Result<()> {
//! let stats = NormalizationStatistics { mean: 10.0, std: 2.0, max: 40.0, max_sparse: 5.0 };
//! let normalizer = SchemeNormalizer::new(NormalizationScheme::Max, stats);
//!
//! let x = Tensor::new(&[0f32, 20.0, 40.0], &Device::Cpu)?;
//! let y = normalizer.normalize(&x)?;
//! assert_eq!(y.to_vec1::<f32>()?, vec![0.0, 0.5, 1.0]);
//! # Ok(())
//! # }
//! ```

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Normalization scheme applied to observed frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationScheme {
    /// Identity.
    None,
    /// `x / (2 std)`.
    Baseline,
    /// `(x - mean) / std`.
    Standardize,
    /// `x / max`.
    #[default]
    Max,
    /// `x / std`.
    Std,
}

/// Dataset-wide intensity statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStatistics {
    /// Mean of observed frames.
    pub mean: f64,
    /// Standard deviation of observed frames.
    pub std: f64,
    /// Maximum of observed frames.
    pub max: f64,
    /// Maximum of sparse ground-truth frames (equals `max` when duplicated).
    pub max_sparse: f64,
}

impl Default for NormalizationStatistics {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
            max: 1.0,
            max_sparse: 1.0,
        }
    }
}

impl NormalizationStatistics {
    /// Compute statistics from observed frames and (optional) sparse frames.
    pub fn from_tensors(observed: &Tensor, sparse: Option<&Tensor>) -> Result<Self> {
        let observed = observed.to_dtype(candle_core::DType::F64)?.flatten_all()?;
        let mean = observed.mean_all()?.to_scalar::<f64>()?;
        let var = observed
            .broadcast_sub(&Tensor::new(mean, observed.device())?)?
            .sqr()?
            .mean_all()?
            .to_scalar::<f64>()?;
        let max = observed.max(0)?.to_scalar::<f64>()?;
        let max_sparse = match sparse {
            Some(s) => s
                .to_dtype(candle_core::DType::F64)?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f64>()?,
            None => max,
        };
        Ok(Self {
            mean,
            std: var.sqrt(),
            max,
            max_sparse,
        })
    }

    fn std_or_one(&self) -> f64 {
        if self.std > 0.0 {
            self.std
        } else {
            1.0
        }
    }

    fn max_or_one(&self) -> f64 {
        if self.max > 0.0 {
            self.max
        } else {
            1.0
        }
    }
}

/// Maps tensors to the training scale and back.
pub trait Normalizer {
    /// Raw scale to training scale.
    fn normalize(&self, x: &Tensor) -> Result<Tensor>;

    /// Training scale to raw scale.
    fn denormalize(&self, x: &Tensor) -> Result<Tensor>;
}

/// [`Normalizer`] driven by a [`NormalizationScheme`].
#[derive(Debug, Clone)]
pub struct SchemeNormalizer {
    scheme: NormalizationScheme,
    stats: NormalizationStatistics,
}

impl SchemeNormalizer {
    /// Create a normalizer.
    pub fn new(scheme: NormalizationScheme, stats: NormalizationStatistics) -> Self {
        Self { scheme, stats }
    }

    /// Statistics in use.
    pub fn statistics(&self) -> &NormalizationStatistics {
        &self.stats
    }

    /// `(offset, scale)` such that `normalized = (x - offset) / scale`.
    fn affine(&self) -> (f64, f64) {
        match self.scheme {
            NormalizationScheme::None => (0.0, 1.0),
            NormalizationScheme::Baseline => (0.0, 2.0 * self.stats.std_or_one()),
            NormalizationScheme::Standardize => (self.stats.mean, self.stats.std_or_one()),
            NormalizationScheme::Max => (0.0, self.stats.max_or_one()),
            NormalizationScheme::Std => (0.0, self.stats.std_or_one()),
        }
    }
}

impl Normalizer for SchemeNormalizer {
    fn normalize(&self, x: &Tensor) -> Result<Tensor> {
        let (offset, scale) = self.affine();
        Ok(x.affine(1.0 / scale, -offset / scale)?)
    }

    fn denormalize(&self, x: &Tensor) -> Result<Tensor> {
        let (offset, scale) = self.affine();
        Ok(x.affine(scale, offset)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn stats() -> NormalizationStatistics {
        NormalizationStatistics {
            mean: 120.0,
            std: 35.0,
            max: 1800.0,
            max_sparse: 900.0,
        }
    }

    #[test]
    fn test_round_trip_all_schemes() {
        let device = Device::Cpu;
        let x = Tensor::new(&[0f32, 1.5, 106.0, 512.25, 1800.0], &device).unwrap();
        for scheme in [
            NormalizationScheme::None,
            NormalizationScheme::Baseline,
            NormalizationScheme::Standardize,
            NormalizationScheme::Max,
            NormalizationScheme::Std,
        ] {
            let n = SchemeNormalizer::new(scheme, stats());
            let back = n.denormalize(&n.normalize(&x).unwrap()).unwrap();
            let diff = (back - &x)
                .unwrap()
                .abs()
                .unwrap()
                .max(0)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-3, "{scheme:?} round trip error {diff}");
        }
    }

    #[test]
    fn test_standardize_values() {
        let n = SchemeNormalizer::new(NormalizationScheme::Standardize, stats());
        let x = Tensor::new(&[120f32, 155.0], &Device::Cpu).unwrap();
        let y = n.normalize(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!((y[0] - 0.0).abs() < 1e-6);
        assert!((y[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_statistics_do_not_divide_by_zero() {
        let zero = NormalizationStatistics {
            mean: 0.0,
            std: 0.0,
            max: 0.0,
            max_sparse: 0.0,
        };
        let n = SchemeNormalizer::new(NormalizationScheme::Max, zero);
        let x = Tensor::new(&[0f32, 0.0], &Device::Cpu).unwrap();
        let y = n.normalize(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_statistics_from_tensors() {
        let device = Device::Cpu;
        let observed = Tensor::new(&[1f32, 3.0, 5.0, 7.0], &device).unwrap();
        let sparse = Tensor::new(&[0f32, 2.0, 0.0, 0.0], &device).unwrap();
        let s = NormalizationStatistics::from_tensors(&observed, Some(&sparse)).unwrap();
        assert!((s.mean - 4.0).abs() < 1e-9);
        assert!((s.std - 5f64.sqrt()).abs() < 1e-9);
        assert_eq!(s.max, 7.0);
        assert_eq!(s.max_sparse, 2.0);

        let s = NormalizationStatistics::from_tensors(&observed, None).unwrap();
        assert_eq!(s.max_sparse, 7.0);
    }
}
