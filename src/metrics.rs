//! Decomposition quality metrics.
//!
//! Metrics are computed on raw-scale (denormalized) tensors of one designated
//! batch, restricted to a single view:
//!
//! | Metric | Definition |
//! |---|---|
//! | `rank` | numerical rank of the estimator's dense frame of one slice |
//! | `fro` | `‖M - L - S‖_F` |
//! | `fro_ratio` | `fro / ‖M‖_F`, 0 when `‖M‖_F = 0` |
//! | `mean_error` | `mean(M - L - S)` |
//! | `l1` | fraction of `S` above `l0_threshold * max(S)` |

use candle_core::{DType, Tensor};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlnetError};

/// Detached raw-scale tensors of one sub-group on the designated batch,
/// each `[N, C, H, W]`.
#[derive(Debug, Clone)]
pub struct EvaluationTensors {
    /// Observed frames `M`.
    pub observed: Tensor,
    /// Estimator output `L`, before the rank constraint.
    pub dense: Tensor,
    /// Rank-reduced dense estimate, for debug frames.
    pub reconstructed: Tensor,
    /// Sparse component `S = relu(M - L)`.
    pub sparse: Tensor,
    /// Sparse reference channel (ground truth or a copy of `M`).
    pub sparse_reference: Tensor,
}

/// Per (epoch, stage, sub-group) metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Numerical rank of the dense frame.
    pub rank: usize,
    /// Frobenius norm of the total residual.
    pub fro: f64,
    /// Residual to signal Frobenius ratio.
    pub fro_ratio: f64,
    /// Mean residual value.
    pub mean_error: f64,
    /// Sparse occupancy fraction.
    pub l1: f64,
}

impl PerformanceMetrics {
    /// Compute metrics on view `frame`; `slice` picks the sample for the rank.
    ///
    /// Both indices are clamped to the tensor extent, since the final batch
    /// of a stage may be short.
    pub fn compute(t: &EvaluationTensors, frame: usize, slice: usize, l0_threshold: f64) -> Result<Self> {
        let (n, c, _, _) = t.observed.dims4()?;
        if n == 0 || c == 0 {
            return Err(SlnetError::Dataset("cannot compute metrics on an empty batch".into()));
        }
        let frame = frame.min(c - 1);
        let slice = slice.min(n - 1);

        let pick = |x: &Tensor| -> Result<Tensor> {
            Ok(x.to_dtype(DType::F32)?.narrow(1, frame, 1)?.contiguous()?)
        };
        let m = pick(&t.observed)?;
        let l = pick(&t.dense)?;
        let s = pick(&t.sparse)?;

        let residual = ((&m - &l)? - &s)?;
        let fro = frobenius(&residual)?;
        let fro_m = frobenius(&m)?;
        let mean_error = residual.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;

        let s_flat = s.flatten_all()?.to_vec1::<f32>()?;
        let s_max = s_flat.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let cut = l0_threshold as f32 * s_max;
        let above = s_flat.iter().filter(|v| **v > cut).count();

        let rank = numerical_rank(&l.get(slice)?.squeeze(0)?)?;

        Ok(Self {
            rank,
            fro,
            fro_ratio: if fro_m == 0.0 { 0.0 } else { fro / fro_m },
            mean_error,
            l1: above as f64 / s_flat.len() as f64,
        })
    }
}

fn frobenius(x: &Tensor) -> Result<f64> {
    Ok(x.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?.sqrt())
}

/// Count of singular values above `max(σ) * max(rows, cols) * f32::EPSILON`.
pub fn numerical_rank(matrix: &Tensor) -> Result<usize> {
    let (rows, cols) = matrix.dims2()?;
    if rows == 0 || cols == 0 {
        return Ok(0);
    }
    let values = matrix.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    let m = DMatrix::from_row_slice(rows, cols, &values);
    let sv = m.singular_values();
    let max = sv.iter().copied().fold(0.0, f64::max);
    let tol = max * rows.max(cols) as f64 * f64::from(f32::EPSILON);
    Ok(sv.iter().filter(|&&s| s > tol).count())
}
