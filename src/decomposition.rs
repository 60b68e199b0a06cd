//! Rank-constrained reconstruction of a dense estimate.
//!
//! Each sample of a `[B, C, H, W]` dense estimate is viewed as a `C x (H*W)`
//! matrix `X` and replaced by a soft-thresholded truncated SVD:
//!
//! ```text
//! X ≈ U · diag(max(s - τ, 0)) · Vᵀ      (k = rank budget)
//! ```
//!
//! The decomposition always runs in `F32`, whatever precision produced the
//! estimate.
//!
//! # Algorithm
//!
//! 1. The top-`k` left singular vectors come from a randomized range finder
//!    (Halko, Martinsson & Tropp, 2011) on the `C x C` Gram matrix `XXᵀ`,
//!    with `power_iterations` subspace iterations, followed by a small
//!    symmetric eigenproblem. The remaining `min(C, H*W) - k` directions come
//!    from the Gram matrix deflated by that basis. This runs on the host in
//!    `f64`.
//! 2. With the full basis fixed, `s = ‖UᵀX‖` row-wise and `Vᵀ = UᵀX / s`,
//!    which gives the forward reconstruction.
//! 3. Gradients use the truncated SVD adjoint. With `dP = Uᵀ dX V`, the
//!    thresholded singular values `w` and `r = w / s`:
//!
//!    ```text
//!    dR = U (K₁∘dP + K₂∘dPᵀ) Vᵀ + U diag(r) (UᵀdX − dP Vᵀ) + (dX V − U dP) diag(r) Vᵀ
//!    K₁ᵢⱼ = (sⱼwⱼ − sᵢwᵢ) / (sⱼ² − sᵢ²)    K₂ᵢⱼ = (sᵢwⱼ − sⱼwᵢ) / (sⱼ² − sᵢ²)
//!    ```
//!
//!    with `K₁ᵢᵢ = 1` for kept values above the threshold and `0` otherwise.
//!    `dX` is `X - detach(X)`: zero in value, identity in the graph, so the
//!    reconstruction is exact and autograd sees the adjoint.
//!
//! An all-zero sample reconstructs to exactly zero.

use std::sync::Mutex;

use candle_core::{DType, Device, Tensor, D};
use nalgebra::{DMatrix, SymmetricEigen};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Result, SlnetError};

/// Added under the square root so `s` stays positive at zero.
const NORM_EPS_SQ: f64 = 1e-20;

/// Relative broadening of `1 / (sⱼ² − sᵢ²)` across the truncation gap.
const GAP_EPS: f64 = 1e-6;

const EIGEN_MAX_ITERATIONS: usize = 1000;

/// Output of [`RankConstrainedDecomposer::decompose`].
#[derive(Debug, Clone)]
pub struct Decomposition {
    /// Rank-reduced dense estimate, same shape as the input.
    pub reconstructed: Tensor,
    /// Singular values before thresholding, `[B, k]`.
    pub raw_singular_values: Tensor,
    /// Singular values after soft thresholding, `[B, k]`.
    pub shrunk_singular_values: Tensor,
}

/// Truncated SVD with singular value soft thresholding.
pub struct RankConstrainedDecomposer {
    rank: usize,
    shrink_threshold: f64,
    oversample: usize,
    power_iterations: usize,
    rng: Mutex<StdRng>,
}

impl RankConstrainedDecomposer {
    /// Create a decomposer keeping `rank` singular triples.
    pub fn new(rank: usize, shrink_threshold: f64) -> Self {
        Self {
            rank,
            shrink_threshold,
            oversample: 2,
            power_iterations: 2,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Sketch oversampling and subspace iterations.
    #[must_use]
    pub fn with_sketch(mut self, oversample: usize, power_iterations: usize) -> Self {
        self.oversample = oversample;
        self.power_iterations = power_iterations;
        self
    }

    /// Seed of the Gaussian test matrices.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Rank budget.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Reject a rank budget that does not fit a `channels x pixels` matrix.
    pub fn check_shape(&self, channels: usize, pixels: usize) -> Result<()> {
        let limit = channels.min(pixels);
        if self.rank == 0 || self.rank > limit {
            return Err(SlnetError::Decomposition(format!(
                "rank budget {} must be in 1..={} for a {}x{} matrix",
                self.rank, limit, channels, pixels
            )));
        }
        Ok(())
    }

    /// Decompose a `[B, C, H, W]` dense estimate.
    pub fn decompose(&self, dense: &Tensor) -> Result<Decomposition> {
        let (b, c, h, w) = dense.dims4()?;
        let n = h * w;
        self.check_shape(c, n)?;
        let m = c.min(n);
        let k = self.rank;

        let x = dense.to_dtype(DType::F32)?.reshape((b, c, n))?;
        let x0 = x.detach();
        let dx = (&x - &x0)?;

        // [B, C, m], [B, m, N]
        let u = self.singular_basis(&x0, m)?;
        let ut = u.transpose(1, 2)?.contiguous()?;
        let p = ut.matmul(&x0)?;
        let s = p.sqr()?.sum(D::Minus1)?.affine(1.0, NORM_EPS_SQ)?.sqrt()?;
        let vt = p.broadcast_div(&s.unsqueeze(D::Minus1)?)?;
        let v = vt.transpose(1, 2)?.contiguous()?;

        let host_s = s.to_dtype(DType::F64)?.to_vec2::<f64>()?;
        let adjoint = Adjoint::new(&host_s, k, self.shrink_threshold, x.device())?;

        // Value of the reconstruction.
        let base = u.broadcast_mul(&adjoint.w.unsqueeze(1)?)?.matmul(&vt)?;

        // Zero in value; carries the adjoint.
        let utdx = ut.matmul(&dx)?;
        let dp = utdx.matmul(&v)?;
        let dpt = dp.transpose(1, 2)?.contiguous()?;
        let core = (adjoint.k1.mul(&dp)? + adjoint.k2.mul(&dpt)?)?;
        let rotation = u.matmul(&core)?.matmul(&vt)?;
        let r_rows = adjoint.r.unsqueeze(D::Minus1)?;
        let r_cols = adjoint.r.unsqueeze(1)?;
        let row_space = (utdx - dp.matmul(&vt)?)?;
        let left = u.matmul(&row_space.broadcast_mul(&r_rows)?)?;
        let column_space = (dx.matmul(&v)? - u.matmul(&dp)?)?;
        let right = column_space.broadcast_mul(&r_cols)?.matmul(&vt)?;
        let tangent = ((rotation + left)? + right)?;

        let reconstructed = (base + tangent)?.reshape((b, c, h, w))?;

        let eye = Tensor::eye(m, DType::F32, x.device())?.unsqueeze(0)?;
        let ds = dp.broadcast_mul(&eye)?.sum(D::Minus1)?;
        let raw = (s + ds)?.narrow(1, 0, k)?;
        let shrunk = soft_threshold(&raw, self.shrink_threshold)?;

        Ok(Decomposition {
            reconstructed,
            raw_singular_values: raw,
            shrunk_singular_values: shrunk,
        })
    }

    /// Detached orthonormal left basis of every `[C, N]` sample, `[B, C, m]`.
    ///
    /// The first `k` columns come from the randomized sketch, the rest from
    /// the Gram matrix deflated by them, both in descending order.
    fn singular_basis(&self, x: &Tensor, m: usize) -> Result<Tensor> {
        let (b, c, _) = x.dims3()?;
        let k = self.rank;
        let sketch = (k + self.oversample).min(c);

        let gram = x
            .matmul(&x.transpose(1, 2)?.contiguous()?)?
            .to_dtype(DType::F64)?
            .to_vec3::<f64>()?;

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| SlnetError::Decomposition("sketch generator lock poisoned".into()))?;

        let mut out = Vec::with_capacity(b * c * m);
        for (sample, rows) in gram.iter().enumerate() {
            let g = DMatrix::from_fn(c, c, |i, j| rows[i][j]);
            if g.iter().any(|v| !v.is_finite()) {
                return Err(SlnetError::Decomposition(format!(
                    "non-finite values in dense estimate of sample {sample}"
                )));
            }

            let omega = DMatrix::from_fn(c, sketch, |_, _| StandardNormal.sample(&mut *rng));
            let mut q = (&g * omega).qr().q();
            for _ in 0..self.power_iterations {
                q = (&g * q).qr().q();
            }
            let top = top_eigenvectors(&(q.transpose() * &g * &q), k, sample)?;
            let kept = &q * top;

            // Kept directions sit below every eigenvalue of the PSD remainder.
            let shift = 1.0 + g.trace().abs();
            let kept_projector = &kept * kept.transpose();
            let projector = DMatrix::<f64>::identity(c, c) - &kept_projector;
            let deflated = &projector * &g * &projector - kept_projector * shift;
            let rest = top_eigenvectors(&deflated, m - k, sample)?;

            for i in 0..c {
                for j in 0..k {
                    out.push(kept[(i, j)] as f32);
                }
                for j in 0..m - k {
                    out.push(rest[(i, j)] as f32);
                }
            }
        }
        drop(rng);

        Ok(Tensor::from_vec(out, (b, c, m), x.device())?)
    }
}

/// Leading `count` eigenvectors of a symmetric matrix, as columns.
fn top_eigenvectors(matrix: &DMatrix<f64>, count: usize, sample: usize) -> Result<DMatrix<f64>> {
    let n = matrix.nrows();
    let symmetric = (matrix + matrix.transpose()) * 0.5;
    let eig = SymmetricEigen::try_new(symmetric, f64::EPSILON, EIGEN_MAX_ITERATIONS).ok_or_else(|| {
        SlnetError::Decomposition(format!("eigen solver did not converge for sample {sample}"))
    })?;
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
    Ok(DMatrix::from_fn(n, count, |i, j| eig.eigenvectors[(i, order[j])]))
}

/// Detached coefficients of the truncated SVD adjoint.
struct Adjoint {
    /// Thresholded singular values, zero past the rank budget, `[B, m]`.
    w: Tensor,
    /// `w / s`, `[B, m]`.
    r: Tensor,
    k1: Tensor,
    k2: Tensor,
}

impl Adjoint {
    fn new(singular_values: &[Vec<f64>], k: usize, threshold: f64, device: &Device) -> Result<Self> {
        let b = singular_values.len();
        let m = singular_values.first().map_or(0, Vec::len);
        let (mut w, mut r) = (Vec::with_capacity(b * m), Vec::with_capacity(b * m));
        let (mut k1, mut k2) = (Vec::with_capacity(b * m * m), Vec::with_capacity(b * m * m));

        for s in singular_values {
            let active: Vec<bool> = (0..m).map(|i| i < k && s[i] > threshold).collect();
            let ws: Vec<f64> = (0..m).map(|i| if active[i] { s[i] - threshold } else { 0.0 }).collect();
            let scale = s.iter().fold(0.0f64, |a, v| a.max(v * v));
            let eps = (GAP_EPS * scale).powi(2);

            for i in 0..m {
                w.push(ws[i] as f32);
                r.push((ws[i] / s[i]) as f32);
                for j in 0..m {
                    let (a, c) = if i == j {
                        (if active[i] { 1.0 } else { 0.0 }, 0.0)
                    } else if active[i] && active[j] {
                        // Closed form, finite for repeated singular values.
                        let sum = s[i] + s[j];
                        (1.0 - threshold / sum, threshold / sum)
                    } else {
                        let gap = s[j] * s[j] - s[i] * s[i];
                        let inv = gap / (gap * gap + eps);
                        ((s[j] * ws[j] - s[i] * ws[i]) * inv, (s[i] * ws[j] - s[j] * ws[i]) * inv)
                    };
                    k1.push(a as f32);
                    k2.push(c as f32);
                }
            }
        }

        Ok(Self {
            w: Tensor::from_vec(w, (b, m), device)?,
            r: Tensor::from_vec(r, (b, m), device)?,
            k1: Tensor::from_vec(k1, (b, m, m), device)?,
            k2: Tensor::from_vec(k2, (b, m, m), device)?,
        })
    }
}

/// `sign(s) * max(|s| - threshold, 0)`, element-wise.
pub fn soft_threshold(s: &Tensor, threshold: f64) -> Result<Tensor> {
    let magnitude = s.abs()?.affine(1.0, -threshold)?.relu()?;
    let sign = s.detach().ge(0f64)?.to_dtype(s.dtype())?.affine(2.0, -1.0)?;
    Ok(magnitude.mul(&sign)?)
}

/// Fraction of singular value mass kept by thresholding; 0 when nothing was there.
pub fn eigen_crop_ratio(raw_sum: f64, shrunk_sum: f64) -> f64 {
    if raw_sum == 0.0 {
        0.0
    } else {
        shrunk_sum / raw_sum
    }
}
