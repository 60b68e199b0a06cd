//! Three-term decomposition objective.

use candle_core::Tensor;

use crate::error::{Result, SlnetError};

/// Reconstruction fidelity + weighted sparse L1 + residual energy.
///
/// ```text
/// mean|reconstructed - observed| + sparsity_weight * mean|sparse| + mean|residual|
/// ```
///
/// No term is clamped. All inputs must share one shape.
pub fn decomposition_loss(
    reconstructed_dense: &Tensor,
    observed: &Tensor,
    sparse_residual: &Tensor,
    reconstruction_residual: &Tensor,
    sparsity_weight: f64,
) -> Result<Tensor> {
    let shape = observed.dims();
    for (name, t) in [
        ("reconstructed_dense", reconstructed_dense),
        ("sparse_residual", sparse_residual),
        ("reconstruction_residual", reconstruction_residual),
    ] {
        if t.dims() != shape {
            return Err(SlnetError::Decomposition(format!(
                "{name} shape {:?} does not match observed {:?}",
                t.dims(),
                shape
            )));
        }
    }

    let fidelity = (reconstructed_dense - observed)?.abs()?.mean_all()?;
    let sparsity = sparse_residual.abs()?.mean_all()?.affine(sparsity_weight, 0.0)?;
    let residual = reconstruction_residual.abs()?.mean_all()?;
    Ok(((fidelity + sparsity)? + residual)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_hand_computed_value() {
        let device = Device::Cpu;
        let recon = Tensor::new(&[1f32, 2.0, 3.0, 4.0], &device).unwrap();
        let observed = Tensor::new(&[2f32, 2.0, 1.0, 4.0], &device).unwrap();
        let sparse = Tensor::new(&[4f32, 0.0, 0.0, 0.0], &device).unwrap();
        let residual = Tensor::new(&[-1f32, 1.0, 0.0, 0.0], &device).unwrap();

        let loss = decomposition_loss(&recon, &observed, &sparse, &residual, 0.5)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // 3/4 + 0.5 * 1 + 2/4
        assert!((loss - 1.75).abs() < 1e-6);
    }

    #[test]
    fn test_zero_inputs_give_exact_zero() {
        let z = Tensor::zeros((8, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let loss = decomposition_loss(&z, &z, &z, &z, 0.1).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(decomposition_loss(&a, &a, &b, &a, 0.1).is_err());
    }
}
