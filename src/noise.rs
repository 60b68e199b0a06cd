//! Synthetic sensor noise for training-time augmentation.
//!
//! Frames are first rescaled so their peak matches a sampled signal power,
//! then corrupted by a camera model: Poisson shot noise on the detected
//! photo-electrons plus Gaussian read noise, quantized to the camera bit depth.

use std::sync::Mutex;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};

use crate::config::NoiseConfig;
use crate::error::{Result, SlnetError};

/// Stochastic corruption applied to a rescaled frame stack.
pub trait NoiseModel {
    /// Return a noisy copy of `x`.
    fn add_sensor_noise(&self, x: &Tensor) -> Result<Tensor>;
}

/// Rescale `x` so its maximum equals `signal_power`.
///
/// An all-zero tensor is returned unchanged.
pub fn rescale_to_signal_power(x: &Tensor, signal_power: f64) -> Result<Tensor> {
    let current_max = x.flatten_all()?.max(0)?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    if current_max <= 0.0 {
        return Ok(x.clone());
    }
    Ok(x.affine(signal_power / current_max, 0.0)?)
}

/// Uniform draw in `[min, max]`; the bounds may be given in either order.
pub fn sample_signal_power<R: Rng>(rng: &mut R, min: f64, max: f64) -> f64 {
    min + (max - min) * rng.gen::<f64>()
}

/// Shot + read noise camera model.
pub struct CameraNoise {
    quantum_efficiency: f64,
    read_noise: f64,
    sensitivity: f64,
    max_adu: f64,
    rng: Mutex<StdRng>,
}

impl CameraNoise {
    /// Build from configuration with a fixed seed.
    pub fn new(config: &NoiseConfig, seed: u64) -> Self {
        Self {
            quantum_efficiency: config.quantum_efficiency,
            read_noise: config.read_noise,
            sensitivity: config.sensitivity,
            max_adu: f64::from(2u32.saturating_pow(config.bit_depth.min(31))) - 1.0,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl NoiseModel for CameraNoise {
    fn add_sensor_noise(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let values = x.to_dtype(candle_core::DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let read = Normal::new(0.0, self.read_noise.max(0.0))
            .map_err(|e| SlnetError::Config(format!("invalid read noise: {e}")))?;

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| SlnetError::Config("noise generator lock poisoned".into()))?;
        let noisy: Vec<f32> = values
            .iter()
            .map(|&photons| {
                let lambda = f64::from(photons.max(0.0)) * self.quantum_efficiency;
                let electrons = match Poisson::new(lambda) {
                    Ok(p) => p.sample(&mut *rng),
                    Err(_) => 0.0,
                };
                let electrons = electrons + read.sample(&mut *rng);
                let adu = (electrons * self.sensitivity).round().clamp(0.0, self.max_adu);
                adu as f32
            })
            .collect();
        drop(rng);

        let out = Tensor::from_vec(noisy, x.dims(), x.device())?;
        Ok(out.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_rescale_sets_peak_to_signal_power() {
        let x = Tensor::new(&[[1f32, 2.0], [4.0, 0.5]], &Device::Cpu).unwrap();
        let y = rescale_to_signal_power(&x, 900.0).unwrap();
        let max = y.flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        assert!((max - 900.0).abs() < 1e-3);
        // Ratios preserved.
        let v = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((v[1] / v[0] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_rescale_zero_input() {
        let x = Tensor::zeros((3, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = rescale_to_signal_power(&x, 900.0).unwrap();
        assert_eq!(y.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_sample_signal_power_in_window() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let p = sample_signal_power(&mut rng, 3600.0, 900.0);
            assert!((900.0..=3600.0).contains(&p));
        }
    }

    #[test]
    fn test_camera_noise_is_seeded_and_bounded() {
        let config = NoiseConfig {
            bit_depth: 12,
            ..Default::default()
        };
        let x = Tensor::full(2000f32, (8, 8), &Device::Cpu).unwrap();

        let a = CameraNoise::new(&config, 7).add_sensor_noise(&x).unwrap();
        let b = CameraNoise::new(&config, 7).add_sensor_noise(&x).unwrap();
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );

        let v = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|&p| (0.0..=4095.0).contains(&p)));
        let mean: f32 = v.iter().sum::<f32>() / v.len() as f32;
        // Expected ~ 2000 * 0.82 electrons at unit sensitivity.
        assert!((mean - 1640.0).abs() < 60.0, "mean {mean}");
        assert_eq!(a.dims(), x.dims());
    }
}
