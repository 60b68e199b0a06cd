//! Dynamic loss scaling for half-precision estimators.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::Precision;
use crate::error::Result;

/// Serializable scaler state, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    /// Current loss multiplier.
    pub scale: f64,
    /// Multiplier applied after `growth_interval` clean steps.
    pub growth_factor: f64,
    /// Multiplier applied after an overflow.
    pub backoff_factor: f64,
    /// Clean steps between growths.
    pub growth_interval: usize,
    /// Clean steps since the last growth or overflow.
    pub growth_tracker: usize,
    /// Scaling is active.
    pub enabled: bool,
}

impl Default for LossScalerState {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            enabled: true,
        }
    }
}

/// Scales the loss before backward so small half-precision gradients survive,
/// and adapts the scale when gradients overflow.
#[derive(Debug, Clone)]
pub struct LossScaler {
    state: LossScalerState,
}

impl LossScaler {
    /// Create a scaler; a disabled scaler is the identity.
    pub fn new(enabled: bool) -> Self {
        Self {
            state: LossScalerState {
                enabled,
                ..Default::default()
            },
        }
    }

    /// Enabled only for `F16`.
    pub fn for_precision(precision: Precision) -> Self {
        Self::new(precision == Precision::F16)
    }

    /// Restore from a checkpoint.
    pub fn from_state(state: LossScalerState) -> Self {
        Self { state }
    }

    /// Current state.
    pub fn state(&self) -> &LossScalerState {
        &self.state
    }

    /// Effective multiplier (1 when disabled).
    pub fn scale(&self) -> f64 {
        if self.state.enabled {
            self.state.scale
        } else {
            1.0
        }
    }

    /// Factor that undoes [`LossScaler::scale_loss`] on gradients.
    pub fn inv_scale(&self) -> f64 {
        1.0 / self.scale()
    }

    /// Multiply the loss by the current scale.
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.state.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.state.scale, 0.0)?)
    }

    /// Record the outcome of a step.
    pub fn update(&mut self, found_inf: bool) {
        if !self.state.enabled {
            return;
        }
        if found_inf {
            self.state.scale *= self.state.backoff_factor;
            self.state.growth_tracker = 0;
            tracing::debug!("Gradient overflow, loss scale backed off to {}", self.state.scale);
        } else {
            self.state.growth_tracker += 1;
            if self.state.growth_tracker >= self.state.growth_interval {
                self.state.scale *= self.state.growth_factor;
                self.state.growth_tracker = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_disabled_is_identity() {
        let mut scaler = LossScaler::for_precision(Precision::F32);
        let loss = Tensor::new(3f32, &Device::Cpu).unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(scaled, 3.0);
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);
        assert_eq!(scaler.inv_scale(), 1.0);
    }

    #[test]
    fn test_backoff_and_growth() {
        let mut scaler = LossScaler::from_state(LossScalerState {
            growth_interval: 2,
            ..Default::default()
        });
        scaler.update(true);
        assert_eq!(scaler.scale(), 32768.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 32768.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 65536.0);
        assert_eq!(scaler.state().growth_tracker, 0);
    }

    #[test]
    fn test_state_serializes() {
        let scaler = LossScaler::for_precision(Precision::F16);
        let json = serde_json::to_string(scaler.state()).unwrap();
        let back: LossScalerState = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, scaler.state());
        assert!(back.enabled);
    }
}
