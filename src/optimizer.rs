//! Shared-state Adam over the ensemble's parameter groups.
//!
//! All four estimators are optimized by one [`EnsembleOptimizer`] holding a
//! single moment table. Each estimator's variables form one
//! [`ParameterGroup`]; a step touches exactly one group and is all-or-nothing:
//! if any gradient of that group has a NaN mean, nothing is written, neither
//! weights nor moments.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use crate::error::{Result, SlnetError};
use crate::estimator::Estimator;

/// Suffix of first-moment tensors in saved optimizer state.
pub const EXP_AVG_SUFFIX: &str = "exp_avg";
/// Suffix of second-moment tensors in saved optimizer state.
pub const EXP_AVG_SQ_SUFFIX: &str = "exp_avg_sq";

/// Named variables belonging to one estimator.
#[derive(Clone)]
pub struct ParameterGroup {
    /// Group name, `estimator{i}`.
    pub name: String,
    /// `(qualified name, variable)` pairs.
    pub params: Vec<(String, Var)>,
}

impl ParameterGroup {
    /// Scalar weights in the group.
    pub fn num_parameters(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }
}

/// Every trainable variable of the ensemble, grouped per estimator.
#[derive(Clone, Default)]
pub struct TrainableParameterSet {
    groups: Vec<ParameterGroup>,
}

impl TrainableParameterSet {
    /// One group per estimator; names become `estimator{i}.{name}`.
    pub fn from_estimators(estimators: &[Box<dyn Estimator>]) -> Result<Self> {
        let groups = estimators
            .iter()
            .enumerate()
            .map(|(i, est)| {
                let name = format!("estimator{i}");
                let params = est
                    .parameters()?
                    .into_iter()
                    .map(|(n, v)| (format!("{name}.{n}"), v))
                    .collect();
                Ok(ParameterGroup { name, params })
            })
            .collect::<Result<_>>()?;
        Ok(Self { groups })
    }

    /// All groups in index order.
    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    /// Group `index`.
    pub fn group(&self, index: usize) -> Result<&ParameterGroup> {
        self.groups.get(index).ok_or_else(|| {
            SlnetError::Config(format!(
                "parameter group {index} out of range ({} groups)",
                self.groups.len()
            ))
        })
    }

    /// Scalar weights across all groups.
    pub fn num_parameters(&self) -> usize {
        self.groups.iter().map(ParameterGroup::num_parameters).sum()
    }

    fn find(&self, key: &str) -> Option<&Var> {
        self.groups
            .iter()
            .flat_map(|g| g.params.iter())
            .find(|(n, _)| n == key)
            .map(|(_, v)| v)
    }
}

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1
    pub beta1: f64,
    /// Beta2
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Result of [`EnsembleOptimizer::step_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Weights and moments were updated.
    Applied,
    /// A gradient mean was NaN; nothing was written.
    SkippedNan,
    /// A gradient mean was infinite (loss-scale overflow); nothing was written.
    SkippedOverflow,
}

struct MomentState {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    step: usize,
}

/// Adam with one moment table shared by every parameter group.
pub struct EnsembleOptimizer {
    params: TrainableParameterSet,
    config: AdamConfig,
    state: HashMap<String, MomentState>,
}

impl EnsembleOptimizer {
    /// Create an optimizer with empty moments.
    pub fn new(params: TrainableParameterSet, config: AdamConfig) -> Self {
        Self {
            params,
            config,
            state: HashMap::new(),
        }
    }

    /// Parameters under optimization.
    pub fn parameters(&self) -> &TrainableParameterSet {
        &self.params
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Largest per-parameter step count.
    pub fn steps(&self) -> usize {
        self.state.values().map(|s| s.step).max().unwrap_or(0)
    }

    /// Scan group `index` for NaN or infinite gradient means.
    ///
    /// Gradients are checked after multiplying by `inv_scale`.
    pub fn scan_group(&self, index: usize, grads: &GradStore, inv_scale: f64) -> Result<StepOutcome> {
        let group = self.params.group(index)?;
        let mut outcome = StepOutcome::Applied;
        for (_, var) in &group.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let mean = grad
                .mean_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?
                * inv_scale;
            if mean.is_nan() {
                return Ok(StepOutcome::SkippedNan);
            }
            if mean.is_infinite() {
                outcome = StepOutcome::SkippedOverflow;
            }
        }
        Ok(outcome)
    }

    /// Apply one Adam step to group `index`, unless a gradient is bad.
    pub fn step_group(&mut self, index: usize, grads: &GradStore, inv_scale: f64) -> Result<StepOutcome> {
        let outcome = self.scan_group(index, grads, inv_scale)?;
        if outcome != StepOutcome::Applied {
            return Ok(outcome);
        }

        let AdamConfig {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let params = self.params.group(index)?.params.clone();

        for (name, var) in &params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?.affine(inv_scale, 0.0)?;

            let (exp_avg, exp_avg_sq, step) = match self.state.get(name) {
                Some(s) => (s.exp_avg.clone(), s.exp_avg_sq.clone(), s.step),
                None => (
                    Tensor::zeros(var.dims(), DType::F32, var.device())?,
                    Tensor::zeros(var.dims(), DType::F32, var.device())?,
                    0,
                ),
            };
            let step = step + 1;

            // m = b1 m + (1 - b1) g ; v = b2 v + (1 - b2) g^2
            let exp_avg = (exp_avg.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
            let exp_avg_sq = (exp_avg_sq.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;

            let bc1 = 1.0 - beta1.powi(step as i32);
            let bc2 = 1.0 - beta2.powi(step as i32);
            let denom = exp_avg_sq.affine(1.0 / bc2, 0.0)?.sqrt()?.affine(1.0, eps)?;
            let update = exp_avg.affine(lr / bc1, 0.0)?.div(&denom)?;

            let new_w = (var.as_tensor() - update)?;
            var.set(&new_w)?;

            self.state.insert(
                name.clone(),
                MomentState {
                    exp_avg,
                    exp_avg_sq,
                    step,
                },
            );
        }
        Ok(StepOutcome::Applied)
    }

    /// Moment tensors keyed `{param}.exp_avg` / `{param}.exp_avg_sq`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::with_capacity(self.state.len() * 2);
        for (name, s) in &self.state {
            out.insert(format!("{name}.{EXP_AVG_SUFFIX}"), s.exp_avg.clone());
            out.insert(format!("{name}.{EXP_AVG_SQ_SUFFIX}"), s.exp_avg_sq.clone());
        }
        out
    }

    /// Per-parameter step counts.
    pub fn state_steps(&self) -> BTreeMap<String, usize> {
        self.state.iter().map(|(k, s)| (k.clone(), s.step)).collect()
    }

    /// Replace the moment table with saved state.
    ///
    /// Every entry must name a known parameter and match its shape.
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>, steps: &BTreeMap<String, usize>) -> Result<()> {
        let mut state = HashMap::with_capacity(steps.len());
        for (name, &step) in steps {
            let var = self.params.find(name).ok_or_else(|| {
                SlnetError::Checkpoint(format!("optimizer state for unknown parameter {name}"))
            })?;
            let fetch = |suffix: &str| -> Result<Tensor> {
                let key = format!("{name}.{suffix}");
                let t = tensors
                    .get(&key)
                    .ok_or_else(|| SlnetError::Checkpoint(format!("missing optimizer tensor {key}")))?;
                if t.dims() != var.dims() {
                    return Err(SlnetError::Checkpoint(format!(
                        "optimizer tensor {key} has shape {:?}, parameter has {:?}",
                        t.dims(),
                        var.dims()
                    )));
                }
                Ok(t.to_dtype(DType::F32)?.to_device(var.device())?)
            };
            state.insert(
                name.clone(),
                MomentState {
                    exp_avg: fetch(EXP_AVG_SUFFIX)?,
                    exp_avg_sq: fetch(EXP_AVG_SQ_SUFFIX)?,
                    step,
                },
            );
        }
        self.state = state;
        Ok(())
    }
}
