//! Dense-component estimators.
//!
//! The trainer treats an estimator as an opaque differentiable map from a
//! `[N, C, H, W]` frame stack to a dense estimate of the same shape. The
//! default [`SlnetEstimator`] is a small stack of same-padded 3x3
//! convolutions.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};

use crate::config::{DecompositionConfig, EstimatorConfig, Precision};
use crate::error::{Result, SlnetError};

/// Negative slope between hidden convolutions.
const LEAKY_SLOPE: f64 = 0.01;

/// Loss and decomposition hyperparameters attached to an estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorHyperparameters {
    /// Weight of the sparse L1 term.
    pub sparsity_weight: f64,
    /// Soft threshold on singular values.
    pub shrink_threshold: f64,
    /// Singular triples kept by the decomposer.
    pub rank_budget: usize,
}

impl From<&DecompositionConfig> for EstimatorHyperparameters {
    fn from(config: &DecompositionConfig) -> Self {
        Self {
            sparsity_weight: config.sparsity_weight,
            shrink_threshold: config.shrink_threshold,
            rank_budget: config.rank,
        }
    }
}

/// A trainable dense estimator.
pub trait Estimator {
    /// Predict a dense estimate; output is `F32` with the input's shape.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Trainable variables with stable names.
    fn parameters(&self) -> Result<Vec<(String, Var)>>;

    /// Hyperparameters used by the decomposer and the loss.
    fn hyperparameters(&self) -> EstimatorHyperparameters;

    /// Number of scalar weights.
    fn num_parameters(&self) -> Result<usize> {
        Ok(self.parameters()?.iter().map(|(_, v)| v.elem_count()).sum())
    }
}

struct ConvLayer {
    weight: Tensor,
    bias: Option<Tensor>,
}

/// Stack of 3x3 convolutions with leaky ReLU between layers.
pub struct SlnetEstimator {
    varmap: VarMap,
    layers: Vec<ConvLayer>,
    channels: usize,
    dtype: DType,
    hyper: EstimatorHyperparameters,
}

impl SlnetEstimator {
    /// Build an estimator for `channels`-view frame stacks.
    ///
    /// Weights are drawn from a fan-in scaled uniform distribution with bound
    /// `sqrt(2 / fan_in)`, then made non-negative and scaled by
    /// `weight_multiplier`. Draws are seeded, so two estimators built with
    /// the same seed are identical.
    pub fn new(
        channels: usize,
        config: &EstimatorConfig,
        hyper: EstimatorHyperparameters,
        precision: Precision,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if channels == 0 || config.num_layers == 0 {
            return Err(SlnetError::Config(
                "estimator needs at least one channel and one layer".into(),
            ));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut layers = Vec::with_capacity(config.num_layers);
        for l in 0..config.num_layers {
            let c_in = if l == 0 { channels } else { config.hidden_channels };
            let c_out = if l + 1 == config.num_layers {
                channels
            } else {
                config.hidden_channels
            };
            let fan_in = (c_in * 9) as f64;
            let vb = vb.pp(format!("conv{l}"));

            let weight = vb.get_with_hints((c_out, c_in, 3, 3), "weight", Init::Const(0.0))?;
            let bound = (2.0 / fan_in).sqrt();
            let dist = Uniform::new_inclusive(-bound, bound);
            let values: Vec<f32> = (0..c_out * c_in * 9)
                .map(|_| (dist.sample(&mut rng).abs() * config.weight_multiplier) as f32)
                .collect();
            let init = Tensor::from_vec(values, (c_out, c_in, 3, 3), device)?;

            let bias = if config.use_bias {
                let b = 1.0 / fan_in.sqrt();
                Some(vb.get_with_hints(c_out, "bias", Init::Uniform { lo: -b, up: b })?)
            } else {
                None
            };

            set_var(&varmap, &format!("conv{l}.weight"), &init)?;
            layers.push(ConvLayer { weight, bias });
        }

        Ok(Self {
            varmap,
            layers,
            channels,
            dtype: precision.dtype(),
            hyper,
        })
    }
}

fn set_var(varmap: &VarMap, name: &str, value: &Tensor) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| SlnetError::Config("estimator variables lock poisoned".into()))?;
    let var = data
        .get(name)
        .ok_or_else(|| SlnetError::Config(format!("missing estimator variable {name}")))?;
    var.set(value)?;
    Ok(())
}

impl Estimator for SlnetEstimator {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = x.dims4()?;
        if c != self.channels {
            return Err(SlnetError::Config(format!(
                "estimator expects {} channels, got {c}",
                self.channels
            )));
        }
        let mut h = x.to_dtype(self.dtype)?;
        let last = self.layers.len() - 1;
        for (l, layer) in self.layers.iter().enumerate() {
            let w = layer.weight.to_dtype(self.dtype)?;
            h = h.conv2d(&w, 1, 1, 1, 1)?;
            if let Some(b) = &layer.bias {
                let b = b.to_dtype(self.dtype)?.reshape((1, (), 1, 1))?;
                h = h.broadcast_add(&b)?;
            }
            if l != last {
                h = candle_nn::ops::leaky_relu(&h, LEAKY_SLOPE)?;
            }
        }
        Ok(h.to_dtype(DType::F32)?)
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| SlnetError::Config("estimator variables lock poisoned".into()))?;
        let mut params: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn hyperparameters(&self) -> EstimatorHyperparameters {
        self.hyper
    }
}
