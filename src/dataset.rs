//! Volume sources, batching and temporal sub-group slicing.
//!
//! A volume is a `[view, depth, H, W]` tensor of camera counts. The loader
//! stacks every volume with its sparse reference along a new trailing
//! dimension (`[view, depth, H, W, 2]`, index 0 observed, last index sparse
//! reference) and batches them to `[B, view, depth, H, W, 2]`. The trainer
//! then cuts each batch into [`ENSEMBLE_SIZE`] temporal sub-groups with
//! [`temporal_subgroup`].

use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

use crate::config::{DataConfig, DataSourceKind, SyntheticConfig, ENSEMBLE_SIZE};
use crate::error::{Result, SlnetError};
use crate::normalization::NormalizationStatistics;

/// Tensor name of the observed volumes in a safetensors file.
pub const VOLUMES_KEY: &str = "volumes";
/// Tensor name of the optional sparse ground truth.
pub const SPARSE_KEY: &str = "sparse";

/// One volume and its optional sparse ground truth, both `[view, depth, H, W]`.
#[derive(Debug, Clone)]
pub struct VolumeSample {
    /// Observed camera counts.
    pub observed: Tensor,
    /// Sparse ground truth, when the source has one.
    pub sparse: Option<Tensor>,
}

impl VolumeSample {
    /// Stack `[observed, sparse]` along a new trailing dimension.
    ///
    /// Without sparse ground truth the observed volume is duplicated so
    /// downstream code can always read index 0 and the last index.
    pub fn dual_channel(&self) -> Result<Tensor> {
        let sparse = self.sparse.as_ref().unwrap_or(&self.observed);
        Ok(Tensor::stack(&[&self.observed, sparse], D::Minus1)?)
    }
}

/// Indexed collection of volumes.
pub trait VolumeSource {
    /// Number of volumes.
    fn len(&self) -> usize;

    /// Whether the source holds no volumes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether volumes carry sparse ground truth.
    fn has_sparse(&self) -> bool;

    /// Volume at `index`.
    fn volume(&self, index: usize) -> Result<VolumeSample>;
}

/// Volumes held as one `[N, view, depth, H, W]` tensor.
#[derive(Debug, Clone)]
pub struct InMemoryVolumes {
    volumes: Tensor,
    sparse: Option<Tensor>,
}

impl InMemoryVolumes {
    /// Wrap tensors; `sparse` must match the shape of `volumes`.
    pub fn new(volumes: Tensor, sparse: Option<Tensor>) -> Result<Self> {
        if volumes.rank() != 5 {
            return Err(SlnetError::Dataset(format!(
                "expected volumes of rank 5 [N, view, depth, H, W], got {:?}",
                volumes.dims()
            )));
        }
        if let Some(s) = &sparse {
            if s.dims() != volumes.dims() {
                return Err(SlnetError::Dataset(format!(
                    "sparse shape {:?} does not match volumes {:?}",
                    s.dims(),
                    volumes.dims()
                )));
            }
        }
        let volumes = volumes.to_dtype(DType::F32)?;
        let sparse = sparse.map(|s| s.to_dtype(DType::F32)).transpose()?;
        Ok(Self { volumes, sparse })
    }

    /// Load a safetensors file with a `volumes` tensor and, if requested, a
    /// `sparse` tensor.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, load_sparse: bool, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SlnetError::Dataset(format!(
                "volume file not found: {}",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let volumes = tensors.remove(VOLUMES_KEY).ok_or_else(|| {
            SlnetError::Dataset(format!(
                "{} has no `{VOLUMES_KEY}` tensor",
                path.display()
            ))
        })?;
        let sparse = if load_sparse {
            Some(tensors.remove(SPARSE_KEY).ok_or_else(|| {
                SlnetError::Dataset(format!(
                    "{} has no `{SPARSE_KEY}` tensor but data.load_sparse is set",
                    path.display()
                ))
            })?)
        } else {
            None
        };
        tracing::info!("Loaded volumes {:?} from {}", volumes.dims(), path.display());
        Self::new(volumes, sparse)
    }

    /// Generate volumes with a rank-`background_rank` background (across
    /// views) and sparse transient spots; the spots are returned as ground
    /// truth.
    pub fn synthetic(config: &SyntheticConfig, seed: u64, device: &Device) -> Result<Self> {
        let SyntheticConfig {
            volumes: n,
            views,
            depth,
            side,
            background_rank,
            sparse_fraction,
        } = *config;
        let pixels = side * side;
        let mut rng = StdRng::seed_from_u64(seed);
        let unit = Uniform::new(0f32, 1f32);
        let amplitude = Uniform::new(50f32, 150f32);

        let mut observed = Vec::with_capacity(n * views * depth * pixels);
        let mut sparse = Vec::with_capacity(observed.capacity());
        for _ in 0..n {
            let view_gain: Vec<Vec<f32>> = (0..background_rank)
                .map(|_| (0..views).map(|_| 0.5 + unit.sample(&mut rng)).collect())
                .collect();
            let pattern: Vec<Vec<f32>> = (0..background_rank)
                .map(|_| (0..pixels).map(|_| 20.0 * unit.sample(&mut rng)).collect())
                .collect();
            let time_gain: Vec<Vec<f32>> = (0..background_rank)
                .map(|_| (0..depth).map(|_| 0.8 + 0.4 * unit.sample(&mut rng)).collect())
                .collect();

            for c in 0..views {
                for d in 0..depth {
                    for p in 0..pixels {
                        let background: f32 = (0..background_rank)
                            .map(|r| view_gain[r][c] * time_gain[r][d] * pattern[r][p])
                            .sum();
                        let spot = if rng.gen_bool(sparse_fraction.clamp(0.0, 1.0)) {
                            amplitude.sample(&mut rng)
                        } else {
                            0.0
                        };
                        observed.push(background + spot);
                        sparse.push(spot);
                    }
                }
            }
        }

        let shape = (n, views, depth, side, side);
        let observed = Tensor::from_vec(observed, shape, device)?;
        let sparse = Tensor::from_vec(sparse, shape, device)?;
        Self::new(observed, Some(sparse))
    }

    /// Restrict to the volumes at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let n = self.len();
        if let Some(bad) = indices.iter().find(|&&i| i >= n) {
            return Err(SlnetError::Dataset(format!(
                "image index {bad} out of range for {n} volumes"
            )));
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::new(ids.as_slice(), self.volumes.device())?;
        Ok(Self {
            volumes: self.volumes.index_select(&ids, 0)?,
            sparse: self
                .sparse
                .as_ref()
                .map(|s| s.index_select(&ids, 0))
                .transpose()?,
        })
    }

    /// `(view, depth, H, W)` of every volume.
    pub fn volume_dims(&self) -> (usize, usize, usize, usize) {
        let d = self.volumes.dims();
        (d[1], d[2], d[3], d[4])
    }

    /// Intensity statistics over every held volume.
    pub fn statistics(&self) -> Result<NormalizationStatistics> {
        NormalizationStatistics::from_tensors(&self.volumes, self.sparse.as_ref())
    }
}

impl VolumeSource for InMemoryVolumes {
    fn len(&self) -> usize {
        self.volumes.dims()[0]
    }

    fn has_sparse(&self) -> bool {
        self.sparse.is_some()
    }

    fn volume(&self, index: usize) -> Result<VolumeSample> {
        if index >= self.len() {
            return Err(SlnetError::Dataset(format!(
                "volume index {index} out of range for {} volumes",
                self.len()
            )));
        }
        Ok(VolumeSample {
            observed: self.volumes.get(index)?,
            sparse: self.sparse.as_ref().map(|s| s.get(index)).transpose()?,
        })
    }
}

/// Load the training volumes described by `config`, restricted to
/// `images_to_use` when it is not empty.
pub fn load_training_volumes(config: &DataConfig, seed: u64, device: &Device) -> Result<InMemoryVolumes> {
    let all = match config.source {
        DataSourceKind::Safetensors => {
            InMemoryVolumes::from_safetensors(&config.path, config.load_sparse, device)?
        }
        DataSourceKind::Synthetic => InMemoryVolumes::synthetic(&config.synthetic, seed, device)?,
    };
    if config.images_to_use.is_empty() {
        Ok(all)
    } else {
        all.select(&config.images_to_use)
    }
}

/// Load held-out test volumes, if configured.
///
/// A synthetic source without a test path generates a fresh set from a
/// shifted seed.
pub fn load_test_volumes(config: &DataConfig, seed: u64, device: &Device) -> Result<Option<InMemoryVolumes>> {
    match (&config.test_path, &config.source) {
        (Some(path), _) => Ok(Some(InMemoryVolumes::from_safetensors(
            path,
            config.load_sparse,
            device,
        )?)),
        (None, DataSourceKind::Synthetic) => Ok(Some(InMemoryVolumes::synthetic(
            &config.synthetic,
            seed.wrapping_add(1),
            device,
        )?)),
        (None, DataSourceKind::Safetensors) => Ok(None),
    }
}

/// Split `0..n` into `(train, validation)`.
///
/// `ceil(validation_split * n)` indices go to validation. With `shuffle` the
/// indices are permuted with `seed` first.
pub fn train_validation_split(n: usize, validation_split: f64, shuffle: bool, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    if shuffle {
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    let split = ((validation_split * n as f64).ceil() as usize).min(n);
    let train = indices.split_off(split);
    (train, indices)
}

/// Batches over a fixed list of volume indices.
pub struct StageLoader<'a> {
    source: &'a dyn VolumeSource,
    indices: Vec<usize>,
    batch_size: usize,
}

impl<'a> StageLoader<'a> {
    /// Create a loader; `batch_size` is clamped to at least 1.
    pub fn new(source: &'a dyn VolumeSource, indices: Vec<usize>, batch_size: usize) -> Self {
        Self {
            source,
            indices,
            batch_size: batch_size.max(1),
        }
    }

    /// Loader over every volume of `source`.
    pub fn full(source: &'a dyn VolumeSource, batch_size: usize) -> Self {
        Self::new(source, (0..source.len()).collect(), batch_size)
    }

    /// Number of samples the loader yields per pass.
    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    /// Number of batches per pass; the last batch may be short.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Iterate `(indices, [B, view, depth, H, W, 2])` batches.
    pub fn batches(&self) -> impl Iterator<Item = Result<(Vec<usize>, Tensor)>> + '_ {
        self.indices.chunks(self.batch_size).map(move |chunk| {
            let stacked = chunk
                .iter()
                .map(|&i| self.source.volume(i)?.dual_channel())
                .collect::<Result<Vec<_>>>()?;
            Ok((chunk.to_vec(), Tensor::stack(&stacked, 0)?))
        })
    }
}

/// Check that a volume of `depth` frames covers every sub-group window.
pub fn check_depth_coverage(depth: usize, depth_window: usize, first_window: usize) -> Result<()> {
    let needed = (first_window + ENSEMBLE_SIZE) * depth_window;
    if depth < needed {
        return Err(SlnetError::Config(format!(
            "volume depth {depth} is smaller than the {needed} frames needed by \
             {ENSEMBLE_SIZE} sub-groups of {depth_window} starting at window {first_window}"
        )));
    }
    Ok(())
}

/// Cut sub-group `index` out of a `[B, view, depth, H, W, 2]` batch and
/// flatten it to `[B * depth_window, view, H, W, 2]`.
pub fn temporal_subgroup(batch: &Tensor, index: usize, depth_window: usize, first_window: usize) -> Result<Tensor> {
    let dims = batch.dims();
    if dims.len() != 6 {
        return Err(SlnetError::Dataset(format!(
            "expected a [B, view, depth, H, W, 2] batch, got {dims:?}"
        )));
    }
    let (b, c, h, w, ch) = (dims[0], dims[1], dims[3], dims[4], dims[5]);
    let start = (first_window + index) * depth_window;
    Ok(batch
        .narrow(2, start, depth_window)?
        .permute(vec![0, 2, 1, 3, 4, 5])?
        .contiguous()?
        .reshape((b * depth_window, c, h, w, ch))?)
}

/// Split a dual-channel tensor into `(observed, sparse_reference)`.
pub fn split_channels(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let last = x.dim(D::Minus1)?;
    let observed = x.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
    let sparse = x.narrow(D::Minus1, last - 1, 1)?.squeeze(D::Minus1)?;
    Ok((observed, sparse))
}
