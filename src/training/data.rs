//! Dataset interface, sharded sampling and the infinite batch loader

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Image dataset with optional class labels
pub trait Dataset: Send + Sync {
    /// Number of samples
    fn len(&self) -> usize;

    /// Whether the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Image `u8 [C, H, W]` and label `f32 [label_dim]` of one sample
    fn get(&self, idx: usize) -> Result<(Tensor, Tensor)>;

    /// Label `f32 [label_dim]` of one sample
    fn get_label(&self, idx: usize) -> Result<Tensor>;

    /// Label dimensionality, 0 when unlabeled
    fn label_dim(&self) -> usize;

    /// Image resolution
    fn resolution(&self) -> usize;

    /// Image channels
    fn num_channels(&self) -> usize;

    /// Whether labels are present
    fn has_labels(&self) -> bool {
        self.label_dim() > 0
    }

    /// Images `u8 [B, C, H, W]` and labels `f32 [B, label_dim]` for a set of indices
    fn get_batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let mut images = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            let (img, label) = self.get(idx)?;
            images.push(img);
            labels.push(label);
        }
        let images = Tensor::stack(&images, 0)?;
        let labels = if self.has_labels() {
            Tensor::stack(&labels, 0)?
        } else {
            Tensor::zeros((indices.len(), 0), DType::F32, images.device())?
        };
        Ok((images, labels))
    }

    /// Labels `f32 [B, label_dim]` for a set of indices
    fn get_labels(&self, indices: &[usize], device: &Device) -> Result<Tensor> {
        if !self.has_labels() {
            return Ok(Tensor::zeros((indices.len(), 0), DType::F32, device)?);
        }
        let labels = indices
            .iter()
            .map(|&i| self.get_label(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&labels, 0)?.to_device(device)?)
    }
}

/// In-memory dataset of `u8` images and class indices
pub struct TensorDataset {
    images: Tensor,
    labels: Option<Vec<u32>>,
    num_classes: usize,
    device: Device,
}

impl TensorDataset {
    /// Create a dataset from images `u8 [N, C, H, W]` and optional class indices
    pub fn new(images: Tensor, labels: Option<Vec<u32>>) -> Result<Self> {
        let (n, _, h, w) = images
            .dims4()
            .map_err(|_| Error::data(format!("images must be [N, C, H, W], got {:?}", images.dims())))?;
        if h != w {
            return Err(Error::data(format!("images must be square, got {h}x{w}")));
        }
        if images.dtype() != DType::U8 {
            return Err(Error::data(format!("images must be u8, got {:?}", images.dtype())));
        }
        let num_classes = match &labels {
            Some(labels) => {
                if labels.len() != n {
                    return Err(Error::data(format!(
                        "{} labels for {} images",
                        labels.len(),
                        n
                    )));
                }
                labels.iter().max().map_or(0, |&m| m as usize + 1)
            }
            None => 0,
        };
        let device = images.device().clone();
        Ok(Self {
            images,
            labels,
            num_classes,
            device,
        })
    }

    /// Load `images` (u8 `[N, C, H, W]`) and optional `labels` (u32 `[N]`) from a safetensors file
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let images = tensors
            .remove("images")
            .ok_or_else(|| Error::data(format!("{} has no `images` tensor", path.display())))?;
        let labels = match tensors.remove("labels") {
            Some(t) => Some(t.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?),
            None => None,
        };
        let dataset = Self::new(images, labels)?;
        info!(
            path = %path.display(),
            samples = dataset.len(),
            resolution = dataset.resolution(),
            classes = dataset.num_classes,
            "Loaded dataset"
        );
        Ok(dataset)
    }

    /// Random dataset for smoke runs: `n` samples cycling through `num_classes` labels
    pub fn synthetic(
        n: usize,
        channels: usize,
        resolution: usize,
        num_classes: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let pixels: Vec<u8> = (0..n * channels * resolution * resolution)
            .map(|_| rng.random::<u8>())
            .collect();
        let images = Tensor::from_vec(pixels, (n, channels, resolution, resolution), device)?;
        let labels = (num_classes > 0).then(|| (0..n).map(|i| (i % num_classes) as u32).collect());
        Self::new(images, labels)
    }

    /// Save in the layout read by [`TensorDataset::from_safetensors`]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = std::collections::HashMap::new();
        tensors.insert("images".to_string(), self.images.clone());
        if let Some(labels) = &self.labels {
            tensors.insert(
                "labels".to_string(),
                Tensor::new(labels.as_slice(), &self.device)?,
            );
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    fn one_hot(&self, idx: usize) -> Result<Tensor> {
        let mut v = vec![0f32; self.num_classes];
        if let Some(labels) = &self.labels {
            v[labels[idx] as usize] = 1.0;
        }
        Ok(Tensor::from_vec(v, self.num_classes, &self.device)?)
    }

    fn check_index(&self, idx: usize) -> Result<()> {
        if idx >= self.len() {
            return Err(Error::data(format!(
                "index {idx} out of range for dataset of {}",
                self.len()
            )));
        }
        Ok(())
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    fn get(&self, idx: usize) -> Result<(Tensor, Tensor)> {
        self.check_index(idx)?;
        Ok((self.images.get(idx)?, self.one_hot(idx)?))
    }

    fn get_label(&self, idx: usize) -> Result<Tensor> {
        self.check_index(idx)?;
        self.one_hot(idx)
    }

    fn label_dim(&self) -> usize {
        self.num_classes
    }

    fn resolution(&self) -> usize {
        self.images.dims()[2]
    }

    fn num_channels(&self) -> usize {
        self.images.dims()[1]
    }
}

/// Per-epoch shuffled index shards for each rank
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
}

impl DistributedSampler {
    /// Create a sampler over `len` samples
    pub fn new(len: usize, rank: usize, world_size: usize, seed: u64, shuffle: bool) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::config(format!("invalid rank {rank} for world size {world_size}")));
        }
        Ok(Self {
            len,
            rank,
            world_size,
            seed,
            shuffle,
        })
    }

    /// Indices of this rank for `epoch`
    ///
    /// The permutation is padded by wrapping so every rank gets the same count.
    pub fn indices(&self, epoch: u64) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        let per_rank = self.len.div_ceil(self.world_size);
        let total = per_rank * self.world_size;
        (0..total)
            .map(|i| order[i % self.len])
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Samples per rank and epoch
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }
}

/// Endless batch source, recreating the epoch iterator when exhausted
pub struct InfiniteLoader {
    dataset: Arc<dyn Dataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    epoch: u64,
    queue: std::vec::IntoIter<usize>,
    device: Device,
}

impl InfiniteLoader {
    /// Create a loader producing batches of `batch_size` on `device`
    pub fn new(
        dataset: Arc<dyn Dataset>,
        sampler: DistributedSampler,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be greater than 0"));
        }
        let queue = sampler.indices(0).into_iter();
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            epoch: 0,
            queue,
            device: device.clone(),
        })
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Underlying dataset
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    fn try_batch(&mut self) -> Option<Vec<usize>> {
        if self.queue.len() < self.batch_size {
            return None;
        }
        Some(self.queue.by_ref().take(self.batch_size).collect())
    }

    fn next_epoch(&mut self) {
        self.epoch += 1;
        self.queue = self.sampler.indices(self.epoch).into_iter();
        debug!(epoch = self.epoch, "Recreated data iterator");
    }

    /// Next batch: images `u8 [B, C, H, W]` and labels `f32 [B, label_dim]`
    ///
    /// An exhausted epoch is replaced by the next one and the fetch retried
    /// once; a second failure is a data error.
    pub fn next_batch(&mut self) -> Result<(Tensor, Tensor)> {
        let indices = match self.try_batch() {
            Some(indices) => indices,
            None => {
                self.next_epoch();
                self.try_batch().ok_or_else(|| {
                    Error::data(format!(
                        "rank shard of {} samples cannot fill a batch of {}",
                        self.sampler.num_samples(),
                        self.batch_size
                    ))
                })?
            }
        };
        let (images, labels) = self.dataset.get_batch(&indices)?;
        Ok((images.to_device(&self.device)?, labels.to_device(&self.device)?))
    }
}
