//! Small configurations, datasets and networks shared by the training tests

use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::augment::DiffAugment;
use crate::error::Result;
use crate::networks::mlp::{MlpDiscriminator, MlpDiscriminatorConfig, MlpGenerator, MlpGeneratorConfig};
use crate::networks::{Discriminator, Generator, Network};
use crate::training::config::{NetworkConfig, TrainingConfig};
use crate::training::data::TensorDataset;
use crate::training::gradients::GradientBuffer;
use crate::training::loss::{StyleGAN2Loss, StyleGAN2LossConfig};
use crate::training::metrics::{StatsCollector, StatsHub};
use crate::utils::sample;

/// Image channels of the test dataset
pub const CHANNELS: usize = 3;
/// Image resolution of the test dataset
pub const RESOLUTION: usize = 4;
/// Classes of the test dataset
pub const CLASSES: usize = 2;

fn tiny_network() -> NetworkConfig {
    NetworkConfig {
        z_dim: 8,
        w_dim: 8,
        num_ws: 3,
        mapping_layers: 1,
        hidden_dim: 16,
        discriminator_layers: 1,
        w_avg_beta: 0.995,
    }
}

/// Fast configuration writing into `run_dir`, without snapshots or stats files
pub fn tiny_config(run_dir: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.run.run_dir = run_dir.to_path_buf();
    config.run.total_kimg = 0.02;
    config.run.kimg_per_tick = 1.0;
    config.run.network_snapshot_ticks = None;
    config.batch.batch_size = 4;
    config.ema.ema_kimg = 0.01;
    config.loss.diffaugment = String::new();
    config.network = tiny_network();
    config.logging.stats_jsonl = false;
    config
}

/// Eight labeled samples
pub fn tiny_dataset() -> Arc<TensorDataset> {
    Arc::new(TensorDataset::synthetic(8, CHANNELS, RESOLUTION, CLASSES, 7, &Device::Cpu).unwrap())
}

/// Reference networks matching [`tiny_dataset`]
pub fn tiny_networks(seed: u64) -> (Arc<dyn Generator>, Arc<dyn Discriminator>) {
    let net = tiny_network();
    let g = MlpGenerator::new(
        MlpGeneratorConfig::from_network(&net, CLASSES, CHANNELS, RESOLUTION, seed),
        &Device::Cpu,
    )
    .unwrap();
    let d = MlpDiscriminator::new(
        MlpDiscriminatorConfig::from_network(&net, CLASSES, CHANNELS, RESOLUTION, seed + 1),
        &Device::Cpu,
    )
    .unwrap();
    (Arc::new(g), Arc::new(d))
}

/// Loss engine wired to fresh networks, with inputs for one round
pub struct LossFixture {
    pub g: Arc<dyn Generator>,
    pub d: Arc<dyn Discriminator>,
    pub stats: Arc<StatsHub>,
    pub collector: Arc<StatsCollector>,
    pub real_img: Tensor,
    pub real_c: Tensor,
    pub gen_z: Tensor,
    pub gen_c: Tensor,
}

impl LossFixture {
    pub fn new() -> Self {
        let (g, d) = tiny_networks(0);
        let stats = Arc::new(StatsHub::new());
        let collector = stats.collector(None);

        let mut rng = StdRng::seed_from_u64(11);
        let device = Device::Cpu;
        let real_img = sample::uniform(&mut rng, &[4, CHANNELS, RESOLUTION, RESOLUTION], &device)
            .unwrap()
            .affine(2.0, -1.0)
            .unwrap();
        let real_c = one_hot(&[0, 1, 0, 1]);
        let gen_z = sample::randn(&mut rng, &[4, 8], &device).unwrap();
        let gen_c = one_hot(&[1, 1, 0, 0]);

        Self {
            g,
            d,
            stats,
            collector,
            real_img,
            real_c,
            gen_z,
            gen_c,
        }
    }

    /// Loss engine over the fixture networks
    pub fn loss(&self, config: StyleGAN2LossConfig) -> StyleGAN2Loss {
        StyleGAN2Loss::new(
            self.g.clone(),
            self.d.clone(),
            DiffAugment::parse("").unwrap(),
            None,
            config,
            self.stats.clone(),
        )
    }

    /// Enabled buffer over the generator parameters
    pub fn g_buffer(&self) -> GradientBuffer {
        let mut buffer = GradientBuffer::new(self.g.named_parameters());
        buffer.enable();
        buffer
    }

    /// Enabled buffer over the discriminator parameters
    pub fn d_buffer(&self) -> GradientBuffer {
        let mut buffer = GradientBuffer::new(self.d.named_parameters());
        buffer.enable();
        buffer
    }
}

/// Loss settings without randomness in the generator pass
pub fn plain_loss_config() -> StyleGAN2LossConfig {
    StyleGAN2LossConfig {
        style_mixing_prob: 0.0,
        r1_gamma: 0.0,
        pl_batch_shrink: 2,
        pl_decay: 0.01,
        pl_weight: 0.0,
        seed: 0,
    }
}

fn one_hot(classes: &[usize]) -> Tensor {
    let mut v = vec![0f32; classes.len() * CLASSES];
    for (i, &c) in classes.iter().enumerate() {
        v[i * CLASSES + c] = 1.0;
    }
    Tensor::from_vec(v, (classes.len(), CLASSES), &Device::Cpu).unwrap()
}

/// Flattened values of every tensor in a buffer, by parameter name
pub fn buffer_values(buffer: &GradientBuffer) -> Result<Vec<(String, Vec<f32>)>> {
    buffer
        .named_vars()
        .iter()
        .filter_map(|(name, _)| buffer.grad_by_name(name).map(|g| (name.clone(), g)))
        .map(|(name, g)| Ok((name, g.flatten_all()?.to_vec1::<f32>()?)))
        .collect()
}

/// Flattened parameter and buffer values of a network, by name
pub fn network_values<N: Network + ?Sized>(net: &N) -> Vec<(String, Vec<f32>)> {
    net.named_parameters()
        .into_iter()
        .chain(net.named_buffers())
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name, values)
        })
        .collect()
}
