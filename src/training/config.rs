//! Training configuration system for AdaGAN
//!
//! This module provides the configuration tree for a training run: image
//! budget and tick cadence, batch geometry, EMA, loss and regularization
//! weights, augmentation, optimizers and the reference network shapes.
//! Defaults follow the original StyleGAN2 + DiffAugment training script.

use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment prefix for layered overrides (`ADAGAN__RUN__TOTAL_KIMG=...`)
pub const ENV_PREFIX: &str = "ADAGAN";

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Run length, cadence and output location
    pub run: RunConfig,

    /// Batch geometry
    pub batch: BatchConfig,

    /// Generator weight averaging
    pub ema: EmaConfig,

    /// Loss and regularization weights
    pub loss: LossConfig,

    /// Adaptive augmentation settings
    pub augment: AugmentConfig,

    /// Generator optimizer
    pub g_optimizer: OptimizerConfig,

    /// Discriminator optimizer
    pub d_optimizer: OptimizerConfig,

    /// Lazy regularization schedule
    pub regularization: RegularizationSchedule,

    /// Gradient clipping applied before every optimizer step
    pub gradient_clipping: GradientClippingConfig,

    /// Shapes of the reference networks
    pub network: NetworkConfig,

    /// Data-parallel layout
    pub distributed: DistributedConfig,

    /// Logging and statistics output
    pub logging: LoggingConfig,
}

/// Run length, tick cadence and snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Output directory for snapshots and statistics
    pub run_dir: PathBuf,

    /// Global random seed; each rank derives `seed * world + rank`
    pub random_seed: u64,

    /// Total length of training, in thousands of real images
    pub total_kimg: f64,

    /// Progress report interval, in thousands of real images
    pub kimg_per_tick: f64,

    /// How often to save network snapshots, in ticks. None disables snapshots.
    pub network_snapshot_ticks: Option<u64>,

    /// Snapshot to resume network weights from
    pub resume_from: Option<PathBuf>,
}

/// Batch geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Total batch size for one training iteration across all replicas
    pub batch_size: usize,

    /// Samples processed at a time by one replica. Defaults to `batch_size / replicas`.
    pub batch_gpu: Option<usize>,
}

/// Generator EMA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    /// Half-life of the generator weight average, in thousands of images
    pub ema_kimg: f64,

    /// Ramp-up coefficient; caps the half-life at `cur_nimg * ema_rampup`
    pub ema_rampup: Option<f64>,
}

/// Loss configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// R1 regularization weight
    pub r1_gamma: f64,

    /// Probability of style mixing per generator call
    pub style_mixing_prob: f64,

    /// Path length regularization weight. Zero disables it.
    pub pl_weight: f64,

    /// Decay of the running path length mean
    pub pl_decay: f64,

    /// Batch shrink factor for the path length pass
    pub pl_batch_shrink: usize,

    /// Fixed DiffAugment policy, comma separated. Empty disables it.
    pub diffaugment: String,
}

/// Adaptive augmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Whether an augmentation pipe is configured at all
    pub enabled: bool,

    /// Initial augmentation probability
    pub augment_p: f64,

    /// Target value of the real-logit sign statistic. None keeps `p` fixed.
    pub ada_target: Option<f64>,

    /// Adjust `p` every this many iterations
    pub ada_interval: u64,

    /// Adjustment speed: kimg it takes for `p` to move by one unit
    pub ada_kimg: f64,

    /// Enable horizontal flips in the pipe
    pub xflip: bool,

    /// Maximum integer translation as a fraction of the resolution
    pub translate_ratio: f64,

    /// Enable brightness/contrast jitter in the pipe
    pub color: bool,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub optimizer_type: OptimizerType,

    /// Base learning rate
    pub learning_rate: f64,

    /// Beta1 parameter for Adam
    pub beta1: f64,

    /// Beta2 parameter for Adam
    pub beta2: f64,

    /// Epsilon for numerical stability
    pub epsilon: f64,
}

/// Optimizer types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    /// Adam with bias correction
    Adam,
    /// Stochastic gradient descent with optional momentum
    Sgd {
        /// Momentum coefficient
        momentum: f64,
    },
}

/// Lazy regularization schedule
///
/// Without intervals every module trains in a single fused phase. With an
/// interval `r`, the module gets a main phase every iteration and a
/// regularization phase every `r` iterations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizationSchedule {
    /// Generator regularization interval
    pub g_reg_interval: Option<u64>,

    /// Discriminator regularization interval
    pub d_reg_interval: Option<u64>,
}

/// Gradient clipping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientClippingConfig {
    /// Enable gradient clipping
    pub enabled: bool,

    /// Global L2 norm threshold
    pub max_norm: f64,
}

/// Reference network shapes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Latent dimensionality
    pub z_dim: usize,

    /// Intermediate style dimensionality
    pub w_dim: usize,

    /// Number of style vectors consumed by synthesis
    pub num_ws: usize,

    /// Fully connected layers in the mapping network
    pub mapping_layers: usize,

    /// Hidden width of synthesis and discriminator
    pub hidden_dim: usize,

    /// Hidden layers in the discriminator
    pub discriminator_layers: usize,

    /// Decay of the tracked average style vector
    pub w_avg_beta: f64,
}

/// Data-parallel layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Number of replicas training in lockstep
    pub num_replicas: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Append tick statistics to `stats.jsonl` in the run directory
    pub stats_jsonl: bool,

    /// Log every iteration at debug level
    pub log_iterations: bool,
}

impl TrainingConfig {
    /// Create a new training configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file, layered with `ADAGAN__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => FileFormat::Json,
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            other => {
                return Err(Error::config(format!(
                    "Unsupported configuration file extension: {:?}",
                    other
                )))
            }
        };

        let settings = config::Config::builder()
            .add_source(File::from(path).format(format))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file (JSON or YAML by extension)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.run.total_kimg > 0.0) {
            return Err(Error::config("total_kimg must be positive"));
        }
        if !(self.run.kimg_per_tick > 0.0) {
            return Err(Error::config("kimg_per_tick must be positive"));
        }
        if self.run.network_snapshot_ticks == Some(0) {
            return Err(Error::config("network_snapshot_ticks must be at least 1"));
        }

        let replicas = self.distributed.num_replicas;
        if replicas == 0 {
            return Err(Error::config("num_replicas must be greater than 0"));
        }
        if self.batch.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        let batch_gpu = self.batch_gpu();
        if batch_gpu == 0 || self.batch.batch_size % (batch_gpu * replicas) != 0 {
            return Err(Error::config(format!(
                "batch_size {} must be a multiple of batch_gpu {} x replicas {}",
                self.batch.batch_size, batch_gpu, replicas
            )));
        }

        if self.ema.ema_kimg < 0.0 {
            return Err(Error::config("ema_kimg must be non-negative"));
        }
        if matches!(self.ema.ema_rampup, Some(r) if r <= 0.0) {
            return Err(Error::config("ema_rampup must be positive when set"));
        }

        if self.loss.r1_gamma < 0.0 {
            return Err(Error::config("r1_gamma must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.loss.style_mixing_prob) {
            return Err(Error::config("style_mixing_prob must be in [0, 1]"));
        }
        if self.loss.pl_weight < 0.0 {
            return Err(Error::config("pl_weight must be non-negative"));
        }
        if self.loss.pl_batch_shrink == 0 {
            return Err(Error::config("pl_batch_shrink must be at least 1"));
        }
        crate::augment::DiffAugment::parse(&self.loss.diffaugment)?;

        if self.augment.augment_p < 0.0 {
            return Err(Error::config("augment_p must be non-negative"));
        }
        if self.augment.ada_interval == 0 {
            return Err(Error::config("ada_interval must be at least 1"));
        }
        if !(self.augment.ada_kimg > 0.0) {
            return Err(Error::config("ada_kimg must be positive"));
        }
        if !(0.0..=0.5).contains(&self.augment.translate_ratio) {
            return Err(Error::config("translate_ratio must be in [0, 0.5]"));
        }

        for (name, opt) in [("g_optimizer", &self.g_optimizer), ("d_optimizer", &self.d_optimizer)] {
            if opt.learning_rate <= 0.0 {
                return Err(Error::config(format!("{}: learning rate must be positive", name)));
            }
            if !(0.0..1.0).contains(&opt.beta1) || !(0.0..1.0).contains(&opt.beta2) {
                return Err(Error::config(format!("{}: betas must be in [0, 1)", name)));
            }
        }

        for interval in [self.regularization.g_reg_interval, self.regularization.d_reg_interval] {
            if interval == Some(0) {
                return Err(Error::config("Regularization intervals must be at least 1"));
            }
        }

        if self.gradient_clipping.enabled && !(self.gradient_clipping.max_norm > 0.0) {
            return Err(Error::config("Gradient clipping max_norm must be positive"));
        }

        let net = &self.network;
        if net.z_dim == 0 || net.w_dim == 0 || net.hidden_dim == 0 {
            return Err(Error::config("Network dimensions must be greater than 0"));
        }
        if net.num_ws < 2 {
            return Err(Error::config("num_ws must be at least 2"));
        }
        if net.mapping_layers == 0 {
            return Err(Error::config("mapping_layers must be at least 1"));
        }

        Ok(())
    }

    /// Per-replica batch size
    pub fn batch_gpu(&self) -> usize {
        self.batch
            .batch_gpu
            .unwrap_or(self.batch.batch_size / self.distributed.num_replicas.max(1))
    }

    /// Number of accumulation rounds per optimizer step
    pub fn accumulation_rounds(&self) -> usize {
        let per_step = self.batch_gpu() * self.distributed.num_replicas;
        (self.batch.batch_size / per_step.max(1)).max(1)
    }

    /// Total image budget, rounded up to whole images
    pub fn total_nimg(&self) -> u64 {
        // Absorb float noise such as 2.007 * 1000 = 2007.0000000000002
        (self.run.total_kimg * 1000.0 - 1e-6).ceil().max(0.0) as u64
    }

    /// Whether the augmentation pipe should be constructed
    pub fn augment_pipe_enabled(&self) -> bool {
        self.augment.enabled && (self.augment.augment_p > 0.0 || self.augment.ada_target.is_some())
    }
}

impl OptimizerConfig {
    /// Scale hyperparameters for lazy regularization with the given interval
    pub fn lazy_regularized(&self, interval: u64) -> Self {
        let mb_ratio = interval as f64 / (interval as f64 + 1.0);
        Self {
            optimizer_type: self.optimizer_type.clone(),
            learning_rate: self.learning_rate * mb_ratio,
            beta1: self.beta1.powf(mb_ratio),
            beta2: self.beta2.powf(mb_ratio),
            epsilon: self.epsilon,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            batch: BatchConfig::default(),
            ema: EmaConfig::default(),
            loss: LossConfig::default(),
            augment: AugmentConfig::default(),
            g_optimizer: OptimizerConfig::default(),
            d_optimizer: OptimizerConfig::default(),
            regularization: RegularizationSchedule::default(),
            gradient_clipping: GradientClippingConfig::default(),
            network: NetworkConfig::default(),
            distributed: DistributedConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("runs"),
            random_seed: 0,
            total_kimg: 25000.0,
            kimg_per_tick: 0.5,
            network_snapshot_ticks: Some(50),
            resume_from: None,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            batch_gpu: None,
        }
    }
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            ema_kimg: 10.0,
            ema_rampup: None,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            r1_gamma: 10.0,
            style_mixing_prob: 0.9,
            pl_weight: 0.0,
            pl_decay: 0.01,
            pl_batch_shrink: 2,
            diffaugment: "color,translation,cutout".to_string(),
        }
    }
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            augment_p: 0.0,
            ada_target: None,
            ada_interval: 4,
            ada_kimg: 500.0,
            xflip: true,
            translate_ratio: 0.125,
            color: true,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::Adam,
            learning_rate: 0.0025,
            beta1: 0.0,
            beta2: 0.99,
            epsilon: 1e-8,
        }
    }
}

impl Default for GradientClippingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_norm: 10.0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            z_dim: 64,
            w_dim: 64,
            num_ws: 4,
            mapping_layers: 2,
            hidden_dim: 128,
            discriminator_layers: 2,
            w_avg_beta: 0.995,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self { num_replicas: 1 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stats_jsonl: true,
            log_iterations: false,
        }
    }
}
