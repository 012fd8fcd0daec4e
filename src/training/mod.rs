//! Training orchestration core
//!
//! This module provides the data-parallel GAN training loop and the
//! components it drives: phase scheduling, per-phase gradient accumulation,
//! adaptive augmentation control, generator EMA, snapshots and statistics.
//!
//! # Main Components
//!
//! - **Configuration**: serde configuration tree with file and environment layering
//! - **Phases**: the Gmain/Greg/Gboth/Dmain/Dreg/Dboth schedule and its optimizers
//! - **Loss**: the StyleGAN2 loss engine with R1 and path length regularization
//! - **ADA**: augmentation probability control from discriminator statistics
//! - **Trainer**: the per-replica training loop driver
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use adagan::training::{TensorDataset, TrainingConfig, TrainingLoop};
//! use candle_core::Device;
//!
//! let config = TrainingConfig::from_file("train.yaml")?;
//! let dataset = Arc::new(TensorDataset::from_safetensors("data.safetensors", &Device::Cpu)?);
//! let mut trainer = TrainingLoop::single(config, dataset, &Device::Cpu)?;
//! let result = trainer.train()?;
//! ```

pub mod ada;
pub mod callbacks;
pub mod checkpoints;
pub mod config;
pub mod data;
pub mod distributed;
pub mod ema;
pub mod gradients;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod phase;
pub mod state;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    AugmentConfig, BatchConfig, DistributedConfig, EmaConfig, GradientClippingConfig,
    LoggingConfig, LossConfig, NetworkConfig, OptimizerConfig, OptimizerType,
    RegularizationSchedule, RunConfig, TrainingConfig,
};

// Core re-exports
pub use ada::AdaController;
pub use callbacks::{ClosureCallbacks, NoopCallbacks, TrainingCallbacks};
pub use checkpoints::{Snapshot, SnapshotManager};
pub use data::{Dataset, DistributedSampler, InfiniteLoader, TensorDataset};
pub use distributed::{DeviceFence, LocalProcessGroup, ProcessGroup, SingleProcess};
pub use ema::{ema_beta, EmaTracker};
pub use gradients::GradientBuffer;
pub use loss::{Loss, LossState, StyleGAN2Loss, StyleGAN2LossConfig};
pub use metrics::{JsonlStatsWriter, Moments, StatsCollector, StatsHub, TickReport};
pub use optimizers::{create_optimizer, Adam, PhaseOptimizer, Sgd};
pub use phase::{build_phases, ModuleRole, PhaseKind, TrainingPhase};
pub use state::{TrainingResult, TrainingState, TrainingStatus};
pub use trainer::TrainingLoop;
