//! AdaGAN - data-parallel StyleGAN2 training with adaptive differentiable augmentation
//!
//! This crate provides the training orchestration core of a generative
//! adversarial image model: the per-phase gradient accumulation protocol
//! with lazy regularization, adaptive augmentation strength control,
//! generator weight averaging and the multi-replica training loop.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod augment;
pub mod error;
pub mod logging;
pub mod networks;
pub mod training;
pub mod utils;

// Re-exports
pub use augment::{AugmentPipe, BasicAugmentPipe, DiffAugment};
pub use error::{Error, Result};
pub use networks::{Discriminator, Generator, Network};
pub use training::{TrainingConfig, TrainingLoop, TrainingResult, TrainingState};
