//! Adaptive augmentation pipe

use candle_core::Tensor;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::translate;
use crate::error::Result;
use crate::training::config::AugmentConfig;

/// An augmentation pipe whose strength is a single probability `p`
pub trait AugmentPipe: Send + Sync {
    /// Augment a batch `[N, C, H, W]`
    fn augment(&self, img: &Tensor) -> Result<Tensor>;

    /// Current augmentation probability
    fn probability(&self) -> f64;

    /// Replace the augmentation probability
    fn set_probability(&self, p: f64);
}

/// Per-sample x-flip, integer translation and brightness/contrast jitter
///
/// Each enabled transform is applied to each sample independently with
/// probability `p`.
pub struct BasicAugmentPipe {
    p: Mutex<f64>,
    rng: Mutex<StdRng>,
    xflip: bool,
    translate_ratio: f64,
    color: bool,
}

impl BasicAugmentPipe {
    /// Create a pipe with initial probability `p`
    pub fn new(p: f64, xflip: bool, translate_ratio: f64, color: bool, seed: u64) -> Self {
        Self {
            p: Mutex::new(p.max(0.0)),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            xflip,
            translate_ratio,
            color,
        }
    }

    /// Create a pipe from the augment section
    pub fn from_config(config: &AugmentConfig, seed: u64) -> Self {
        Self::new(
            config.augment_p,
            config.xflip,
            config.translate_ratio,
            config.color,
            seed,
        )
    }

    fn augment_sample(&self, x: &Tensor, p: f64, rng: &mut StdRng) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let mut x = x.clone();

        if self.xflip && rng.random::<f64>() < p {
            let idx: Vec<u32> = (0..w as u32).rev().collect();
            let idx = Tensor::new(idx.as_slice(), x.device())?;
            x = x.index_select(&idx, 3)?;
        }

        if self.translate_ratio > 0.0 && rng.random::<f64>() < p {
            let max_x = (w as f64 * self.translate_ratio).round() as i64;
            let max_y = (h as f64 * self.translate_ratio).round() as i64;
            let dx = rng.random_range(-max_x..=max_x);
            let dy = rng.random_range(-max_y..=max_y);
            x = translate(&x, dx, dy)?;
        }

        if self.color && rng.random::<f64>() < p {
            let brightness: f64 = rng.sample::<f64, _>(StandardNormal) * 0.2;
            x = x.affine(1.0, brightness)?;
        }

        if self.color && rng.random::<f64>() < p {
            let contrast = (rng.sample::<f64, _>(StandardNormal) * 0.5).exp2();
            let mean = x.mean_keepdim(1)?.mean_keepdim(2)?.mean_keepdim(3)?;
            x = x
                .broadcast_sub(&mean)?
                .affine(contrast, 0.0)?
                .broadcast_add(&mean)?;
        }

        Ok(x)
    }
}

impl AugmentPipe for BasicAugmentPipe {
    fn augment(&self, img: &Tensor) -> Result<Tensor> {
        let p = self.probability();
        if p <= 0.0 {
            return Ok(img.clone());
        }
        let n = img.dim(0)?;
        let mut rng = self.rng.lock();
        let samples = (0..n)
            .map(|i| self.augment_sample(&img.narrow(0, i, 1)?, p, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&samples, 0)?)
    }

    fn probability(&self) -> f64 {
        *self.p.lock()
    }

    fn set_probability(&self, p: f64) {
        *self.p.lock() = p.max(0.0);
    }
}
