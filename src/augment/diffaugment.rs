//! Fixed DiffAugment policy: color, translation and cutout

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::translate;
use crate::error::{Error, Result};
use crate::utils::sample;

/// Fraction of the resolution used for random translation
const TRANSLATION_RATIO: f64 = 0.125;

/// Fraction of the resolution masked by cutout
const CUTOUT_RATIO: f64 = 0.5;

/// One transform of the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAugmentOp {
    /// Random brightness, saturation and contrast
    Color,
    /// Random integer translation with zero fill
    Translation,
    /// Random square mask
    Cutout,
}

impl FromStr for DiffAugmentOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "color" => Ok(Self::Color),
            "translation" => Ok(Self::Translation),
            "cutout" => Ok(Self::Cutout),
            other => Err(Error::config(format!("Unknown DiffAugment policy: {other:?}"))),
        }
    }
}

impl fmt::Display for DiffAugmentOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Color => "color",
            Self::Translation => "translation",
            Self::Cutout => "cutout",
        };
        f.write_str(name)
    }
}

/// A parsed DiffAugment policy with its own random stream
pub struct DiffAugment {
    ops: Vec<DiffAugmentOp>,
    rng: Mutex<StdRng>,
}

impl DiffAugment {
    /// Parse a comma separated policy; an empty string disables augmentation
    pub fn parse(policy: &str) -> Result<Self> {
        let ops = policy
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(DiffAugmentOp::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ops,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        })
    }

    /// Reseed the random stream
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            ops: self.ops,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Parsed transforms in application order
    pub fn ops(&self) -> &[DiffAugmentOp] {
        &self.ops
    }

    /// Whether the policy does nothing
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply the policy to a batch `[N, C, H, W]`
    pub fn apply(&self, img: &Tensor) -> Result<Tensor> {
        let mut rng = self.rng.lock();
        let mut x = img.clone();
        for op in &self.ops {
            x = match op {
                DiffAugmentOp::Color => color(&x, &mut rng)?,
                DiffAugmentOp::Translation => translation(&x, &mut rng)?,
                DiffAugmentOp::Cutout => cutout(&x, &mut rng)?,
            };
        }
        Ok(x)
    }
}

impl fmt::Debug for DiffAugment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffAugment").field("ops", &self.ops).finish()
    }
}

fn per_sample(rng: &mut StdRng, n: usize, device: &Device) -> Result<Tensor> {
    Ok(sample::uniform(rng, &[n, 1, 1, 1], device)?)
}

fn color(x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let n = x.dim(0)?;
    let device = x.device();

    let brightness = per_sample(rng, n, device)?.affine(1.0, -0.5)?;
    let x = x.broadcast_add(&brightness)?;

    let mean = x.mean_keepdim(1)?;
    let saturation = per_sample(rng, n, device)?.affine(2.0, 0.0)?;
    let x = x
        .broadcast_sub(&mean)?
        .broadcast_mul(&saturation)?
        .broadcast_add(&mean)?;

    let mean = x.mean_keepdim(1)?.mean_keepdim(2)?.mean_keepdim(3)?;
    let contrast = per_sample(rng, n, device)?.affine(1.0, 0.5)?;
    Ok(x
        .broadcast_sub(&mean)?
        .broadcast_mul(&contrast)?
        .broadcast_add(&mean)?)
}

fn translation(x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let (n, _, h, w) = x.dims4()?;
    let shift_x = (w as f64 * TRANSLATION_RATIO + 0.5) as i64;
    let shift_y = (h as f64 * TRANSLATION_RATIO + 0.5) as i64;
    let samples = (0..n)
        .map(|i| {
            let dx = rng.random_range(-shift_x..=shift_x);
            let dy = rng.random_range(-shift_y..=shift_y);
            translate(&x.narrow(0, i, 1)?, dx, dy)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&samples, 0)?)
}

fn cutout(x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let (n, _, h, w) = x.dims4()?;
    let cut_h = (h as f64 * CUTOUT_RATIO + 0.5) as usize;
    let cut_w = (w as f64 * CUTOUT_RATIO + 0.5) as usize;

    let mut mask = vec![1f32; n * h * w];
    for i in 0..n {
        let cy = rng.random_range(0..h + (1 - cut_h % 2)) as i64;
        let cx = rng.random_range(0..w + (1 - cut_w % 2)) as i64;
        for dy in 0..cut_h as i64 {
            for dx in 0..cut_w as i64 {
                let y = (cy + dy - cut_h as i64 / 2).clamp(0, h as i64 - 1) as usize;
                let x = (cx + dx - cut_w as i64 / 2).clamp(0, w as i64 - 1) as usize;
                mask[i * h * w + y * w + x] = 0.0;
            }
        }
    }
    let mask = Tensor::from_vec(mask, (n, 1, h, w), x.device())?;
    Ok(x.broadcast_mul(&mask)?)
}
