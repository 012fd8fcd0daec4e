//! Utility functions shared across the training core

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;

/// Seeded tensor sampling
///
/// All random tensors go through a host-side `StdRng` so that runs are
/// reproducible on every backend.
pub mod sample {
    use super::*;

    /// Standard normal tensor with the given dims
    pub fn randn(rng: &mut StdRng, dims: &[usize], device: &Device) -> Result<Tensor> {
        let numel: usize = dims.iter().product();
        let data: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
        Ok(Tensor::from_vec(data, dims, device)?)
    }

    /// Uniform `[0, 1)` tensor with the given dims
    pub fn uniform(rng: &mut StdRng, dims: &[usize], device: &Device) -> Result<Tensor> {
        let numel: usize = dims.iter().product();
        let data: Vec<f32> = (0..numel).map(|_| rng.random::<f32>()).collect();
        Ok(Tensor::from_vec(data, dims, device)?)
    }
}

/// Numerical helpers
pub mod math {
    use super::*;

    /// Softplus, `log(1 + exp(x))`, in the overflow-safe form `relu(x) + log(1 + exp(-|x|))`
    pub fn softplus(x: &Tensor) -> Result<Tensor> {
        let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
        Ok(x.relu()?.add(&tail)?)
    }

    /// Leaky ReLU with slope 0.2, scaled by `sqrt(2)`
    pub fn lrelu(x: &Tensor) -> Result<Tensor> {
        let gain = std::f64::consts::SQRT_2;
        let pos = x.relu()?.affine(0.8 * gain, 0.0)?;
        Ok(pos.add(&x.affine(0.2 * gain, 0.0)?)?)
    }

    /// `np.sign` semantics: -1, 0 or 1
    pub fn sign(x: f64) -> f64 {
        if x > 0.0 {
            1.0
        } else if x < 0.0 {
            -1.0
        } else {
            0.0
        }
    }

    /// Normalize each row by its root mean square
    pub fn normalize_2nd_moment(x: &Tensor) -> Result<Tensor> {
        let rms = x.sqr()?.mean_keepdim(1)?.affine(1.0, 1e-8)?.sqrt()?;
        Ok(x.broadcast_div(&rms)?)
    }
}

/// File I/O utilities
pub mod io {
    use std::fs;
    use std::path::Path;

    use crate::error::Result;

    /// Ensure directory exists
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn test_randn_is_seeded() {
        let device = Device::Cpu;
        let a = sample::randn(&mut StdRng::seed_from_u64(7), &[3, 4], &device).unwrap();
        let b = sample::randn(&mut StdRng::seed_from_u64(7), &[3, 4], &device).unwrap();
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(a.dims(), &[3, 4]);
    }

    #[test]
    fn test_softplus_matches_reference() {
        let x = Tensor::new(&[-30.0f32, -1.0, 0.0, 1.0, 30.0], &Device::Cpu).unwrap();
        let y = math::softplus(&x).unwrap().to_vec1::<f32>().unwrap();
        for (xi, yi) in [-30.0f64, -1.0, 0.0, 1.0, 30.0].iter().zip(y) {
            let expected = (1.0 + xi.exp()).ln();
            assert_relative_eq!(yi as f64, expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_sign_semantics() {
        assert_eq!(math::sign(0.2), 1.0);
        assert_eq!(math::sign(-0.2), -1.0);
        assert_eq!(math::sign(0.0), 0.0);
    }

    #[test]
    fn test_lrelu() {
        let x = Tensor::new(&[-1.0f32, 2.0], &Device::Cpu).unwrap();
        let y = math::lrelu(&x).unwrap().to_vec1::<f32>().unwrap();
        let g = std::f32::consts::SQRT_2;
        assert_relative_eq!(y[0], -0.2 * g, epsilon = 1e-6);
        assert_relative_eq!(y[1], 2.0 * g, epsilon = 1e-6);
    }
}
