//! Differentiable image augmentation
//!
//! Two layers apply to every image shown to the discriminator: a fixed
//! [`DiffAugment`] policy, then an optional adaptive [`AugmentPipe`] whose
//! probability is steered by the training loop.

pub mod diffaugment;
pub mod pipe;

pub use diffaugment::{DiffAugment, DiffAugmentOp};
pub use pipe::{AugmentPipe, BasicAugmentPipe};

use candle_core::Tensor;

use crate::error::Result;

/// Shift a batch `[N, C, H, W]` by whole pixels, filling with zeros
///
/// Output pixel `(y, x)` reads input pixel `(y + dy, x + dx)`.
pub(crate) fn translate(img: &Tensor, dx: i64, dy: i64) -> Result<Tensor> {
    let (_, _, h, w) = img.dims4()?;
    let pad_x = dx.unsigned_abs() as usize;
    let pad_y = dy.unsigned_abs() as usize;
    if pad_x >= w || pad_y >= h {
        return Ok(img.zeros_like()?);
    }
    let padded = img
        .pad_with_zeros(3, pad_x, pad_x)?
        .pad_with_zeros(2, pad_y, pad_y)?;
    let x0 = (pad_x as i64 + dx) as usize;
    let y0 = (pad_y as i64 + dy) as usize;
    Ok(padded.narrow(2, y0, h)?.narrow(3, x0, w)?.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_translate_shifts_and_fills_zero() {
        let img = Tensor::arange(0f32, 9.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 3, 3))
            .unwrap();
        let shifted = translate(&img, 1, 0).unwrap();
        let rows = shifted.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![1.0, 2.0, 0.0]);
        assert_eq!(rows[2], vec![7.0, 8.0, 0.0]);

        let down = translate(&img, 0, -1).unwrap();
        let rows = down.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0]);
        assert_eq!(rows[1], vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_translate_identity() {
        let img = Tensor::arange(0f32, 8.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 1, 2, 2))
            .unwrap();
        let same = translate(&img, 0, 0).unwrap();
        assert_eq!(
            same.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            img.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
