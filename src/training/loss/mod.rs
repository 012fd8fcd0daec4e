//! Loss engine interface
//!
//! A [`Loss`] runs the forward and backward passes of one phase for one
//! accumulation round and deposits gradients into the phase's buffer. It
//! never steps optimizers or zeroes gradients.

pub mod stylegan2;

pub use stylegan2::{StyleGAN2Loss, StyleGAN2LossConfig};

use candle_core::Tensor;

use super::gradients::GradientBuffer;
use super::phase::PhaseKind;
use crate::error::Result;

/// Inputs of one `accumulate_gradients` call
#[derive(Debug, Clone, Copy)]
pub struct LossState<'a> {
    /// Real images `[N, C, H, W]` in `[-1, 1]`
    pub real_img: &'a Tensor,

    /// Real conditioning `[N, c_dim]`
    pub real_c: &'a Tensor,

    /// Latents `[M, z_dim]`
    pub gen_z: &'a Tensor,

    /// Generated conditioning `[M, c_dim]`
    pub gen_c: &'a Tensor,

    /// Whether this round synchronizes replicas
    pub sync: bool,

    /// Loss multiplier, the phase interval
    pub gain: f64,
}

/// Per-phase gradient accumulation
pub trait Loss: Send {
    /// Accumulate the gradients of `phase` into `grads`, returning the mean main loss
    fn accumulate_gradients(
        &mut self,
        phase: PhaseKind,
        state: &LossState<'_>,
        grads: &mut GradientBuffer,
    ) -> Result<f64>;
}
