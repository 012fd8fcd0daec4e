//! Network interfaces consumed by the training core
//!
//! The trainer only sees [`Generator`] and [`Discriminator`] trait objects.
//! Parameters and buffers are exposed as named `candle_core::Var`s so that
//! gradient buffers, EMA tracking and snapshots can address them by name.
//! [`mlp`] provides small reference networks.

pub mod mlp;

pub use mlp::{MlpDiscriminator, MlpGenerator};

use candle_core::{Tensor, Var};

use crate::error::{Error, Result};

/// A module with named trainable parameters and non-trainable buffers
pub trait Network: Send + Sync {
    /// Trainable parameters, sorted by name
    fn named_parameters(&self) -> Vec<(String, Var)>;

    /// Non-trainable state tensors, sorted by name
    fn named_buffers(&self) -> Vec<(String, Var)> {
        Vec::new()
    }

    /// Trainable parameters in name order
    fn parameters(&self) -> Vec<Var> {
        self.named_parameters().into_iter().map(|(_, v)| v).collect()
    }

    /// Total number of trainable scalars
    fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum()
    }
}

/// Mapping + synthesis generator
pub trait Generator: Network {
    /// Latent dimensionality
    fn z_dim(&self) -> usize;

    /// Conditioning dimensionality (0 when unconditional)
    fn c_dim(&self) -> usize;

    /// Intermediate style dimensionality
    fn w_dim(&self) -> usize;

    /// Number of style vectors consumed by synthesis
    fn num_ws(&self) -> usize;

    /// Output image channels
    fn img_channels(&self) -> usize;

    /// Output image resolution
    fn img_resolution(&self) -> usize;

    /// Map latents to styles `[N, num_ws, w_dim]`
    ///
    /// Unless `skip_w_avg_update` is set, the tracked average style is updated.
    fn mapping(&self, z: &Tensor, c: &Tensor, skip_w_avg_update: bool) -> Result<Tensor>;

    /// Render styles to images `[N, C, H, W]`
    fn synthesis(&self, ws: &Tensor) -> Result<Tensor>;

    /// Independent copy with identical parameter and buffer values
    fn deep_copy(&self) -> Result<Box<dyn Generator>>;
}

/// Image discriminator
pub trait Discriminator: Network {
    /// Conditioning dimensionality (0 when unconditional)
    fn c_dim(&self) -> usize;

    /// Input image channels
    fn img_channels(&self) -> usize;

    /// Input image resolution
    fn img_resolution(&self) -> usize;

    /// Score images, returning logits `[N]`
    fn forward(&self, img: &Tensor, c: &Tensor) -> Result<Tensor>;
}

/// Check that `t` has exactly the expected dims
pub fn check_dims(what: &str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(Error::shape_mismatch(what, expected, t.dims()));
    }
    Ok(())
}

/// Copy every named tensor of `src` into the matching entry of `dst`
///
/// Entries missing on either side are returned by name. With `require_all`
/// any missing entry is an error.
pub fn copy_named(
    src: &[(String, Var)],
    dst: &[(String, Var)],
    require_all: bool,
) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for (name, var) in dst {
        match src.iter().find(|(n, _)| n == name) {
            Some((_, s)) => {
                if s.as_tensor().dims() != var.as_tensor().dims() {
                    return Err(Error::shape_mismatch(
                        name.clone(),
                        var.as_tensor().dims(),
                        s.as_tensor().dims(),
                    ));
                }
                var.set(&s.as_tensor().detach())?;
            }
            None => missing.push(name.clone()),
        }
    }
    if require_all && !missing.is_empty() {
        return Err(Error::checkpoint(format!("Missing tensors: {:?}", missing)));
    }
    Ok(missing)
}
