//! Exponential moving average of generator weights

use candle_core::Var;

use crate::error::{Error, Result};
use crate::networks::Generator;

/// Decay for one iteration: `0.5^(batch_size / max(ema_nimg, 1e-8))`
///
/// `ema_nimg = ema_kimg * 1000`, capped at `cur_nimg * ema_rampup` when a
/// ramp-up is configured.
pub fn ema_beta(batch_size: usize, ema_kimg: f64, ema_rampup: Option<f64>, cur_nimg: u64) -> f64 {
    let mut ema_nimg = ema_kimg * 1000.0;
    if let Some(rampup) = ema_rampup {
        ema_nimg = ema_nimg.min(cur_nimg as f64 * rampup);
    }
    0.5f64.powf(batch_size as f64 / ema_nimg.max(1e-8))
}

/// Pairs of live and shadow tensors tracked by name
pub struct EmaTracker {
    pairs: Vec<(String, Var, Var)>,
}

impl EmaTracker {
    /// Track every parameter and buffer of `live` in `shadow`
    pub fn new(live: &dyn Generator, shadow: &dyn Generator) -> Result<Self> {
        let shadow_vars: Vec<(String, Var)> = shadow
            .named_parameters()
            .into_iter()
            .chain(shadow.named_buffers())
            .collect();

        let pairs = live
            .named_parameters()
            .into_iter()
            .chain(live.named_buffers())
            .map(|(name, var)| {
                let (_, s) = shadow_vars
                    .iter()
                    .find(|(n, _)| *n == name)
                    .ok_or_else(|| Error::internal(format!("EMA copy is missing {name}")))?;
                Ok((name, var, s.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { pairs })
    }

    /// Number of tracked tensors
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// `shadow = shadow * beta + live * (1 - beta)` for every tracked tensor
    pub fn update(&self, beta: f64) -> Result<()> {
        if beta >= 1.0 {
            return Ok(());
        }
        for (_, live, shadow) in &self.pairs {
            let blended = if beta <= 0.0 {
                live.as_tensor().detach()
            } else {
                shadow
                    .as_tensor()
                    .affine(beta, 0.0)?
                    .add(&live.as_tensor().detach().affine(1.0 - beta, 0.0)?)?
            };
            shadow.set(&blended)?;
        }
        Ok(())
    }
}
