//! Adaptive augmentation strength control
//!
//! Every `ada_interval` iterations the mean sign of the real logits observed
//! since the previous adjustment is compared with the target. The pipe
//! probability moves one step toward reducing the discrepancy and never
//! drops below zero.

use std::sync::Arc;

use tracing::debug;

use super::config::AugmentConfig;
use super::distributed::ProcessGroup;
use super::metrics::{Moments, StatsCollector, StatsHub};
use crate::augment::AugmentPipe;
use crate::error::Result;
use crate::utils::math::sign;

/// Statistic steering the controller
pub const ADA_STAT: &str = "Loss/signs/real";

/// One adjustment: `max(p + sign(stat - target) * step, 0)`
pub fn adjust_probability(p: f64, stat: f64, target: f64, step: f64) -> f64 {
    (p + sign(stat - target) * step).max(0.0)
}

/// Controller owning the augmentation probability schedule
pub struct AdaController {
    pipe: Arc<dyn AugmentPipe>,
    target: Option<f64>,
    interval: u64,
    step: f64,
    window: Arc<StatsCollector>,
}

impl AdaController {
    /// Create a controller for `pipe`, registering its statistics window on `stats`
    pub fn new(
        pipe: Arc<dyn AugmentPipe>,
        config: &AugmentConfig,
        batch_size: usize,
        stats: &StatsHub,
    ) -> Self {
        let step = (batch_size as f64 * config.ada_interval as f64) / (config.ada_kimg * 1000.0);
        Self {
            pipe,
            target: config.ada_target,
            interval: config.ada_interval.max(1),
            step,
            window: stats.collector(Some(ADA_STAT)),
        }
    }

    /// Whether `p` is adjusted at all
    pub fn is_active(&self) -> bool {
        self.target.is_some()
    }

    /// Size of one adjustment
    pub fn adjustment_step(&self) -> f64 {
        self.step
    }

    /// Whether an adjustment is due after `batch_idx` completed iterations
    pub fn is_due(&self, batch_idx: u64) -> bool {
        self.is_active() && batch_idx % self.interval == 0
    }

    /// Current augmentation probability
    pub fn probability(&self) -> f64 {
        self.pipe.probability()
    }

    /// Run one adjustment from the window collected since the last call
    ///
    /// All ranks must call this together. Returns the applied adjustment, or
    /// None when inactive or when nothing was observed.
    pub fn update(&self, group: &dyn ProcessGroup) -> Result<Option<f64>> {
        let Some(target) = self.target else {
            return Ok(None);
        };

        let local = self.window.drain().remove(ADA_STAT).unwrap_or_default();
        let mut reduced = local.to_array();
        group.all_reduce_sum(&mut reduced)?;
        let Some(stat) = Moments::from_array(reduced).mean() else {
            return Ok(None);
        };

        let p = self.pipe.probability();
        let updated = adjust_probability(p, stat, target, self.step);
        self.pipe.set_probability(updated);
        debug!(stat, target, p = updated, "Adjusted augmentation probability");
        Ok(Some(updated - p))
    }
}
