//! Progress counters threaded through the training loop

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metrics::TickReport;

/// Progress of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Real images shown so far, summed over replicas
    pub cur_nimg: u64,

    /// Completed ticks
    pub cur_tick: u64,

    /// Completed iterations
    pub batch_idx: u64,

    /// `cur_nimg` at the start of the current tick
    pub tick_start_nimg: u64,

    /// Mean generator loss of the latest generator phase
    pub last_loss_g: Option<f64>,

    /// Mean real-image discriminator loss of the latest discriminator phase
    pub last_loss_d: Option<f64>,

    /// Augmentation probability after the latest iteration
    pub augment_p: f64,

    /// Training start time
    pub start_time: DateTime<Utc>,

    /// Training status
    pub status: TrainingStatus,
}

/// Training status enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrainingStatus {
    /// Not started yet
    NotStarted,
    /// Iterating
    Running,
    /// Image budget exhausted
    Completed,
    /// Stopped by the abort predicate
    Aborted,
}

impl TrainingState {
    /// Fresh counters with the given initial augmentation probability
    pub fn new(augment_p: f64) -> Self {
        Self {
            cur_nimg: 0,
            cur_tick: 0,
            batch_idx: 0,
            tick_start_nimg: 0,
            last_loss_g: None,
            last_loss_d: None,
            augment_p,
            start_time: Utc::now(),
            status: TrainingStatus::NotStarted,
        }
    }

    /// Images shown so far, in thousands
    pub fn kimg(&self) -> f64 {
        self.cur_nimg as f64 / 1000.0
    }

    /// Whether the image budget is exhausted
    pub fn budget_exhausted(&self, total_nimg: u64) -> bool {
        self.cur_nimg >= total_nimg
    }

    /// Whether the current tick is over
    ///
    /// Tick 0 ends after the first iteration.
    pub fn tick_complete(&self, kimg_per_tick: f64) -> bool {
        self.cur_tick == 0
            || self.cur_nimg as f64 >= self.tick_start_nimg as f64 + kimg_per_tick * 1000.0
    }

    /// Close the current tick and open the next window at `cur_nimg`
    pub fn advance_tick(&mut self) {
        self.cur_tick += 1;
        self.tick_start_nimg = self.cur_nimg;
    }

    /// Whether training has stopped
    pub fn is_finished(&self) -> bool {
        matches!(self.status, TrainingStatus::Completed | TrainingStatus::Aborted)
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Outcome of a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Training state at completion
    pub final_state: TrainingState,

    /// Snapshots written during the run
    pub snapshots: Vec<PathBuf>,

    /// Report of the last tick
    pub last_report: Option<TickReport>,

    /// Wall-clock duration in seconds
    pub training_duration_secs: f64,
}

impl TrainingResult {
    /// Whether the run ended by exhausting its budget
    pub fn completed(&self) -> bool {
        self.final_state.status == TrainingStatus::Completed
    }
}
