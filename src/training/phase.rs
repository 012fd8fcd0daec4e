//! Training phases and their schedule
//!
//! A phase pairs a [`PhaseKind`] with the optimizer and gradient buffer of
//! the module it updates. Generator phases come first, then discriminator
//! phases. With lazy regularization each module gets a main phase every
//! iteration and a regularization phase every `interval` iterations, both
//! sharing one optimizer whose hyperparameters are scaled by
//! `interval / (interval + 1)`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::Var;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::config::{OptimizerConfig, TrainingConfig};
use super::gradients::GradientBuffer;
use super::optimizers::{create_optimizer, PhaseOptimizer};
use crate::error::{Error, Result};

/// Module updated by a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleRole {
    /// The generator
    Generator,
    /// The discriminator
    Discriminator,
}

/// Identity of a training phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseKind {
    /// Generator adversarial loss
    Gmain,
    /// Generator path length regularization
    Greg,
    /// Both generator terms
    Gboth,
    /// Discriminator adversarial loss
    Dmain,
    /// Discriminator R1 regularization
    Dreg,
    /// Both discriminator terms
    Dboth,
}

impl PhaseKind {
    /// All phase kinds
    pub const ALL: [PhaseKind; 6] = [
        Self::Gmain,
        Self::Greg,
        Self::Gboth,
        Self::Dmain,
        Self::Dreg,
        Self::Dboth,
    ];

    /// Module this phase updates
    pub fn role(self) -> ModuleRole {
        match self {
            Self::Gmain | Self::Greg | Self::Gboth => ModuleRole::Generator,
            Self::Dmain | Self::Dreg | Self::Dboth => ModuleRole::Discriminator,
        }
    }

    /// Whether the adversarial term runs
    pub fn runs_main(self) -> bool {
        matches!(self, Self::Gmain | Self::Gboth | Self::Dmain | Self::Dboth)
    }

    /// Whether the regularization term runs
    pub fn runs_reg(self) -> bool {
        matches!(self, Self::Greg | Self::Gboth | Self::Dreg | Self::Dboth)
    }

    /// Canonical name
    pub fn name(self) -> &'static str {
        match self {
            Self::Gmain => "Gmain",
            Self::Greg => "Greg",
            Self::Gboth => "Gboth",
            Self::Dmain => "Dmain",
            Self::Dreg => "Dreg",
            Self::Dboth => "Dboth",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PhaseKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| Error::InvalidPhase(s.to_string()))
    }
}

/// Optimizer shared between the phases of one module
pub type SharedOptimizer = Arc<Mutex<Box<dyn PhaseOptimizer>>>;

/// One optimization phase of the schedule
pub struct TrainingPhase {
    kind: PhaseKind,
    interval: u64,
    optimizer: SharedOptimizer,
    buffer: GradientBuffer,
}

impl TrainingPhase {
    /// Create a phase
    pub fn new(
        kind: PhaseKind,
        interval: u64,
        optimizer: SharedOptimizer,
        params: Vec<(String, Var)>,
    ) -> Self {
        Self {
            kind,
            interval: interval.max(1),
            optimizer,
            buffer: GradientBuffer::new(params),
        }
    }

    /// Phase identity
    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    /// Phase name
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Accumulation interval, also used as the loss gain
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Whether the phase runs at iteration `batch_idx`
    pub fn is_due(&self, batch_idx: u64) -> bool {
        batch_idx % self.interval == 0
    }

    /// Shared optimizer handle
    pub fn optimizer(&self) -> &SharedOptimizer {
        &self.optimizer
    }

    /// Gradient buffer of the updated module
    pub fn buffer(&self) -> &GradientBuffer {
        &self.buffer
    }

    /// Mutable gradient buffer
    pub fn buffer_mut(&mut self) -> &mut GradientBuffer {
        &mut self.buffer
    }

    /// Step the shared optimizer from this phase's buffer
    pub fn step(&mut self) -> Result<()> {
        self.optimizer.lock().step(&self.buffer)
    }
}

impl fmt::Debug for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingPhase")
            .field("kind", &self.kind)
            .field("interval", &self.interval)
            .finish()
    }
}

fn module_phases(
    main: PhaseKind,
    reg: PhaseKind,
    both: PhaseKind,
    opt_config: &OptimizerConfig,
    reg_interval: Option<u64>,
    params: &[(String, Var)],
) -> Vec<TrainingPhase> {
    match reg_interval {
        None => {
            let opt = Arc::new(Mutex::new(create_optimizer(opt_config)));
            vec![TrainingPhase::new(both, 1, opt, params.to_vec())]
        }
        Some(interval) => {
            let scaled = opt_config.lazy_regularized(interval);
            let opt = Arc::new(Mutex::new(create_optimizer(&scaled)));
            vec![
                TrainingPhase::new(main, 1, opt.clone(), params.to_vec()),
                TrainingPhase::new(reg, interval, opt, params.to_vec()),
            ]
        }
    }
}

/// Build the ordered phase list: generator phases, then discriminator phases
pub fn build_phases(
    config: &TrainingConfig,
    g_params: &[(String, Var)],
    d_params: &[(String, Var)],
) -> Vec<TrainingPhase> {
    let mut phases = module_phases(
        PhaseKind::Gmain,
        PhaseKind::Greg,
        PhaseKind::Gboth,
        &config.g_optimizer,
        config.regularization.g_reg_interval,
        g_params,
    );
    phases.extend(module_phases(
        PhaseKind::Dmain,
        PhaseKind::Dreg,
        PhaseKind::Dboth,
        &config.d_optimizer,
        config.regularization.d_reg_interval,
        d_params,
    ));
    phases
}
