//! Optimizers stepping from phase gradient buffers
//!
//! Optimizers keep their own per-parameter state keyed by tensor id, so a
//! main phase and a regularization phase of the same module can share one
//! optimizer instance.

use std::collections::HashMap;

use candle_core::{Tensor, TensorId};

use super::config::{OptimizerConfig, OptimizerType};
use super::gradients::GradientBuffer;
use crate::error::Result;

/// Optimizer interface used by training phases
pub trait PhaseOptimizer: Send {
    /// Get optimizer name
    fn name(&self) -> &str;

    /// Apply one update from the accumulated gradients
    fn step(&mut self, grads: &GradientBuffer) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of steps taken
    fn step_count(&self) -> u64;
}

/// Adam with bias correction
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step_count: u64,
    moments: HashMap<TensorId, (Tensor, Tensor, i32)>,
}

impl Adam {
    /// Create an Adam optimizer
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step_count: 0,
            moments: HashMap::new(),
        }
    }

    /// Betas in use
    pub fn betas(&self) -> (f64, f64) {
        (self.beta1, self.beta2)
    }
}

impl PhaseOptimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, grads: &GradientBuffer) -> Result<()> {
        if grads.is_empty() {
            return Ok(());
        }
        self.step_count += 1;

        for (var, g) in grads.iter() {
            let id = var.as_tensor().id();
            let (m, v, t) = match self.moments.remove(&id) {
                Some((m, v, t)) => (
                    m.affine(self.beta1, 0.0)?.add(&g.affine(1.0 - self.beta1, 0.0)?)?,
                    v.affine(self.beta2, 0.0)?.add(&g.sqr()?.affine(1.0 - self.beta2, 0.0)?)?,
                    t + 1,
                ),
                None => (
                    g.affine(1.0 - self.beta1, 0.0)?,
                    g.sqr()?.affine(1.0 - self.beta2, 0.0)?,
                    1,
                ),
            };

            // Bias correction follows the steps this parameter has seen
            let bias1 = 1.0 - self.beta1.powi(t);
            let bias2 = 1.0 - self.beta2.powi(t);
            let denom = v.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, self.epsilon)?;
            let update = m.affine(self.learning_rate / bias1, 0.0)?.div(&denom)?;
            var.set(&var.as_tensor().sub(&update)?)?;
            self.moments.insert(id, (m, v, t));
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> u64 {
        self.step_count
    }
}

/// Stochastic gradient descent with optional momentum
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    step_count: u64,
    velocity: HashMap<TensorId, Tensor>,
}

impl Sgd {
    /// Create an SGD optimizer
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            step_count: 0,
            velocity: HashMap::new(),
        }
    }
}

impl PhaseOptimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn step(&mut self, grads: &GradientBuffer) -> Result<()> {
        if grads.is_empty() {
            return Ok(());
        }
        self.step_count += 1;
        for (var, g) in grads.iter() {
            let direction = if self.momentum > 0.0 {
                let id = var.as_tensor().id();
                let buf = match self.velocity.remove(&id) {
                    Some(buf) => buf.affine(self.momentum, 0.0)?.add(g)?,
                    None => g.clone(),
                };
                self.velocity.insert(id, buf.clone());
                buf
            } else {
                g.clone()
            };
            var.set(&var.as_tensor().sub(&direction.affine(self.learning_rate, 0.0)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> u64 {
        self.step_count
    }
}

/// Factory function to create optimizers
pub fn create_optimizer(config: &OptimizerConfig) -> Box<dyn PhaseOptimizer> {
    match config.optimizer_type {
        OptimizerType::Adam => Box::new(Adam::new(
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
        )),
        OptimizerType::Sgd { momentum } => Box::new(Sgd::new(config.learning_rate, momentum)),
    }
}
