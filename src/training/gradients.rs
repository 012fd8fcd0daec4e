//! Per-phase gradient accumulation buffers
//!
//! A [`GradientBuffer`] owns the gradient slots of one module's parameters.
//! The loss engine backpropagates into a candle `GradStore`; the buffer
//! picks out its own parameters from that store and sums across
//! accumulation rounds. A disabled buffer ignores contributions, which is how
//! only the module owned by the active phase receives gradients.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};

use super::distributed::ProcessGroup;
use crate::error::Result;

/// Accumulated gradients for a fixed set of parameters
pub struct GradientBuffer {
    vars: Vec<(String, Var)>,
    grads: Vec<Option<Tensor>>,
    index: HashMap<TensorId, usize>,
    enabled: bool,
    synced: bool,
}

impl GradientBuffer {
    /// Create a disabled, empty buffer for the given parameters
    pub fn new(vars: Vec<(String, Var)>) -> Self {
        let index = vars
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (v.as_tensor().id(), i))
            .collect();
        let grads = vec![None; vars.len()];
        Self {
            vars,
            grads,
            index,
            enabled: false,
            synced: false,
        }
    }

    /// Parameters covered by this buffer
    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.vars.iter().map(|(_, v)| v)
    }

    /// Named parameters covered by this buffer
    pub fn named_vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    /// Drop all accumulated gradients
    pub fn zero(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = None);
        self.synced = false;
    }

    /// Start accepting contributions
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stop accepting contributions
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Whether a contribution was made with the sync flag set
    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Whether no gradient has been accumulated
    pub fn is_empty(&self) -> bool {
        self.grads.iter().all(Option::is_none)
    }

    /// Add the gradients of this buffer's parameters found in `store`
    ///
    /// Returns the number of parameters that received a contribution. A
    /// disabled buffer accepts nothing and returns 0.
    pub fn accumulate(&mut self, store: &GradStore, sync: bool) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let mut touched = 0;
        for (i, (_, var)) in self.vars.iter().enumerate() {
            if let Some(g) = store.get(var.as_tensor()) {
                let g = g.detach();
                self.grads[i] = Some(match self.grads[i].take() {
                    Some(acc) => acc.add(&g)?,
                    None => g,
                });
                touched += 1;
            }
        }
        self.synced |= sync;
        Ok(touched)
    }

    /// Accumulated gradient of a parameter
    pub fn grad(&self, var: &Var) -> Option<&Tensor> {
        self.index
            .get(&var.as_tensor().id())
            .and_then(|&i| self.grads[i].as_ref())
    }

    /// Accumulated gradient by parameter name
    pub fn grad_by_name(&self, name: &str) -> Option<&Tensor> {
        self.vars
            .iter()
            .position(|(n, _)| n == name)
            .and_then(|i| self.grads[i].as_ref())
    }

    /// Parameters paired with their accumulated gradients
    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Tensor)> {
        self.vars
            .iter()
            .zip(&self.grads)
            .filter_map(|((_, v), g)| g.as_ref().map(|g| (v, g)))
    }

    /// Average gradients across the group
    ///
    /// Every rank must call this with the same parameter set. Missing
    /// gradients contribute zeros so that buffer layouts agree.
    pub fn all_reduce(&mut self, group: &dyn ProcessGroup) -> Result<()> {
        if group.world_size() == 1 {
            return Ok(());
        }
        let mut tensors = self
            .vars
            .iter()
            .zip(&self.grads)
            .map(|((_, v), g)| match g {
                Some(g) => Ok(g.clone()),
                None => Ok(v.as_tensor().zeros_like()?),
            })
            .collect::<Result<Vec<_>>>()?;
        group.all_reduce_mean(&mut tensors)?;
        self.grads = tensors.into_iter().map(Some).collect();
        Ok(())
    }

    /// Global L2 norm of the accumulated gradients
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0.0f64;
        for (_, g) in self.iter() {
            total += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
        Ok(total.sqrt())
    }

    /// Rescale gradients so their global L2 norm is at most `max_norm`
    ///
    /// Returns the norm before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.global_norm()?;
        if norm > max_norm {
            let scale = max_norm / norm.max(1e-12);
            for g in self.grads.iter_mut().flatten() {
                *g = g.affine(scale, 0.0)?;
            }
        }
        Ok(norm)
    }
}
