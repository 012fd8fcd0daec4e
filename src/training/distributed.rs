//! Process groups and device fences for data-parallel training
//!
//! Every replica runs the identical training loop and calls each collective
//! in the same order. [`SingleProcess`] is the identity group;
//! [`LocalProcessGroup`] runs one replica per thread and reduces through a
//! shared accumulator guarded by a barrier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Collective communication between replicas
pub trait ProcessGroup: Send + Sync {
    /// Rank of this replica
    fn rank(&self) -> usize;

    /// Number of replicas
    fn world_size(&self) -> usize;

    /// Whether this replica performs logging, snapshots and synced steps
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sum of `values` across replicas, in place
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    /// Logical OR of a flag across replicas
    fn all_reduce_or(&self, flag: bool) -> Result<bool> {
        let mut v = [if flag { 1.0 } else { 0.0 }];
        self.all_reduce_sum(&mut v)?;
        Ok(v[0] > 0.0)
    }

    /// Average tensors across replicas, in place
    fn all_reduce_mean(&self, tensors: &mut [Tensor]) -> Result<()> {
        let world = self.world_size();
        if world == 1 {
            return Ok(());
        }

        let mut flat = Vec::new();
        for t in tensors.iter() {
            flat.extend(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?);
        }
        self.all_reduce_sum(&mut flat)?;

        let scale = 1.0 / world as f64;
        let mut offset = 0;
        for t in tensors.iter_mut() {
            let n = t.elem_count();
            let values: Vec<f64> = flat[offset..offset + n].iter().map(|v| v * scale).collect();
            *t = Tensor::from_vec(values, t.shape(), t.device())?.to_dtype(t.dtype())?;
            offset += n;
        }
        Ok(())
    }
}

/// The trivial group of one
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

struct Shared {
    world_size: usize,
    barrier: Barrier,
    accumulator: Mutex<Vec<f64>>,
    mismatch: AtomicBool,
}

/// In-process group with one replica per thread
#[derive(Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalProcessGroup {
    /// Create handles for all ranks of a new group
    pub fn create(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Error::config("world_size must be greater than 0"));
        }
        let shared = Arc::new(Shared {
            world_size,
            barrier: Barrier::new(world_size),
            accumulator: Mutex::new(Vec::new()),
            mismatch: AtomicBool::new(false),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect())
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        let shared = &self.shared;
        if shared.world_size == 1 {
            return Ok(());
        }

        // Previous readers are done once everyone arrives here
        if shared.barrier.wait().is_leader() {
            let mut acc = shared.accumulator.lock();
            acc.clear();
            acc.resize(values.len(), 0.0);
            shared.mismatch.store(false, Ordering::SeqCst);
        }
        shared.barrier.wait();

        {
            let mut acc = shared.accumulator.lock();
            if acc.len() != values.len() {
                shared.mismatch.store(true, Ordering::SeqCst);
            } else {
                for (a, v) in acc.iter_mut().zip(values.iter()) {
                    *a += v;
                }
            }
        }
        shared.barrier.wait();

        if shared.mismatch.load(Ordering::SeqCst) {
            return Err(Error::distributed(format!(
                "rank {} contributed a buffer of mismatched length {}",
                self.rank,
                values.len()
            )));
        }
        values.copy_from_slice(&shared.accumulator.lock());
        Ok(())
    }
}

/// Explicit completion point for asynchronously queued device work
#[derive(Debug)]
pub struct DeviceFence {
    device: Device,
    pending: usize,
}

impl DeviceFence {
    /// Create a fence for a device
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            pending: 0,
        }
    }

    /// Count one unit of queued work
    pub fn enqueue(&mut self) {
        self.pending += 1;
    }

    /// Units of work queued since the last flush
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Block until queued work has completed
    pub fn flush(&mut self) -> Result<()> {
        if self.pending > 0 {
            self.device.synchronize()?;
            debug!(units = self.pending, "Device fence flushed");
            self.pending = 0;
        }
        Ok(())
    }
}
