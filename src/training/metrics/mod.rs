//! Training statistics collection
//!
//! The loss engine reports named scalar series (`Loss/scores/real`,
//! `Loss/signs/real`, ...) to a [`StatsHub`]. Each registered
//! [`StatsCollector`] keeps running moments for the names it accepts until
//! its owner drains it: the adaptive augmentation controller drains its
//! window every `ada_interval` iterations, the tick reporter once per tick.

pub mod exporters;

pub use exporters::{JsonlStatsWriter, TickReport};

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{DType, Tensor};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Running count, sum and sum of squares of a scalar series
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    /// Number of observations
    pub count: f64,
    /// Sum of observations
    pub sum: f64,
    /// Sum of squared observations
    pub sum_sq: f64,
}

impl Moments {
    /// Add observations
    pub fn extend(&mut self, values: &[f64]) {
        for v in values {
            self.count += 1.0;
            self.sum += v;
            self.sum_sq += v * v;
        }
    }

    /// Merge another set of moments
    pub fn merge(&mut self, other: &Moments) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    /// Mean, or None without observations
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0.0).then(|| self.sum / self.count)
    }

    /// Population standard deviation
    pub fn std(&self) -> Option<f64> {
        let mean = self.mean()?;
        Some((self.sum_sq / self.count - mean * mean).max(0.0).sqrt())
    }

    /// Flatten to `[count, sum, sum_sq]` for collective reduction
    pub fn to_array(&self) -> [f64; 3] {
        [self.count, self.sum, self.sum_sq]
    }

    /// Rebuild from a reduced `[count, sum, sum_sq]`
    pub fn from_array(values: [f64; 3]) -> Self {
        Self {
            count: values[0],
            sum: values[1],
            sum_sq: values[2],
        }
    }
}

/// Summary of one series for reporting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    /// Number of observations
    pub num: f64,
    /// Mean value
    pub mean: f64,
    /// Standard deviation
    pub std: f64,
}

impl From<&Moments> for StatSummary {
    fn from(m: &Moments) -> Self {
        Self {
            num: m.count,
            mean: m.mean().unwrap_or(0.0),
            std: m.std().unwrap_or(0.0),
        }
    }
}

/// A window of moments for all series matching a name prefix
#[derive(Debug, Default)]
pub struct StatsCollector {
    prefix: Option<String>,
    window: Mutex<BTreeMap<String, Moments>>,
}

impl StatsCollector {
    /// Collect every series whose name starts with `prefix`; None collects all
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            window: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whether the named series is collected
    pub fn accepts(&self, name: &str) -> bool {
        self.prefix.as_deref().map_or(true, |p| name.starts_with(p))
    }

    /// Record observations if the name is accepted
    pub fn record(&self, name: &str, values: &[f64]) {
        if self.accepts(name) {
            self.window
                .lock()
                .entry(name.to_string())
                .or_default()
                .extend(values);
        }
    }

    /// Moments of one series in the current window
    pub fn get(&self, name: &str) -> Option<Moments> {
        self.window.lock().get(name).copied()
    }

    /// Take the current window and start a new one
    pub fn drain(&self) -> BTreeMap<String, Moments> {
        std::mem::take(&mut *self.window.lock())
    }
}

/// Fan-out point for reported statistics
#[derive(Debug, Default)]
pub struct StatsHub {
    collectors: RwLock<Vec<Arc<StatsCollector>>>,
}

impl StatsHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector
    pub fn register(&self, collector: Arc<StatsCollector>) {
        self.collectors.write().push(collector);
    }

    /// Create and register a collector for a prefix
    pub fn collector(&self, prefix: Option<&str>) -> Arc<StatsCollector> {
        let collector = Arc::new(StatsCollector::new(prefix));
        self.register(collector.clone());
        collector
    }

    /// Report scalar observations
    pub fn report_values(&self, name: &str, values: &[f64]) {
        for collector in self.collectors.read().iter() {
            collector.record(name, values);
        }
    }

    /// Report every element of a tensor
    pub fn report(&self, name: &str, values: &Tensor) -> Result<()> {
        let collectors = self.collectors.read();
        if !collectors.iter().any(|c| c.accepts(name)) {
            return Ok(());
        }
        let values: Vec<f64> = values
            .detach()
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1()?;
        for collector in collectors.iter() {
            collector.record(name, &values);
        }
        Ok(())
    }
}
