//! Tick report export

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Moments, StatSummary};
use crate::error::Result;

/// One progress report, emitted per tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    /// Wall-clock time of the report
    pub timestamp: DateTime<Utc>,

    /// Tick index
    pub tick: u64,

    /// Images shown so far, in thousands
    pub kimg: f64,

    /// Seconds spent in this tick
    pub sec_per_tick: f64,

    /// Seconds per thousand images during this tick
    pub sec_per_kimg: f64,

    /// Augmentation probability at the end of the tick
    pub augment_p: f64,

    /// Per-series summaries collected during the tick
    pub stats: BTreeMap<String, StatSummary>,
}

impl TickReport {
    /// Mean of a series, if it was reported during the tick
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.stats.get(name).map(|s| s.mean)
    }

    /// Summarize drained moments
    pub fn summarize(window: &BTreeMap<String, Moments>) -> BTreeMap<String, StatSummary> {
        window
            .iter()
            .map(|(name, m)| (name.clone(), StatSummary::from(m)))
            .collect()
    }
}

/// Appends tick reports to `stats.jsonl`
pub struct JsonlStatsWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlStatsWriter {
    /// File name inside the run directory
    pub const FILE_NAME: &'static str = "stats.jsonl";

    /// Open (append) the stats file in `run_dir`
    pub fn create(run_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(run_dir)?;
        let path = run_dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the stats file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one report as a JSON line
    pub fn write(&mut self, report: &TickReport) -> Result<()> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Read all reports back from a stats file
pub fn read_reports(path: &Path) -> Result<Vec<TickReport>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| Ok(serde_json::from_str(l)?))
        .collect()
}
