//! Scalar summaries written to the run folder.
//!
//! Every scalar goes to `scalars.jsonl` as soon as it is recorded; on close
//! the same values are pivoted into `metrics.csv`, one row per step.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use finetune_core::{Error, Phase, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const SCALARS_FILE: &str = "scalars.jsonl";
pub const METRICS_FILE: &str = "metrics.csv";

/// Tag of the epoch-average loss, e.g. `loss/train`
pub fn loss_tag(phase: Phase) -> String {
    format!("loss/{phase}")
}

/// Tag of the epoch-average top-k accuracy, e.g. `acc/test_top5`
pub fn acc_tag(phase: Phase, k: usize) -> String {
    format!("acc/{phase}_top{k}")
}

/// One recorded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    pub wall_time: f64,
}

/// Destination for per-epoch scalars
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
}

pub struct SummaryWriter {
    log_dir: PathBuf,
    events: BufWriter<File>,
    history: BTreeMap<usize, BTreeMap<String, f64>>,
}

impl SummaryWriter {
    pub fn new(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file = File::create(log_dir.join(SCALARS_FILE))?;
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            events: BufWriter::new(file),
            history: BTreeMap::new(),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Flushes the event log and writes `metrics.csv`.
    pub fn close(mut self) -> Result<PathBuf> {
        self.events.flush()?;

        let tags: BTreeSet<&String> = self.history.values().flat_map(|row| row.keys()).collect();
        let mut csv = String::from("epoch");
        for tag in &tags {
            csv.push(',');
            csv.push_str(tag);
        }
        csv.push('\n');

        for (step, row) in &self.history {
            csv.push_str(&step.to_string());
            for tag in &tags {
                csv.push(',');
                if let Some(value) = row.get(*tag) {
                    csv.push_str(&format!("{value:.6}"));
                }
            }
            csv.push('\n');
        }

        let csv_path = self.log_dir.join(METRICS_FILE);
        fs::write(&csv_path, csv)?;
        info!("Metrics saved to: {}", csv_path.display());
        Ok(csv_path)
    }
}

impl ScalarSink for SummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time: Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(self.events, "{line}")
            .map_err(|e| Error::Serialization(format!("Failed to write scalar {tag}: {e}")))?;

        self.history.entry(step).or_default().insert(event.tag, value);
        Ok(())
    }
}

/// Keeps scalars in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<(String, f64, usize)>,
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.events.push((tag.to_string(), value, step));
        Ok(())
    }
}
