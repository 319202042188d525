//! JSONL metrics sink.
//!
//! Each [`MetricsRecord`] is serialized to one line and appended to the
//! file named by `[metrics].path`. The file is opened once in append mode
//! and never read back by the engine.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use hts_harness_core::metrics::{MemorySink, MetricsRecord, MetricsSink, NullSink};

use crate::config::MetricsConfig;

/// Sink for `[metrics]`: JSONL when a path is set, otherwise nothing.
pub fn create_sink(config: &MetricsConfig) -> Result<Arc<dyn MetricsSink>> {
    match &config.path {
        Some(path) => Ok(Arc::new(JsonlSink::open(path)?)),
        None => Ok(Arc::new(NullSink)),
    }
}

pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics log: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn record(&self, record: &MetricsRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One write per record keeps lines whole under concurrent queries.
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }
}
