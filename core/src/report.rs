//! Report sinks: the in-progress and final view of a scan.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use crate::checkpoint::RecordTable;
use crate::orchestrator::ChannelState;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialise report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Table-of-contents entry of one block.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlockEntry {
    pub key: String,
    pub title: String,
    /// Section the block is displayed under (its parent, or itself).
    pub section: String,
    pub channels: Vec<String>,
}

/// Current state of one channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub block: String,
    pub state: ChannelState,
}

/// Read-only view of a scan handed to a [`ReportSink`].
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ReportSnapshot<'a> {
    pub gps: f64,
    pub blocks: &'a [BlockEntry],
    pub table: &'a RecordTable,
    pub channels: &'a [ChannelStatus],
    /// Set on the final snapshot only.
    pub complete: bool,
}

/// Receives the scan state after every channel and once at the end.
pub trait ReportSink {
    fn update(&mut self, snapshot: &ReportSnapshot<'_>) -> Result<(), ReportError>;

    fn finalize(&mut self, snapshot: &ReportSnapshot<'_>) -> Result<(), ReportError>;
}

/// Writes every snapshot to a pretty-printed JSON file.
#[derive(Clone, Debug)]
pub struct JsonReport {
    path: PathBuf,
    updates: usize,
}

impl JsonReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            updates: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, snapshot: &ReportSnapshot<'_>) -> Result<(), ReportError> {
        let text = serde_json::to_string_pretty(snapshot)?;
        let io_err = |source| ReportError::Io {
            path: self.path.clone(),
            source,
        };
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl ReportSink for JsonReport {
    fn update(&mut self, snapshot: &ReportSnapshot<'_>) -> Result<(), ReportError> {
        self.updates += 1;
        debug!("report update {} ({} records)", self.updates, snapshot.table.len());
        self.write(snapshot)
    }

    fn finalize(&mut self, snapshot: &ReportSnapshot<'_>) -> Result<(), ReportError> {
        self.write(snapshot)?;
        info!(
            "Wrote report with {} record(s) to {}",
            snapshot.table.len(),
            self.path.display()
        );
        Ok(())
    }
}
