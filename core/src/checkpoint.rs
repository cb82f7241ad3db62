//! Checkpoint/resume of per-channel loudest-tile records.
//!
//! After every channel the orchestrator rewrites the full record table as
//! CSV.  A restarted run loads it and restores each listed channel without
//! touching its data, so a batch of thousands of channels survives being
//! interrupted at any point.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::types::{CorrelationFeatures, LoudestTileRecord};

/// Columns written for every record.
pub const BASE_COLUMNS: [&str; 6] = [
    "Channel",
    "Central Time",
    "Central Frequency (Hz)",
    "Q",
    "Energy",
    "SNR",
];

/// Extra columns written when the run is cross-correlated.
pub const CORRELATION_COLUMNS: [&str; 3] = ["Correlation", "Standard Deviation", "Delay (ms)"];

/// Errors raised while loading or saving the checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(
        "checkpoint {} lacks column '{column}'; it was written without cross-correlation, \
         rerun with --disable-checkpoint or --disable-correlation",
        .path.display()
    )]
    SchemaMismatch { path: PathBuf, column: String },

    #[error("checkpoint row {row}: cannot parse {column} = '{value}'")]
    InvalidRow { row: usize, column: String, value: String },
}

// ---------------------------------------------------------------------------
// RecordTable
// ---------------------------------------------------------------------------

/// Ordered, keyed collection of loudest-tile records.
///
/// Inserting a record for a channel already present replaces that row in
/// place; rows are never removed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<LoudestTileRecord>", into = "Vec<LoudestTileRecord>")]
pub struct RecordTable {
    records: Vec<LoudestTileRecord>,
    index: HashMap<String, usize>,
}

impl From<Vec<LoudestTileRecord>> for RecordTable {
    fn from(records: Vec<LoudestTileRecord>) -> Self {
        let mut table = Self::default();
        for record in records {
            table.insert(record);
        }
        table
    }
}

impl From<RecordTable> for Vec<LoudestTileRecord> {
    fn from(table: RecordTable) -> Self {
        table.records
    }
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: LoudestTileRecord) {
        match self.index.get(&record.channel) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.channel.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn get(&self, channel: &str) -> Option<&LoudestTileRecord> {
        self.index.get(channel).map(|&i| &self.records[i])
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.index.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoudestTileRecord> {
        self.records.iter()
    }

    /// Channel names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.records.iter().map(|r| r.channel.clone()).collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.records)
    }
}

// ---------------------------------------------------------------------------
// ScanCheckpoint
// ---------------------------------------------------------------------------

/// CSV checkpoint file of a scan.
#[derive(Clone, Debug)]
pub struct ScanCheckpoint {
    path: PathBuf,
    correlated: bool,
}

impl ScanCheckpoint {
    pub fn new(path: impl Into<PathBuf>, correlated: bool) -> Self {
        Self {
            path: path.into(),
            correlated,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_correlated(&self) -> bool {
        self.correlated
    }

    fn columns(&self) -> Vec<&'static str> {
        let mut columns = BASE_COLUMNS.to_vec();
        if self.correlated {
            columns.extend(CORRELATION_COLUMNS);
        }
        columns
    }

    /// Load the table and the names of completed channels.
    ///
    /// A missing file is an empty table.  A correlated run refuses a file
    /// without the correlation columns.
    pub fn load(&self) -> Result<(RecordTable, Vec<String>), CheckpointError> {
        if !self.path.exists() {
            return Ok((RecordTable::new(), Vec::new()));
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?.clone();

        let mut positions = HashMap::new();
        for column in self.columns() {
            let pos = headers
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| CheckpointError::SchemaMismatch {
                    path: self.path.clone(),
                    column: column.to_string(),
                })?;
            positions.insert(column, pos);
        }

        let mut table = RecordTable::new();
        for (row, result) in reader.records().enumerate() {
            let record = result?;
            let field = |column: &str| record.get(positions[column]).unwrap_or("").trim();
            let number = |column: &str| -> Result<f64, CheckpointError> {
                field(column).parse().map_err(|_| CheckpointError::InvalidRow {
                    row,
                    column: column.to_string(),
                    value: field(column).to_string(),
                })
            };

            let mut tile = LoudestTileRecord {
                channel: field("Channel").to_string(),
                central_time: number("Central Time")?,
                central_frequency: number("Central Frequency (Hz)")?,
                q: number("Q")?,
                energy: number("Energy")?,
                snr: number("SNR")?,
                correlation: None,
            };
            if self.correlated && !field("Correlation").is_empty() {
                let delay = number("Delay (ms)")?;
                tile.correlation = Some(CorrelationFeatures {
                    peak: number("Correlation")?,
                    stdev: number("Standard Deviation")?,
                    delay_ms: delay as i64,
                });
            }
            table.insert(tile);
        }

        let completed = table.names();
        info!("Restored {} channel(s) from checkpoint {}", completed.len(), self.path.display());
        Ok((table, completed))
    }

    /// Rehydrate the record of a completed channel.
    pub fn restore(&self, name: &str, table: &RecordTable) -> Option<LoudestTileRecord> {
        table.get(name).cloned()
    }

    /// Serialise `table` to CSV bytes.
    pub fn to_csv(&self, table: &RecordTable) -> Result<Vec<u8>, CheckpointError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.columns())?;
        for record in table.iter() {
            let mut row = vec![
                record.channel.clone(),
                record.central_time.to_string(),
                record.central_frequency.to_string(),
                record.q.to_string(),
                record.energy.to_string(),
                record.snr.to_string(),
            ];
            if self.correlated {
                match &record.correlation {
                    Some(c) => row.extend([c.peak.to_string(), c.stdev.to_string(), c.delay_ms.to_string()]),
                    None => row.extend([String::new(), String::new(), String::new()]),
                }
            }
            writer.write_record(&row)?;
        }
        writer
            .into_inner()
            .map_err(|e| CheckpointError::Io {
                path: self.path.clone(),
                source: e.into_error(),
            })
    }

    /// Atomically replace the checkpoint with `table`.
    pub fn save(&self, table: &RecordTable) -> Result<(), CheckpointError> {
        let bytes = self.to_csv(table)?;
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, energy: f64) -> LoudestTileRecord {
        LoudestTileRecord::rounded(name, 1187008882.4303, 123.45, 5.66, energy, (2.0 * energy).sqrt())
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut table = RecordTable::new();
        table.insert(record("X1:A", 10.0));
        table.insert(record("X1:B", 20.0));
        table.insert(record("X1:A", 30.0));
        assert_eq!(table.len(), 2);
        assert_eq!(table.names(), vec!["X1:A", "X1:B"]);
        assert_eq!(table.get("X1:A").unwrap().energy, 30.0);
    }

    #[test]
    fn test_round_trip_with_correlation() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = ScanCheckpoint::new(dir.path().join("data").join("summary.csv"), true);

        let mut table = RecordTable::new();
        table.insert(record("X1:A", 12.3).with_correlation(CorrelationFeatures {
            peak: 4.2,
            stdev: 0.123_456_789,
            delay_ms: -12,
        }));
        table.insert(record("X1:B", 99.0));
        checkpoint.save(&table).unwrap();

        let (loaded, completed) = checkpoint.load().unwrap();
        assert_eq!(completed, vec!["X1:A", "X1:B"]);
        assert_eq!(loaded, table);
        assert_eq!(checkpoint.restore("X1:A", &loaded), table.get("X1:A").cloned());
        assert!(checkpoint.restore("X1:C", &loaded).is_none());
    }

    #[test]
    fn test_header_layout_and_determinism() {
        let checkpoint = ScanCheckpoint::new("unused.csv", false);
        let mut table = RecordTable::new();
        table.insert(record("X1:A", 12.3));
        let bytes = checkpoint.to_csv(&table).unwrap();
        assert_eq!(bytes, checkpoint.to_csv(&table).unwrap());

        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Channel,Central Time,Central Frequency (Hz),Q,Energy,SNR"
        );
        assert_eq!(lines.next().unwrap(), "X1:A,1187008882.43,123.5,5.7,12.3,5");
    }

    #[test]
    fn test_schema_mismatch_when_correlation_columns_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        let mut table = RecordTable::new();
        table.insert(record("X1:A", 12.3));
        ScanCheckpoint::new(&path, false).save(&table).unwrap();

        match ScanCheckpoint::new(&path, true).load() {
            Err(CheckpointError::SchemaMismatch { column, .. }) => assert_eq!(column, "Correlation"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (table, completed) = ScanCheckpoint::new(dir.path().join("none.csv"), true).load().unwrap();
        assert!(table.is_empty());
        assert!(completed.is_empty());
    }
}
