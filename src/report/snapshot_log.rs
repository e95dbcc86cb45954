//! Historical logging of snapshots to a JSON Lines file.

use super::Reporter;
use crate::snapshot::Snapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// One line of the log: a snapshot with the time it was reported
#[derive(Debug, Serialize)]
struct SnapshotRecord<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    snapshot: &'a Snapshot,
}

/// Appends every snapshot it receives to a JSON Lines file
pub struct SnapshotLogger {
    writer: BufWriter<File>,
    records_written: u64,
}

impl SnapshotLogger {
    /// Open (or create) the log file. Existing history is kept.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open snapshot log {}", path.display()))?;

        Ok(Self {
            writer: BufWriter::new(file),
            records_written: 0,
        })
    }

    pub fn log(&mut self, snapshot: &Snapshot) -> Result<()> {
        let record = SnapshotRecord {
            timestamp: Utc::now(),
            snapshot,
        };
        let json = serde_json::to_string(&record)?;
        writeln!(self.writer, "{}", json)?;
        self.records_written += 1;
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for SnapshotLogger {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        debug!(records = self.records_written, "Snapshot log closed");
    }
}

impl Reporter for SnapshotLogger {
    fn name(&self) -> &str {
        "snapshot_log"
    }

    fn report(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.log(snapshot).context("Failed to append snapshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CpuData;
    use std::collections::BTreeMap;

    #[test]
    fn appends_one_json_line_per_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");

        let snapshot = Snapshot {
            cpu: Some(CpuData {
                total_percent: 37.5,
                per_core_percent: BTreeMap::from([(0, 37.5)]),
                core_count: 1,
            }),
            ..Snapshot::default()
        };

        {
            let mut logger = SnapshotLogger::new(&path).unwrap();
            logger.report(&snapshot).unwrap();
            logger.report(&Snapshot::default()).unwrap();
            assert_eq!(logger.records_written, 2);
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[0]["cpu"]["total_percent"], 37.5);
        assert!(lines[0].get("memory").is_none());

        let keys: Vec<&String> = lines[1].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["timestamp"]);
    }

    #[test]
    fn reopening_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");

        for _ in 0..2 {
            let mut logger = SnapshotLogger::new(&path).unwrap();
            logger.log(&Snapshot::default()).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SnapshotLogger::new(dir.path().join("missing").join("log.jsonl"));
        assert!(result.is_err());
    }
}
