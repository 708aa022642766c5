//! Write-Ahead Log manager
//!
//! Durability layer: every mutation is logged with before/after tuple images
//! before the touched page is marked dirty. Records are buffered in memory
//! and written to the per-database log file as JSON lines; `flush` makes them
//! durable with an fsync. Commit acknowledgement happens only after the log
//! covering the commit record is durable.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::heap::Rid;
use crate::storage::page::Lsn;
use crate::storage::Tuple;

/// Type of log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordKind {
    Begin,
    Insert,
    Update,
    Delete,
    Commit,
    Abort,
    Checkpoint,
}

/// A single log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number, monotonically increasing
    pub lsn: Lsn,
    /// Transaction that produced the record
    pub txn_id: u64,
    pub kind: LogRecordKind,
    /// Table name, for data records
    pub table: Option<String>,
    /// Physical location of the affected row
    pub rid: Option<Rid>,
    /// Before image, for undo
    pub before: Option<Tuple>,
    /// After image, for redo
    pub after: Option<Tuple>,
    /// In-flight transactions, for checkpoint records
    pub active_txns: Option<Vec<u64>>,
}

/// Manages the write-ahead log of one database
#[derive(Debug)]
pub struct LogManager {
    path: PathBuf,
    buffer: Mutex<Vec<LogRecord>>,
    file: Mutex<File>,
    next_lsn: Mutex<Lsn>,
    durable_lsn: Mutex<Lsn>,
    fsync: bool,
}

impl LogManager {
    /// Open (or create) the log file, resuming the LSN sequence after the
    /// highest record already on disk.
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut max_lsn = 0;
        if path.exists() {
            for record in read_records(&path)? {
                max_lsn = max_lsn.max(record.lsn);
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            buffer: Mutex::new(Vec::new()),
            file: Mutex::new(file),
            next_lsn: Mutex::new(max_lsn + 1),
            durable_lsn: Mutex::new(max_lsn),
            fsync,
        })
    }

    /// Append a record to the in-memory tail and return its LSN.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        txn_id: u64,
        kind: LogRecordKind,
        table: Option<String>,
        rid: Option<Rid>,
        before: Option<Tuple>,
        after: Option<Tuple>,
        active_txns: Option<Vec<u64>>,
    ) -> Result<LogRecord> {
        let mut lsn_guard = self.next_lsn.lock().unwrap();
        let lsn = *lsn_guard;
        *lsn_guard += 1;

        let record = LogRecord {
            lsn,
            txn_id,
            kind,
            table,
            rid,
            before,
            after,
            active_txns,
        };
        self.buffer.lock().unwrap().push(record.clone());
        Ok(record)
    }

    /// Write buffered records to disk and fsync. A failed fsync here is
    /// unrecoverable for the process (durability can no longer be promised).
    pub fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock().unwrap();
        let mut max_lsn = 0;
        for record in buffer.iter() {
            let line =
                serde_json::to_string(record).map_err(|e| Error::Internal(e.to_string()))?;
            writeln!(file, "{}", line)?;
            max_lsn = max_lsn.max(record.lsn);
        }
        file.flush()?;
        if self.fsync {
            file.sync_data()
                .map_err(|e| Error::WalFsyncFailed(e.to_string()))?;
        }
        buffer.clear();
        let mut durable = self.durable_lsn.lock().unwrap();
        *durable = (*durable).max(max_lsn);
        Ok(())
    }

    /// Ensure every record with LSN <= `lsn` is durable. Called by the buffer
    /// pool before a dirty page whose LSN is `lsn` reaches disk.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        if *self.durable_lsn.lock().unwrap() >= lsn {
            return Ok(());
        }
        self.flush()
    }

    /// Highest LSN handed out so far.
    pub fn current_lsn(&self) -> Lsn {
        *self.next_lsn.lock().unwrap() - 1
    }

    /// Read every record from the on-disk log (recovery path). Buffered
    /// records are flushed first so the view is complete.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        self.flush()?;
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_records(&self.path)
    }
}

fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord =
            serde_json::from_str(&line).map_err(|e| Error::Corrupted(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;

    fn temp_log() -> (tempfile::TempDir, LogManager) {
        let dir = tempfile::tempdir().unwrap();
        let log = LogManager::open(dir.path().join("wal.log"), true).unwrap();
        (dir, log)
    }

    #[test]
    fn test_lsn_monotonic() {
        let (_dir, log) = temp_log();
        let a = log
            .append(1, LogRecordKind::Begin, None, None, None, None, None)
            .unwrap();
        let b = log
            .append(1, LogRecordKind::Commit, None, None, None, None, None)
            .unwrap();
        assert!(b.lsn > a.lsn);
    }

    #[test]
    fn test_flush_and_read_back() {
        let (_dir, log) = temp_log();
        log.append(1, LogRecordKind::Begin, None, None, None, None, None)
            .unwrap();
        log.append(
            1,
            LogRecordKind::Insert,
            Some("students".to_string()),
            Some(Rid::new(1, 0)),
            None,
            Some(Tuple::new(vec![Value::Int(1)])),
            None,
        )
        .unwrap();
        log.flush().unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].kind, LogRecordKind::Insert);
        assert_eq!(records[1].table.as_deref(), Some("students"));
    }

    #[test]
    fn test_lsn_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let last = {
            let log = LogManager::open(&path, true).unwrap();
            log.append(1, LogRecordKind::Begin, None, None, None, None, None)
                .unwrap();
            let last = log
                .append(1, LogRecordKind::Commit, None, None, None, None, None)
                .unwrap();
            log.flush().unwrap();
            last.lsn
        };
        let log = LogManager::open(&path, true).unwrap();
        let next = log
            .append(2, LogRecordKind::Begin, None, None, None, None, None)
            .unwrap();
        assert!(next.lsn > last);
    }

    #[test]
    fn test_flush_up_to_noop_when_durable() {
        let (_dir, log) = temp_log();
        let rec = log
            .append(1, LogRecordKind::Begin, None, None, None, None, None)
            .unwrap();
        log.flush().unwrap();
        // Already durable: must not error or rewrite.
        log.flush_up_to(rec.lsn).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 1);
    }
}
