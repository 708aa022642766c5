//! Crash recovery
//!
//! Three passes over the write-ahead log, starting at the last checkpoint:
//!
//! 1. **Analysis** rebuilds the sets of committed and in-flight transactions.
//! 2. **Redo** replays committed mutations whose LSN exceeds the page LSN.
//! 3. **Undo** reverse-applies the mutations of transactions still active at
//!    the end of the log.
//!
//! Mutations are replayed logically through `Table`, which maintains the
//! indexes alongside the heap, so an index never needs a separate rebuild.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::wal::{LogRecord, LogRecordKind};
use crate::storage::Table;

/// What the analysis pass learned from the log.
#[derive(Debug, Default)]
pub struct Analysis {
    pub committed: HashSet<u64>,
    pub active: HashSet<u64>,
    /// Index of the first record that redo must consider.
    pub redo_from: usize,
    /// Highest transaction id seen (the manager resumes after it).
    pub max_txn_id: u64,
}

/// Pass 1: scan the log and classify transactions.
///
/// A checkpoint record carries the transactions in flight at checkpoint
/// time; since checkpointing flushes all dirty pages first, redo can start
/// right after the checkpoint record.
pub fn analyze(records: &[LogRecord]) -> Analysis {
    let mut analysis = Analysis::default();

    let checkpoint_at = records
        .iter()
        .rposition(|r| r.kind == LogRecordKind::Checkpoint);
    if let Some(idx) = checkpoint_at {
        analysis.redo_from = idx + 1;
        for txn in records[idx].active_txns.clone().unwrap_or_default() {
            analysis.active.insert(txn);
        }
    }

    for record in records {
        analysis.max_txn_id = analysis.max_txn_id.max(record.txn_id);
        match record.kind {
            LogRecordKind::Begin => {
                analysis.active.insert(record.txn_id);
            }
            LogRecordKind::Commit => {
                analysis.committed.insert(record.txn_id);
                analysis.active.remove(&record.txn_id);
            }
            LogRecordKind::Abort => {
                analysis.active.remove(&record.txn_id);
            }
            _ => {}
        }
    }
    analysis
}

/// Pass 2: replay committed mutations forward from the redo point. The page
/// LSN gates each replay so records whose effects already reached disk are
/// skipped.
pub fn redo(
    records: &[LogRecord],
    analysis: &Analysis,
    tables: &HashMap<String, Table>,
) -> Result<usize> {
    let mut applied = 0;
    for record in &records[analysis.redo_from..] {
        if !analysis.committed.contains(&record.txn_id) {
            continue;
        }
        let (table_name, rid) = match (&record.table, record.rid) {
            (Some(t), Some(r)) => (t, r),
            _ => continue,
        };
        let table = match tables.get(table_name) {
            Some(t) => t,
            None => {
                warn!(table = %table_name, "redo references a dropped table, skipping");
                continue;
            }
        };
        if table.page_lsn(rid.page_id)? >= record.lsn {
            continue;
        }
        let outcome = match record.kind {
            LogRecordKind::Insert => record
                .after
                .as_ref()
                .map(|after| table.restore(rid, after))
                .transpose(),
            LogRecordKind::Update => record
                .after
                .as_ref()
                .map(|after| table.update(rid, after.clone()).map(|_| ()))
                .transpose(),
            LogRecordKind::Delete => table.delete(rid).map(|_| ()).map(Some),
            _ => Ok(None),
        };
        if let Err(e) = outcome {
            warn!(lsn = record.lsn, error = %e, "redo step failed, continuing");
            continue;
        }
        table.set_page_lsn(rid.page_id, record.lsn)?;
        applied += 1;
    }
    debug!(applied, "redo pass finished");
    Ok(applied)
}

/// Pass 3: walk the log backwards and reverse every mutation of a
/// transaction that never committed.
pub fn undo(
    records: &[LogRecord],
    analysis: &Analysis,
    tables: &HashMap<String, Table>,
) -> Result<usize> {
    let mut applied = 0;
    for record in records.iter().rev() {
        if !analysis.active.contains(&record.txn_id) {
            continue;
        }
        let (table_name, rid) = match (&record.table, record.rid) {
            (Some(t), Some(r)) => (t, r),
            _ => continue,
        };
        let table = match tables.get(table_name) {
            Some(t) => t,
            None => continue,
        };
        // The effect is on the page only if the page LSN caught up to it.
        if table.page_lsn(rid.page_id)? < record.lsn {
            continue;
        }
        let outcome = apply_undo(table, record, rid);
        if let Err(e) = outcome {
            warn!(lsn = record.lsn, error = %e, "undo step failed, continuing");
            continue;
        }
        applied += 1;
    }
    debug!(applied, "undo pass finished");
    Ok(applied)
}

/// Reverse one mutation using its before image. Shared between crash
/// recovery and live transaction rollback.
pub fn apply_undo(
    table: &Table,
    record: &LogRecord,
    rid: crate::storage::Rid,
) -> Result<()> {
    match record.kind {
        LogRecordKind::Insert => {
            table.delete(rid)?;
        }
        LogRecordKind::Update => {
            if let Some(before) = &record.before {
                table.update(rid, before.clone())?;
            }
        }
        LogRecordKind::Delete => {
            if let Some(before) = &record.before {
                table.restore(rid, before)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::LogRecord;
    use crate::storage::{Rid, Tuple, Value};

    fn rec(lsn: u64, txn: u64, kind: LogRecordKind) -> LogRecord {
        LogRecord {
            lsn,
            txn_id: txn,
            kind,
            table: None,
            rid: None,
            before: None,
            after: None,
            active_txns: None,
        }
    }

    #[test]
    fn test_analyze_classifies_transactions() {
        let records = vec![
            rec(1, 1, LogRecordKind::Begin),
            rec(2, 1, LogRecordKind::Commit),
            rec(3, 2, LogRecordKind::Begin),
            rec(4, 3, LogRecordKind::Begin),
            rec(5, 3, LogRecordKind::Abort),
        ];
        let analysis = analyze(&records);
        assert!(analysis.committed.contains(&1));
        assert!(analysis.active.contains(&2));
        assert!(!analysis.active.contains(&3));
        assert_eq!(analysis.max_txn_id, 3);
        assert_eq!(analysis.redo_from, 0);
    }

    #[test]
    fn test_analyze_resumes_from_checkpoint() {
        let mut checkpoint = rec(3, 0, LogRecordKind::Checkpoint);
        checkpoint.active_txns = Some(vec![7]);
        let records = vec![
            rec(1, 1, LogRecordKind::Begin),
            rec(2, 1, LogRecordKind::Commit),
            checkpoint,
            rec(4, 7, LogRecordKind::Commit),
        ];
        let analysis = analyze(&records);
        assert_eq!(analysis.redo_from, 3);
        // Transaction 7 was in flight at the checkpoint and later committed.
        assert!(analysis.committed.contains(&7));
        assert!(!analysis.active.contains(&7));
    }

    #[test]
    fn test_analyze_checkpoint_active_stays_active() {
        let mut checkpoint = rec(5, 0, LogRecordKind::Checkpoint);
        checkpoint.active_txns = Some(vec![9]);
        let records = vec![checkpoint];
        let analysis = analyze(&records);
        assert!(analysis.active.contains(&9));
    }

    #[test]
    fn test_undo_record_shapes() {
        let mut record = rec(1, 1, LogRecordKind::Delete);
        record.table = Some("t".to_string());
        record.rid = Some(Rid::new(1, 0));
        record.before = Some(Tuple::new(vec![Value::Int(1)]));
        // apply_undo of a delete is a restore; full behavior is covered by
        // the engine-level rollback tests.
        assert_eq!(record.kind, LogRecordKind::Delete);
    }
}
