//! Transaction manager
//!
//! One transaction is active per session at a time; the manager tracks
//! lifecycle state and the per-transaction undo list of log records. Commit
//! is acknowledged only after the log is durable; rollback is driven by the
//! engine, which applies the undo list in reverse through the tables.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::wal::{LogManager, LogRecord, LogRecordKind};
use crate::storage::{Rid, Tuple};

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Transaction manager
#[derive(Debug)]
pub struct TransactionManager {
    wal: Arc<LogManager>,
    states: Mutex<HashMap<u64, TransactionState>>,
    /// Per-transaction undo chain, oldest first.
    undo: Mutex<HashMap<u64, Vec<LogRecord>>>,
    next_txn_id: Mutex<u64>,
}

impl TransactionManager {
    pub fn new(wal: Arc<LogManager>) -> Self {
        Self {
            wal,
            states: Mutex::new(HashMap::new()),
            undo: Mutex::new(HashMap::new()),
            next_txn_id: Mutex::new(1),
        }
    }

    pub fn log_manager(&self) -> Arc<LogManager> {
        self.wal.clone()
    }

    /// Skip past transaction ids found in the log during recovery.
    pub fn bump_txn_id(&self, seen: u64) {
        let mut next = self.next_txn_id.lock().unwrap();
        if *next <= seen {
            *next = seen + 1;
        }
    }

    /// Begin a new transaction: allocate an id and write a BEGIN record.
    pub fn begin(&self) -> Result<u64> {
        let txn_id = {
            let mut next = self.next_txn_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        self.wal
            .append(txn_id, LogRecordKind::Begin, None, None, None, None, None)?;
        self.states
            .lock()
            .unwrap()
            .insert(txn_id, TransactionState::Active);
        self.undo.lock().unwrap().insert(txn_id, Vec::new());
        Ok(txn_id)
    }

    pub fn state(&self, txn_id: u64) -> Result<TransactionState> {
        self.states
            .lock()
            .unwrap()
            .get(&txn_id)
            .copied()
            .ok_or(Error::TransactionNotFound(txn_id))
    }

    pub fn is_active(&self, txn_id: u64) -> bool {
        matches!(self.state(txn_id), Ok(TransactionState::Active))
    }

    /// Log one mutation: the record is appended to the WAL and chained onto
    /// the transaction's undo list. Returns the record (with its LSN).
    pub fn log_mutation(
        &self,
        txn_id: u64,
        kind: LogRecordKind,
        table: String,
        rid: Rid,
        before: Option<Tuple>,
        after: Option<Tuple>,
    ) -> Result<LogRecord> {
        if !self.is_active(txn_id) {
            return Err(Error::TxnAborted);
        }
        let record = self.wal.append(
            txn_id,
            kind,
            Some(table),
            Some(rid),
            before,
            after,
            None,
        )?;
        self.undo
            .lock()
            .unwrap()
            .get_mut(&txn_id)
            .ok_or(Error::TransactionNotFound(txn_id))?
            .push(record.clone());
        Ok(record)
    }

    /// Number of undo records so far: the engine snapshots this at statement
    /// start so a failed statement can be undone alone.
    pub fn undo_len(&self, txn_id: u64) -> usize {
        self.undo
            .lock()
            .unwrap()
            .get(&txn_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Detach the undo records from position `from` to the end (newest
    /// last). Used for statement-level rollback.
    pub fn take_undo_from(&self, txn_id: u64, from: usize) -> Vec<LogRecord> {
        self.undo
            .lock()
            .unwrap()
            .get_mut(&txn_id)
            .map(|v| v.split_off(from.min(v.len())))
            .unwrap_or_default()
    }

    /// Detach the whole undo chain (transaction rollback).
    pub fn take_undo(&self, txn_id: u64) -> Vec<LogRecord> {
        self.take_undo_from(txn_id, 0)
    }

    /// Commit: write the COMMIT record and fsync the log before returning.
    /// Idempotent on an already-committed transaction.
    pub fn commit(&self, txn_id: u64) -> Result<()> {
        match self.state(txn_id)? {
            TransactionState::Committed => return Ok(()),
            TransactionState::Aborted => return Err(Error::TxnAborted),
            TransactionState::Active => {}
        }
        self.wal
            .append(txn_id, LogRecordKind::Commit, None, None, None, None, None)?;
        self.wal.flush()?;
        self.states
            .lock()
            .unwrap()
            .insert(txn_id, TransactionState::Committed);
        self.undo.lock().unwrap().remove(&txn_id);
        Ok(())
    }

    /// Finish an abort after the engine has applied the undo chain.
    /// Idempotent on an already-aborted transaction.
    pub fn finish_abort(&self, txn_id: u64) -> Result<()> {
        match self.state(txn_id)? {
            TransactionState::Aborted => return Ok(()),
            TransactionState::Committed => {
                return Err(Error::Internal(
                    "cannot abort a committed transaction".to_string(),
                ))
            }
            TransactionState::Active => {}
        }
        self.wal
            .append(txn_id, LogRecordKind::Abort, None, None, None, None, None)?;
        self.wal.flush()?;
        self.states
            .lock()
            .unwrap()
            .insert(txn_id, TransactionState::Aborted);
        self.undo.lock().unwrap().remove(&txn_id);
        Ok(())
    }
}
