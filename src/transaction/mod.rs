//! Transaction lifecycle and crash recovery.

pub mod recovery;
pub mod transaction;

pub use transaction::{TransactionManager, TransactionState};
