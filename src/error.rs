//! Error types for RookDB
//!
//! This module defines all error kinds used throughout the database engine.

use thiserror::Error;

/// The main error type for RookDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Lexer Errors ==========
    #[error("Lexer error: unexpected character '{0}' at position {1}")]
    UnexpectedCharacter(char, usize),

    #[error("Lexer error: unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("Lexer error: invalid number format at position {0}")]
    InvalidNumber(usize),

    // ========== Parser Errors ==========
    #[error("Parse error: unexpected token '{found}', expected {expected}")]
    UnexpectedToken { expected: String, found: String },

    #[error("Parse error: unexpected end of input, expected {0}")]
    UnexpectedEof(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Semantic error: {0}")]
    SemanticError(String),

    // ========== Catalog Errors ==========
    #[error("Catalog error: database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("Catalog error: database '{0}' already exists")]
    DatabaseAlreadyExists(String),

    #[error("Catalog error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Catalog error: table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Catalog error: column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Catalog error: index '{0}' not found")]
    IndexNotFound(String),

    #[error("Catalog error: index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Catalog error: view '{0}' not found")]
    ViewNotFound(String),

    #[error("Catalog error: view '{0}' already exists")]
    ViewAlreadyExists(String),

    #[error("Catalog error: trigger '{0}' not found")]
    TriggerNotFound(String),

    #[error("Catalog error: trigger '{0}' already exists")]
    TriggerAlreadyExists(String),

    #[error("Catalog error: cursor '{0}' not found")]
    CursorNotFound(String),

    // ========== Type Errors ==========
    #[error("Type error: cannot convert {from} to {to}")]
    TypeMismatch { from: String, to: String },

    #[error("Type error: null value not allowed for column '{0}'")]
    NullNotAllowed(String),

    #[error("Type error: value too large for column '{0}'")]
    ValueTooLarge(String),

    // ========== Constraint Errors ==========
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Constraint violation: duplicate primary key in table '{0}'")]
    PrimaryKeyViolation(String),

    #[error("Constraint violation: duplicate key in unique index '{0}'")]
    UniqueViolation(String),

    #[error("Constraint violation: foreign key - {0}")]
    ForeignKeyViolation(String),

    // ========== Execution Errors ==========
    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Execution error: division by zero")]
    DivisionByZero,

    // ========== Storage Errors ==========
    #[error("Storage error: page {0} not found")]
    PageNotFound(u32),

    #[error("Storage error: buffer pool exhausted, no unpinned frame available")]
    BufferExhausted,

    #[error("Storage error: corrupted page {0}")]
    CorruptedPage(u32),

    #[error("Storage error: corrupted data - {0}")]
    Corrupted(String),

    #[error("Storage error: file for id {0} not registered")]
    FileNotRegistered(u32),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: checksum mismatch on page {0}")]
    ChecksumMismatch(u32),

    #[error("I/O error: write-ahead log fsync failed: {0}")]
    WalFsyncFailed(String),

    // ========== Transaction Errors ==========
    #[error("Transaction error: transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("Transaction error: a transaction is already active")]
    TransactionActive,

    #[error("Transaction error: no active transaction")]
    NoActiveTransaction,

    #[error("Transaction error: current transaction is aborted, use ROLLBACK")]
    TxnAborted,

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for RookDB operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that must terminate the process (WAL durability lost).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::WalFsyncFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TableNotFound("students".to_string());
        assert_eq!(err.to_string(), "Catalog error: table 'students' not found");

        let err = Error::UnexpectedCharacter('@', 5);
        assert_eq!(
            err.to_string(),
            "Lexer error: unexpected character '@' at position 5"
        );

        let err = Error::TxnAborted;
        assert!(err.to_string().contains("ROLLBACK"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::WalFsyncFailed("disk gone".into()).is_fatal());
        assert!(!Error::BufferExhausted.is_fatal());
    }
}
