//! RookDB - A teaching-grade relational database engine written in Rust
//!
//! This library provides the core components for a SQL database:
//! - SQL parsing (lexer, parser, AST)
//! - Paged storage (disk manager, clock buffer pool, slotted heap pages)
//! - B+ tree indexes with split/merge/rebalance
//! - Volcano-style query execution (planner, physical operators)
//! - System catalog with views and triggers
//! - Write-ahead logging, transactions and crash recovery

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod sql;
pub mod storage;
pub mod transaction;

pub use error::{Error, Result};
