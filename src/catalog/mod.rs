//! System catalog: schemas, indexes, views, triggers and their persistence.

pub mod catalog;
pub mod schema;
pub mod types;

pub use catalog::Catalog;
pub use schema::{
    Column, ForeignKeyDef, IndexDef, Schema, TableDef, TableStatistics, TriggerAction, TriggerDef,
    TriggerEvent, TriggerTiming, ViewDef,
};
pub use types::DataType;
