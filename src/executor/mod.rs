//! Query planning and execution: logical planner, physical selection,
//! volcano operators, expression evaluation, and the engine itself.

pub mod eval;
pub mod executor;
pub mod operators;
pub mod optimizer;
pub mod planner;

pub use executor::{Database, QueryResult, RookEngine};
pub use operators::Operator;
pub use optimizer::{Optimizer, PhysicalPlan};
pub use planner::{LogicalPlan, Planner};
