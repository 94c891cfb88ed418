//! Batched update planning.
//!
//! Given the ordered update commands of one request, the planner groups
//! maximal contiguous runs bound for the same batching-capable physical store
//! into a single execution node, so each run costs one round-trip. Commands are
//! never reordered.

pub mod command;
pub mod error;
pub mod planner;

pub use command::{
    Capability, CapabilitySet, Catalog, CommandKind, GroupBinding, StaticCatalog, StoreId,
    UpdateCommand,
};
pub use error::PlanningError;
pub use planner::{explain_plan, BatchGroup, ExecutionNode, UpdateBatchPlanner};
