//! Shared helpers for planner integration tests.

use holo_batch::{Capability, CapabilitySet, StaticCatalog};

/// Catalog with two batching stores, one store without batching, and one
/// virtual group.
///
/// Groups are named after their store: `storeA_*`, `storeB_*`, `legacy_*`,
/// `storeC` (virtual).
pub fn warehouse_catalog() -> StaticCatalog {
    let batching = CapabilitySet::none().with(Capability::BatchedUpdates);
    StaticCatalog::new()
        .with_store("storeA", batching.clone())
        .with_store("storeB", batching)
        .with_store("legacy", CapabilitySet::none())
        .with_group("storeA_orders", "storeA")
        .with_group("storeA_lines", "storeA")
        .with_group("storeB_stock", "storeB")
        .with_group("legacy_audit", "legacy")
        .with_virtual_group("storeC")
}
