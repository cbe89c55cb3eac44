//! Inventory/price synchronization: the two-phase engine and the
//! stock/visibility reconciliation rules.

pub mod engine;
pub mod reconcile;

pub use engine::{CycleStats, SyncEngine, SyncOptions};
pub use reconcile::{force_hide_asins, PricingConfig, ReconcileAction};
