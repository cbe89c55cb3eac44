//! Resellbot Backend Library
//!
//! Cross-marketplace reselling engine: sources products from Amazon via
//! the SP-API, keeps a canonical product/listing store, and synchronizes
//! it with the downstream selling platforms in both directions.

pub mod accounts;
pub mod amazon;
pub mod daemon;
pub mod logging;
pub mod models;
pub mod ng_filter;
pub mod notify;
pub mod platforms;
pub mod registrar;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use daemon::{DaemonConfig, DaemonRuntime, InstanceLock, ShutdownSignal};
pub use models::{Listing, OfferResult, Platform, Product, QueueEntry, UploadResult};
pub use store::{MasterDb, ProductCache};
