//! Canonical store and the derived per-ASIN snapshot cache.

pub mod cache;
pub mod master_db;

pub use cache::{ProductCache, UpdateType};
pub use master_db::{EbayListingMetadata, MasterDb, ProductInput};
