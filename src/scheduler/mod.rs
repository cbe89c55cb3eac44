//! Upload queue scheduling: admission pacing and the per-platform queue
//! worker.

pub mod pacing;
pub mod worker;

pub use pacing::{calculate_time_slots, next_business_start, schedule_pending};
pub use worker::{BatchStats, UploadWorker, UploadWorkerConfig};
