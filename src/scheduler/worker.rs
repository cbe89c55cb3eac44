//! Upload queue worker.
//!
//! One worker per platform process. Each tick it claims due queue rows
//! (priority first, then schedule) inside the business window, validates
//! and dedup-checks the item, runs the platform upload flow, and records
//! the outcome on the queue row. Success advances the listing to `listed`
//! in the same store transaction.

use crate::daemon::ShutdownSignal;
use crate::models::{
    ItemData, ListingStatus, Platform, QueueEntry, QueueStatus, UploadStatus,
};
use crate::notify::{Notifier, NotifyLevel};
use crate::platforms::{create_adapter, AdapterContext};
use crate::store::MasterDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Timelike};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct UploadWorkerConfig {
    pub platform: Platform,
    pub batch_size: i64,
    pub business_hours_start: u32,
    pub business_hours_end: u32,
}

impl UploadWorkerConfig {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            batch_size: 10,
            business_hours_start: 6,
            business_hours_end: 23,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped_outside_hours: bool,
}

#[derive(Debug, PartialEq)]
enum ItemOutcome {
    Success,
    Failed,
    Interrupted,
}

pub struct UploadWorker {
    config: UploadWorkerConfig,
    db: MasterDb,
    ctx: AdapterContext,
    shutdown: ShutdownSignal,
    notifier: Arc<Notifier>,
}

impl UploadWorker {
    pub fn new(
        config: UploadWorkerConfig,
        db: MasterDb,
        ctx: AdapterContext,
        shutdown: ShutdownSignal,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            db,
            ctx,
            shutdown,
            notifier,
        }
    }

    /// `[start, end)` on the local clock.
    pub fn is_business_hours(&self, now: DateTime<Local>) -> bool {
        let hour = now.hour();
        hour >= self.config.business_hours_start && hour < self.config.business_hours_end
    }

    /// One tick: claim and process up to `batch_size` due items. Outside
    /// business hours no state transition happens at all.
    pub async fn run_batch(&self) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        if !self.is_business_hours(Local::now()) {
            debug!(
                "outside business hours ({}:00-{}:00), idle",
                self.config.business_hours_start, self.config.business_hours_end
            );
            stats.skipped_outside_hours = true;
            return Ok(stats);
        }

        let queue_stats = self.db.queue_statistics(self.config.platform).await?;
        let pending = queue_stats.get("pending").copied().unwrap_or(0);
        if pending == 0 {
            debug!("queue empty");
            return Ok(stats);
        }

        info!(
            "processing queue: pending={} success={} failed={}",
            pending,
            queue_stats.get("success").copied().unwrap_or(0),
            queue_stats.get("failed").copied().unwrap_or(0)
        );

        let items = self
            .db
            .due_queue_entries(self.config.platform, self.config.batch_size)
            .await?;

        for item in items {
            if self.shutdown.is_set() {
                info!("shutdown requested, leaving remaining queue rows untouched");
                break;
            }

            match self.process_item(&item).await {
                Ok(ItemOutcome::Success) => {
                    stats.processed += 1;
                    stats.success += 1;
                }
                Ok(ItemOutcome::Failed) => {
                    stats.processed += 1;
                    stats.failed += 1;
                }
                Ok(ItemOutcome::Interrupted) => break,
                Err(e) => {
                    stats.processed += 1;
                    stats.failed += 1;
                    error!("queue item {} raised: {e:#}", item.asin);
                    self.db
                        .update_queue_status(
                            item.id,
                            QueueStatus::Failed,
                            Some(&format!("{e:#}")),
                            None,
                        )
                        .await
                        .ok();
                }
            }
        }

        if stats.processed > 0 {
            self.notifier
                .notify(
                    "task_completion",
                    &format!("{} uploads processed", self.config.platform.as_str()),
                    &format!(
                        "processed: {}\nsuccess: {}\nfailed: {}\nremaining: {}",
                        stats.processed,
                        stats.success,
                        stats.failed,
                        (pending as usize).saturating_sub(stats.processed)
                    ),
                    NotifyLevel::Info,
                )
                .await;
        }
        if stats.failed > stats.success && stats.failed > 0 {
            self.notifier
                .notify(
                    "task_failure",
                    &format!("{} upload failure rate high", self.config.platform.as_str()),
                    &format!("success: {}\nfailed: {}", stats.success, stats.failed),
                    NotifyLevel::Warning,
                )
                .await;
        }

        Ok(stats)
    }

    async fn process_item(&self, entry: &QueueEntry) -> Result<ItemOutcome> {
        info!(
            "upload start: asin={} account={}",
            entry.asin, entry.account_id
        );

        self.db
            .update_queue_status(entry.id, QueueStatus::Uploading, None, None)
            .await?;

        // Already-listed guard: the listing may have advanced
        // independently (manual platform sync) since this row was queued.
        let listing = self
            .db
            .get_listing(&entry.asin, entry.platform, &entry.account_id)
            .await?
            .with_context(|| format!("no listing for queued {}", entry.asin))?;
        if listing.status == ListingStatus::Listed {
            info!("{}: already listed, marking queue row done", entry.asin);
            self.db
                .update_queue_status(
                    entry.id,
                    QueueStatus::Success,
                    Some("already listed, no upload performed"),
                    None,
                )
                .await?;
            return Ok(ItemOutcome::Success);
        }

        let product = self
            .db
            .get_product(&entry.asin)
            .await?
            .with_context(|| format!("no product row for queued {}", entry.asin))?;

        let (title, description) = match entry.platform {
            Platform::Ebay => (
                product.title_en.clone().or_else(|| product.title_ja.clone()),
                product
                    .description_en
                    .clone()
                    .or_else(|| product.description_ja.clone()),
            ),
            Platform::Base => (
                product.title_ja.clone().or_else(|| product.title_en.clone()),
                product
                    .description_ja
                    .clone()
                    .or_else(|| product.description_en.clone()),
            ),
        };

        let item = ItemData {
            asin: entry.asin.clone(),
            sku: listing.sku.clone().unwrap_or_default(),
            title,
            description,
            brand: product.brand.clone(),
            price: listing.selling_price,
            stock: listing.in_stock_quantity.max(1),
            images: product.images.clone(),
            account_id: entry.account_id.clone(),
        };

        let adapter = create_adapter(&self.ctx, entry.platform, &entry.account_id)?;

        // Validation failures are recorded without consuming the retry
        // budget semantics of transient errors; the row stays failed for
        // operator triage.
        if let Err(reason) = adapter.validate_item(&item) {
            warn!("{}: validation error: {reason}", entry.asin);
            self.db
                .update_queue_status(
                    entry.id,
                    QueueStatus::Failed,
                    Some(&format!("validation error: {reason}")),
                    None,
                )
                .await?;
            return Ok(ItemOutcome::Failed);
        }

        match adapter.check_duplicate(&entry.asin, &item.sku).await {
            Ok(true) => {
                warn!("{}: duplicate detected, skipping upload", entry.asin);
                self.db
                    .update_queue_status(entry.id, QueueStatus::Failed, Some("duplicate"), None)
                    .await?;
                return Ok(ItemOutcome::Failed);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("{}: duplicate check failed ({e:#}), proceeding", entry.asin);
            }
        }

        let result = adapter.upload_item(&item).await;

        if self.was_interrupted(&result.message) {
            info!("{}: interrupted mid-upload, re-queueing", entry.asin);
            self.db
                .update_queue_status(entry.id, QueueStatus::Pending, None, None)
                .await?;
            return Ok(ItemOutcome::Interrupted);
        }

        match result.status {
            UploadStatus::Success => {
                let platform_item_id = result.platform_item_id.clone().unwrap_or_default();
                info!("{}: uploaded as {}", entry.asin, platform_item_id);

                if !item.images.is_empty() {
                    let image_result = adapter.upload_images(&platform_item_id, &item.images).await;
                    if let Some(message) = image_result.message {
                        info!("{}: {}", entry.asin, message);
                    }
                }

                self.db
                    .update_queue_status(
                        entry.id,
                        QueueStatus::Success,
                        None,
                        Some(&platform_item_id),
                    )
                    .await?;
                Ok(ItemOutcome::Success)
            }
            UploadStatus::Failed => {
                let message = result.message.unwrap_or_else(|| "unknown error".to_string());
                error!("{}: upload failed: {message}", entry.asin);
                self.db
                    .update_queue_status(entry.id, QueueStatus::Failed, Some(&message), None)
                    .await?;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    fn was_interrupted(&self, message: &Option<String>) -> bool {
        self.shutdown.is_set()
            || message
                .as_deref()
                .map(|m| m.contains("interrupted"))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountManager;
    use crate::amazon::RateLimiter;
    use crate::ng_filter::NgKeywordFilter;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn worker(start: u32, end: u32) -> (UploadWorker, TempDir) {
        let db = MasterDb::open_in_memory(Arc::new(NgKeywordFilter::default())).unwrap();
        let tokens = TempDir::new().unwrap();
        let shutdown = ShutdownSignal::new();
        let ctx = AdapterContext {
            account_manager: Arc::new(AccountManager::for_tests(
                Vec::new(),
                Vec::new(),
                tokens.path().to_path_buf(),
            )),
            db: db.clone(),
            limiter: Arc::new(RateLimiter::new(shutdown.clone())),
        };
        let config = UploadWorkerConfig {
            platform: Platform::Base,
            batch_size: 10,
            business_hours_start: start,
            business_hours_end: end,
        };
        (
            UploadWorker::new(
                config,
                db,
                ctx,
                shutdown,
                Arc::new(Notifier::new(Default::default())),
            ),
            tokens,
        )
    }

    fn at_hour(hour: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2025, 6, 15, hour, 30, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn business_window_is_inclusive_exclusive() {
        let (worker, _guard) = worker(6, 23);
        assert!(!worker.is_business_hours(at_hour(5)));
        assert!(worker.is_business_hours(at_hour(6)));
        assert!(worker.is_business_hours(at_hour(22)));
        assert!(!worker.is_business_hours(at_hour(23)));
    }

    #[tokio::test]
    async fn outside_business_hours_no_transitions_happen() {
        // A window that can never match the current hour
        let (worker, _guard) = worker(0, 0);
        worker
            .db
            .add_to_queue("B01GATE1", Platform::Base, "acc1", chrono::Utc::now(), 5)
            .await
            .unwrap();

        let stats = worker.run_batch().await.unwrap();
        assert!(stats.skipped_outside_hours);
        assert_eq!(stats.processed, 0);

        let queue_stats = worker.db.queue_statistics(Platform::Base).await.unwrap();
        assert_eq!(queue_stats.get("pending"), Some(&1));
    }
}
