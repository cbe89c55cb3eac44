//! Two-phase inventory/price sync.
//!
//! Phase 1 refreshes canonical Amazon data once for every ASIN with an
//! active listing (serial, rate-limited batches of 20). Phase 2 fans out
//! one worker per target platform and reconciles prices, visibility and
//! quantity against the already-updated store. Re-running Phase 2
//! immediately after a completed cycle performs zero platform writes.

use crate::amazon::SpApiClient;
use crate::daemon::ShutdownSignal;
use crate::models::{ListingStatus, OfferResult, Platform, Visibility};
use crate::platforms::{create_adapter, AdapterContext, PlatformAdapter};
use crate::store::{MasterDb, ProductCache, UpdateType};
use crate::sync::reconcile::{
    price_needs_update, visibility_actions, PricingConfig, ReconcileAction,
};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PHASE1_BATCH_SIZE: usize = 20;
/// Worker join poll tick; bounds how long shutdown takes to cancel
/// in-flight platform workers.
const JOIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub platforms: Vec<Platform>,
    pub dry_run: bool,
    pub skip_cache_update: bool,
    pub stock_check_only: bool,
    pub max_items: Option<usize>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            platforms: vec![Platform::Base, Platform::Ebay],
            dry_run: false,
            skip_cache_update: false,
            stock_check_only: false,
            max_items: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Phase1Stats {
    pub asins_total: usize,
    pub updated: usize,
    pub out_of_stock: usize,
    pub api_errors: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PlatformSyncStats {
    pub listings_total: usize,
    pub price_updated: usize,
    pub updated_to_hidden: usize,
    pub updated_to_public: usize,
    pub quantity_restored: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub phase1: Option<Phase1Stats>,
    pub platforms: HashMap<Platform, PlatformSyncStats>,
    pub interrupted: bool,
}

impl CycleStats {
    pub fn total_errors(&self) -> usize {
        self.platforms.values().map(|s| s.errors).sum()
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    db: MasterDb,
    cache: Option<Arc<ProductCache>>,
    sp_api: Arc<SpApiClient>,
    ctx: AdapterContext,
    shutdown: ShutdownSignal,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        db: MasterDb,
        cache: Option<Arc<ProductCache>>,
        sp_api: Arc<SpApiClient>,
        ctx: AdapterContext,
        shutdown: ShutdownSignal,
        options: SyncOptions,
    ) -> Self {
        Self {
            db,
            cache,
            sp_api,
            ctx,
            shutdown,
            options,
        }
    }

    /// One full cycle: serial Phase 1, then one worker per platform.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        if self.options.skip_cache_update || self.options.stock_check_only {
            info!("phase 1 skipped (using existing canonical data)");
        } else {
            stats.phase1 = Some(self.run_phase1().await?);
        }

        if self.shutdown.is_set() {
            info!("shutdown requested after phase 1, skipping phase 2");
            stats.interrupted = true;
            return Ok(stats);
        }

        info!(
            "phase 2: {} platform worker(s)",
            self.options.platforms.len()
        );

        let mut handles: Vec<(Platform, JoinHandle<PlatformSyncStats>)> = Vec::new();
        for platform in &self.options.platforms {
            let engine = self.clone();
            let platform = *platform;
            handles.push((
                platform,
                tokio::spawn(async move { engine.sync_platform(platform).await }),
            ));
        }

        // Poll the workers on a short tick so shutdown cancels them
        // within a bounded time.
        let mut remaining = handles;
        while !remaining.is_empty() {
            if self.shutdown.is_set() {
                warn!("shutdown requested, aborting platform workers");
                for (_, handle) in &remaining {
                    handle.abort();
                }
                stats.interrupted = true;
                break;
            }

            let mut still_running = Vec::new();
            for (platform, handle) in remaining {
                if handle.is_finished() {
                    match handle.await {
                        Ok(platform_stats) => {
                            info!("{} sync complete", platform.as_str());
                            stats.platforms.insert(platform, platform_stats);
                        }
                        Err(e) => {
                            error!("{} worker panicked: {e}", platform.as_str());
                            stats.platforms.insert(
                                platform,
                                PlatformSyncStats {
                                    errors: 1,
                                    ..Default::default()
                                },
                            );
                        }
                    }
                } else {
                    still_running.push((platform, handle));
                }
            }
            remaining = still_running;

            if !remaining.is_empty() {
                tokio::time::sleep(JOIN_POLL).await;
            }
        }

        Ok(stats)
    }

    /// Phase 1: SP-API → store. Serial, one pass, shutdown-checked
    /// between batches and between writes.
    pub async fn run_phase1(&self) -> Result<Phase1Stats> {
        let mut asins = self.db.distinct_listed_asins().await?;
        if let Some(max) = self.options.max_items {
            asins.truncate(max);
        }

        let mut stats = Phase1Stats {
            asins_total: asins.len(),
            ..Default::default()
        };
        if asins.is_empty() {
            warn!("no listed asins found, phase 1 is a no-op");
            return Ok(stats);
        }

        let batches = asins.len().div_ceil(PHASE1_BATCH_SIZE);
        info!(
            "phase 1: {} asins, {} batches, ~{}s",
            asins.len(),
            batches,
            batches * 12
        );

        let results = self
            .sp_api
            .get_prices_batch(&asins, PHASE1_BATCH_SIZE)
            .await
            .context("phase 1 batch fetch")?;

        for (asin, result) in &results {
            if self.shutdown.is_set() {
                info!("shutdown requested, stopping phase 1 writes");
                break;
            }
            self.apply_price_result(asin, result, &mut stats).await?;
        }

        info!(
            "phase 1 done: {} updated, {} out of stock, {} api errors",
            stats.updated, stats.out_of_stock, stats.api_errors
        );
        Ok(stats)
    }

    /// Phase 1 write policy for one ASIN.
    ///
    /// Success writes price and stock; the out-of-stock family keeps the
    /// last known price and only flips the stock flag; an API error
    /// leaves the row untouched so the previous snapshot survives.
    pub(crate) async fn apply_price_result(
        &self,
        asin: &str,
        result: &OfferResult,
        stats: &mut Phase1Stats,
    ) -> Result<()> {
        match result {
            OfferResult::Success {
                price,
                is_prime,
                is_fba,
            } => {
                self.db.update_amazon_info(asin, *price, true).await?;
                if let Some(cache) = &self.cache {
                    cache
                        .set(
                            asin,
                            &json!({
                                "amazon_price_jpy": price,
                                "amazon_in_stock": true,
                                "is_prime": is_prime,
                                "is_fba": is_fba,
                            }),
                            &[UpdateType::Price, UpdateType::Stock],
                        )
                        .ok();
                }
                stats.updated += 1;
            }
            OfferResult::OutOfStock | OfferResult::FilteredOut | OfferResult::EmptyPayload => {
                self.db.update_amazon_stock(asin, false).await?;
                if let Some(cache) = &self.cache {
                    cache
                        .set(asin, &json!({"amazon_in_stock": false}), &[UpdateType::Stock])
                        .ok();
                }
                stats.out_of_stock += 1;
            }
            OfferResult::ApiError { message, .. } => {
                warn!("{asin}: api error, snapshot retained ({message})");
                stats.api_errors += 1;
            }
        }
        Ok(())
    }

    /// Phase 2 worker for one platform: all active accounts, price and
    /// visibility reconciliation per listed listing.
    async fn sync_platform(&self, platform: Platform) -> PlatformSyncStats {
        let mut stats = PlatformSyncStats::default();
        let pricing = PricingConfig::for_platform(platform);

        let accounts = self.ctx.account_manager.active_accounts(platform.as_str());
        if accounts.is_empty() {
            warn!("{}: no active accounts", platform.as_str());
            return stats;
        }

        let listings = match self
            .db
            .listings_for_platform(platform, Some(ListingStatus::Listed))
            .await
        {
            Ok(listings) => listings,
            Err(e) => {
                error!("{}: listing query failed: {e:#}", platform.as_str());
                stats.errors += 1;
                return stats;
            }
        };

        for account in accounts {
            if self.shutdown.is_set() {
                break;
            }

            let adapter = match create_adapter(&self.ctx, platform, &account.id) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!(
                        "{}: adapter construction failed for {}: {e:#}",
                        platform.as_str(),
                        account.id
                    );
                    stats.errors += 1;
                    continue;
                }
            };

            let mut account_listings: Vec<_> = listings
                .iter()
                .filter(|l| l.account_id == account.id)
                .collect();
            if let Some(max) = self.options.max_items {
                account_listings.truncate(max);
            }

            for listing in account_listings {
                if self.shutdown.is_set() {
                    break;
                }
                stats.listings_total += 1;
                if let Err(e) = self
                    .reconcile_listing(platform, adapter.as_ref(), &pricing, listing, &mut stats)
                    .await
                {
                    warn!("{}: {} reconcile failed: {e:#}", platform.as_str(), listing.asin);
                    stats.errors += 1;
                }
            }
        }

        info!(
            "{}: {} listings, {} price updates, {} hidden, {} shown, {} restored, {} errors",
            platform.as_str(),
            stats.listings_total,
            stats.price_updated,
            stats.updated_to_hidden,
            stats.updated_to_public,
            stats.quantity_restored,
            stats.errors
        );
        stats
    }

    pub(crate) async fn reconcile_listing(
        &self,
        platform: Platform,
        adapter: &dyn PlatformAdapter,
        pricing: &PricingConfig,
        listing: &crate::models::Listing,
        stats: &mut PlatformSyncStats,
    ) -> Result<()> {
        let Some(product) = self.db.get_product(&listing.asin).await? else {
            // Listing without a product row is an integrity gap, not a
            // sync error
            warn!("{}: no product row for {}", platform.as_str(), listing.asin);
            return Ok(());
        };
        let amazon_in_stock = product.amazon_in_stock.unwrap_or(false);

        // Price reconciliation (skipped in stock-check-only mode, and for
        // out-of-stock products whose Amazon price is stale by design)
        if !self.options.stock_check_only && amazon_in_stock {
            if let Some(amazon_price) = product.amazon_price_jpy {
                let desired = pricing.desired_price(amazon_price);
                if price_needs_update(listing.selling_price, desired) {
                    if self.options.dry_run {
                        info!(
                            "[dry-run] {}: {} price {:?} -> {}",
                            platform.as_str(),
                            listing.asin,
                            listing.selling_price,
                            desired
                        );
                        stats.price_updated += 1;
                    } else {
                        let result = adapter.update_price(listing, desired).await;
                        if result.is_success() {
                            self.db
                                .update_listing_fields(listing.id, Some(desired), None, None, None)
                                .await?;
                            self.db
                                .add_price_history(
                                    &listing.asin,
                                    platform,
                                    &listing.account_id,
                                    listing.selling_price,
                                    desired,
                                    Some(amazon_price),
                                    pricing.markup_ratio,
                                    "inventory sync",
                                )
                                .await?;
                            stats.price_updated += 1;
                        } else {
                            warn!(
                                "{}: price update failed for {}: {}",
                                platform.as_str(),
                                listing.asin,
                                result.message.as_deref().unwrap_or("unknown")
                            );
                            stats.errors += 1;
                        }
                    }
                }
            }
        }

        // Visibility / quantity reconciliation
        for action in visibility_actions(amazon_in_stock, listing.visibility, listing.in_stock_quantity)
        {
            if self.options.dry_run {
                info!(
                    "[dry-run] {}: {} {:?}",
                    platform.as_str(),
                    listing.asin,
                    action
                );
                match action {
                    ReconcileAction::Hide => stats.updated_to_hidden += 1,
                    ReconcileAction::Show => stats.updated_to_public += 1,
                    ReconcileAction::RestoreQuantity => stats.quantity_restored += 1,
                }
                continue;
            }

            match action {
                ReconcileAction::Hide => {
                    let result = adapter.update_visibility(listing, Visibility::Hidden).await;
                    if result.is_success() {
                        self.db
                            .update_listing_fields(
                                listing.id,
                                None,
                                None,
                                Some(Visibility::Hidden),
                                None,
                            )
                            .await?;
                        stats.updated_to_hidden += 1;
                    } else {
                        stats.errors += 1;
                    }
                }
                ReconcileAction::Show => {
                    let result = adapter.update_visibility(listing, Visibility::Public).await;
                    if result.is_success() {
                        self.db
                            .update_listing_fields(
                                listing.id,
                                None,
                                None,
                                Some(Visibility::Public),
                                None,
                            )
                            .await?;
                        stats.updated_to_public += 1;
                    } else {
                        stats.errors += 1;
                    }
                }
                ReconcileAction::RestoreQuantity => {
                    let result = adapter.update_quantity(listing, 1).await;
                    if result.is_success() {
                        self.db
                            .update_listing_fields(listing.id, None, Some(1), None, None)
                            .await?;
                        stats.quantity_restored += 1;
                    } else {
                        stats.errors += 1;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountManager;
    use crate::amazon::{RateLimiter, SpApiCredentials};
    use crate::models::{ItemData, Listing, UploadResult};
    use crate::ng_filter::NgKeywordFilter;
    use crate::store::ProductInput;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use tempfile::TempDir;

    struct MockAdapter {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PlatformAdapter for MockAdapter {
        fn platform(&self) -> Platform {
            Platform::Base
        }

        async fn upload_item(&self, _item: &ItemData) -> UploadResult {
            UploadResult::success("1")
        }

        async fn update_item(
            &self,
            _platform_item_id: &str,
            _updates: &[(String, String)],
        ) -> UploadResult {
            UploadResult::ok()
        }

        async fn delete_item(&self, _platform_item_id: &str) -> UploadResult {
            UploadResult::ok()
        }

        async fn update_price(&self, listing: &Listing, new_price: f64) -> UploadResult {
            self.calls
                .lock()
                .push(format!("update_price:{}:{}", listing.asin, new_price));
            UploadResult::ok()
        }

        async fn update_quantity(&self, listing: &Listing, quantity: i64) -> UploadResult {
            self.calls
                .lock()
                .push(format!("update_quantity:{}:{}", listing.asin, quantity));
            UploadResult::ok()
        }

        async fn update_visibility(
            &self,
            listing: &Listing,
            visibility: Visibility,
        ) -> UploadResult {
            self.calls.lock().push(format!(
                "update_visibility:{}:{}",
                listing.asin,
                visibility.as_str()
            ));
            UploadResult::ok()
        }

        async fn list_items(&self, _max_items: Option<usize>) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn get_item(&self, _platform_item_id: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        fn validate_item(&self, _item: &ItemData) -> std::result::Result<(), String> {
            Ok(())
        }

        async fn check_duplicate(&self, _asin: &str, _sku: &str) -> Result<bool> {
            Ok(false)
        }

        async fn upload_images(&self, _platform_item_id: &str, _images: &[String]) -> UploadResult {
            UploadResult::ok()
        }
    }

    struct Fixture {
        engine: SyncEngine,
        db: MasterDb,
        adapter: MockAdapter,
        calls: Arc<Mutex<Vec<String>>>,
        _tokens: TempDir,
    }

    fn fixture(stock_check_only: bool) -> Fixture {
        let db = MasterDb::open_in_memory(Arc::new(NgKeywordFilter::default())).unwrap();
        let tokens = TempDir::new().unwrap();
        let account_manager = Arc::new(AccountManager::for_tests(
            Vec::new(),
            Vec::new(),
            tokens.path().to_path_buf(),
        ));
        let shutdown = ShutdownSignal::new();
        let limiter = Arc::new(RateLimiter::new(shutdown.clone()));
        let ctx = AdapterContext {
            account_manager,
            db: db.clone(),
            limiter: limiter.clone(),
        };
        let sp_api = Arc::new(SpApiClient::new(
            SpApiCredentials {
                refresh_token: "r".into(),
                lwa_app_id: "a".into(),
                lwa_client_secret: "s".into(),
            },
            limiter,
            shutdown.clone(),
            None,
        ));
        let calls = Arc::new(Mutex::new(Vec::new()));
        Fixture {
            engine: SyncEngine::new(
                db.clone(),
                None,
                sp_api,
                ctx,
                shutdown,
                SyncOptions {
                    stock_check_only,
                    ..Default::default()
                },
            ),
            db,
            adapter: MockAdapter {
                calls: calls.clone(),
            },
            calls,
            _tokens: tokens,
        }
    }

    async fn seed_listing(
        db: &MasterDb,
        asin: &str,
        price_jpy: i64,
        in_stock: bool,
        selling_price: Option<f64>,
        quantity: i64,
        visibility: Visibility,
    ) -> Listing {
        let mut input = ProductInput::new(asin);
        input.amazon_price_jpy = Some(price_jpy);
        input.amazon_in_stock = Some(in_stock);
        db.add_product(input).await.unwrap();
        db.upsert_listing(
            asin,
            Platform::Base,
            "acc1",
            Some(&format!("b-{asin}-1")),
            selling_price,
            "JPY",
            quantity,
            ListingStatus::Listed,
            visibility,
        )
        .await
        .unwrap();
        db.get_listing(asin, Platform::Base, "acc1")
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn out_of_stock_flips_public_listing_to_hidden_once() {
        let f = fixture(false);
        let listing = seed_listing(&f.db, "B01VIS1", 1000, false, Some(1300.0), 1, Visibility::Public).await;

        let pricing = PricingConfig {
            markup_ratio: 1.3,
            usd_rate: None,
        };
        let mut stats = PlatformSyncStats::default();
        f.engine
            .reconcile_listing(Platform::Base, &f.adapter, &pricing, &listing, &mut stats)
            .await
            .unwrap();

        let calls = f.calls.lock().clone();
        assert_eq!(calls, vec!["update_visibility:B01VIS1:hidden".to_string()]);
        assert_eq!(stats.updated_to_hidden, 1);

        let updated = f
            .db
            .get_listing("B01VIS1", Platform::Base, "acc1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.visibility, Visibility::Hidden);
    }

    #[tokio::test]
    async fn sold_through_listing_restores_quantity_and_stays_public() {
        let f = fixture(false);
        let listing = seed_listing(&f.db, "B01QTY1", 1000, true, Some(1300.0), 0, Visibility::Public).await;

        let pricing = PricingConfig {
            markup_ratio: 1.3,
            usd_rate: None,
        };
        let mut stats = PlatformSyncStats::default();
        f.engine
            .reconcile_listing(Platform::Base, &f.adapter, &pricing, &listing, &mut stats)
            .await
            .unwrap();

        let calls = f.calls.lock().clone();
        assert_eq!(calls, vec!["update_quantity:B01QTY1:1".to_string()]);
        assert_eq!(stats.quantity_restored, 1);

        let updated = f
            .db
            .get_listing("B01QTY1", Platform::Base, "acc1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.visibility, Visibility::Public);
        assert_eq!(updated.in_stock_quantity, 1);
    }

    #[tokio::test]
    async fn price_change_writes_platform_store_and_history() {
        let f = fixture(false);
        let listing = seed_listing(&f.db, "B01PRC1", 1000, true, Some(1000.0), 1, Visibility::Public).await;

        let pricing = PricingConfig {
            markup_ratio: 1.3,
            usd_rate: None,
        };
        let mut stats = PlatformSyncStats::default();
        f.engine
            .reconcile_listing(Platform::Base, &f.adapter, &pricing, &listing, &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.price_updated, 1);
        assert_eq!(
            f.calls.lock().clone(),
            vec!["update_price:B01PRC1:1300".to_string()]
        );
        assert_eq!(f.db.price_history_count("B01PRC1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let f = fixture(false);
        let listing = seed_listing(&f.db, "B01IDEM1", 1000, true, Some(1000.0), 1, Visibility::Public).await;
        let pricing = PricingConfig {
            markup_ratio: 1.3,
            usd_rate: None,
        };

        let mut stats = PlatformSyncStats::default();
        f.engine
            .reconcile_listing(Platform::Base, &f.adapter, &pricing, &listing, &mut stats)
            .await
            .unwrap();
        assert_eq!(f.calls.lock().len(), 1);

        // Re-read and reconcile again: no further platform writes
        let listing = f
            .db
            .get_listing("B01IDEM1", Platform::Base, "acc1")
            .await
            .unwrap()
            .unwrap();
        let mut stats = PlatformSyncStats::default();
        f.engine
            .reconcile_listing(Platform::Base, &f.adapter, &pricing, &listing, &mut stats)
            .await
            .unwrap();
        assert_eq!(f.calls.lock().len(), 1);
        assert_eq!(stats.price_updated, 0);
        assert_eq!(stats.updated_to_hidden, 0);
    }

    #[tokio::test]
    async fn api_error_retains_the_previous_snapshot() {
        let f = fixture(false);
        seed_listing(&f.db, "B01TEST003", 1500, true, Some(1950.0), 1, Visibility::Public).await;

        let mut stats = Phase1Stats::default();
        f.engine
            .apply_price_result(
                "B01TEST003",
                &OfferResult::ApiError {
                    error_code: Some(500),
                    message: "batch_request_failed".into(),
                },
                &mut stats,
            )
            .await
            .unwrap();
        assert_eq!(stats.api_errors, 1);

        let product = f.db.get_product("B01TEST003").await.unwrap().unwrap();
        assert_eq!(product.amazon_price_jpy, Some(1500));
        assert_eq!(product.amazon_in_stock, Some(true));

        // Out-of-stock keeps the price but flips the flag
        f.engine
            .apply_price_result("B01TEST003", &OfferResult::OutOfStock, &mut stats)
            .await
            .unwrap();
        let product = f.db.get_product("B01TEST003").await.unwrap().unwrap();
        assert_eq!(product.amazon_price_jpy, Some(1500));
        assert_eq!(product.amazon_in_stock, Some(false));

        // A later success writes both again
        f.engine
            .apply_price_result(
                "B01TEST003",
                &OfferResult::Success {
                    price: 1200,
                    is_prime: true,
                    is_fba: true,
                },
                &mut stats,
            )
            .await
            .unwrap();
        let product = f.db.get_product("B01TEST003").await.unwrap().unwrap();
        assert_eq!(product.amazon_price_jpy, Some(1200));
        assert_eq!(product.amazon_in_stock, Some(true));
    }

    #[tokio::test]
    async fn stock_check_only_skips_price_work() {
        let f = fixture(true);
        let listing = seed_listing(&f.db, "B01STK1", 1000, true, Some(999.0), 1, Visibility::Public).await;

        let pricing = PricingConfig {
            markup_ratio: 1.3,
            usd_rate: None,
        };
        let mut stats = PlatformSyncStats::default();
        f.engine
            .reconcile_listing(Platform::Base, &f.adapter, &pricing, &listing, &mut stats)
            .await
            .unwrap();

        assert_eq!(stats.price_updated, 0);
        assert!(f.calls.lock().is_empty());
    }
}
