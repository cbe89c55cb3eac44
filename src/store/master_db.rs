//! Canonical product/listing store.
//!
//! Single-writer SQLite database holding products, listings, the upload
//! queue, account configuration, eBay listing metadata and the price
//! history. The UNIQUE(asin, platform, account_id) indexes on listings and
//! the queue are the data-integrity backbone. Every mutating call runs in
//! a transaction that commits on success and rolls back on error.

use crate::models::{
    Listing, ListingStatus, Platform, Product, QueueEntry, QueueStatus, Visibility,
};
use crate::ng_filter::NgKeywordFilter;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    asin TEXT PRIMARY KEY,
    title_ja TEXT,
    title_en TEXT,
    description_ja TEXT,
    description_en TEXT,
    category TEXT,
    brand TEXT,
    images TEXT,
    amazon_price_jpy INTEGER,
    amazon_in_stock BOOLEAN,
    last_fetched_at TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asin TEXT NOT NULL,
    platform TEXT NOT NULL,
    account_id TEXT NOT NULL,
    platform_item_id TEXT,
    sku TEXT UNIQUE,
    selling_price REAL,
    currency TEXT DEFAULT 'JPY',
    in_stock_quantity INTEGER DEFAULT 0,
    status TEXT DEFAULT 'pending',
    visibility TEXT DEFAULT 'public',
    listed_at TEXT,
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_listings_asin ON listings(asin);
CREATE INDEX IF NOT EXISTS idx_listings_platform_account ON listings(platform, account_id);
CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_listings_asin_platform_account_unique
    ON listings(asin, platform, account_id);

CREATE TABLE IF NOT EXISTS upload_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asin TEXT NOT NULL,
    platform TEXT NOT NULL,
    account_id TEXT NOT NULL,
    scheduled_time TEXT NOT NULL,
    priority INTEGER DEFAULT 0,
    status TEXT DEFAULT 'pending',
    retry_count INTEGER DEFAULT 0,
    error_message TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_scheduled
    ON upload_queue(platform, account_id, scheduled_time, status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_asin_platform_account_unique
    ON upload_queue(asin, platform, account_id);

CREATE TABLE IF NOT EXISTS account_configs (
    id TEXT PRIMARY KEY,
    platform TEXT,
    name TEXT,
    daily_upload_limit INTEGER DEFAULT 1000,
    rate_limit_per_hour INTEGER DEFAULT 50,
    active BOOLEAN DEFAULT 1,
    credentials TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS ebay_listing_metadata (
    sku TEXT PRIMARY KEY,
    listing_id TEXT,
    offer_id TEXT,
    category_id TEXT,
    policy_payment_id TEXT,
    policy_return_id TEXT,
    policy_fulfillment_id TEXT,
    item_specifics TEXT,
    merchant_location_key TEXT DEFAULT 'JP_LOCATION',
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asin TEXT NOT NULL,
    platform TEXT NOT NULL,
    account_id TEXT NOT NULL,
    old_price REAL,
    new_price REAL,
    amazon_price_jpy INTEGER,
    markup_ratio REAL,
    strategy_used TEXT,
    change_reason TEXT,
    changed_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_price_history_asin ON price_history(asin, changed_at DESC);
"#;

/// Partial product write; `None` fields never clobber stored values.
#[derive(Debug, Clone, Default)]
pub struct ProductInput {
    pub asin: String,
    pub title_ja: Option<String>,
    pub title_en: Option<String>,
    pub description_ja: Option<String>,
    pub description_en: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub images: Option<Vec<String>>,
    pub amazon_price_jpy: Option<i64>,
    pub amazon_in_stock: Option<bool>,
}

impl ProductInput {
    pub fn new(asin: &str) -> Self {
        Self {
            asin: asin.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EbayListingMetadata {
    pub sku: String,
    pub listing_id: Option<String>,
    pub offer_id: Option<String>,
    pub category_id: Option<String>,
    pub policy_payment_id: Option<String>,
    pub policy_return_id: Option<String>,
    pub policy_fulfillment_id: Option<String>,
    pub item_specifics: Option<Value>,
    pub merchant_location_key: String,
}

#[derive(Clone)]
pub struct MasterDb {
    conn: Arc<Mutex<Connection>>,
    ng_filter: Arc<NgKeywordFilter>,
}

impl MasterDb {
    pub fn open(db_path: &Path, ng_filter: Arc<NgKeywordFilter>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open master db {}", db_path.display()))?;
        Self::init(conn, ng_filter)
    }

    pub fn open_in_memory(ng_filter: Arc<NgKeywordFilter>) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::init(conn, ng_filter)
    }

    fn init(conn: Connection, ng_filter: Arc<NgKeywordFilter>) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL).context("init schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ng_filter,
        })
    }

    // =====================================================================
    // Products
    // =====================================================================

    /// Insert or update a product. Fields passed as `None` keep their
    /// stored value; text fields are cleaned through the NG-keyword
    /// filter before the write.
    pub async fn add_product(&self, mut input: ProductInput) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let existing = get_product_tx(&tx, &input.asin)?;
        if let Some(existing) = &existing {
            if input.title_ja.is_none() {
                input.title_ja = existing.title_ja.clone();
            }
            if input.title_en.is_none() {
                input.title_en = existing.title_en.clone();
            }
            if input.description_ja.is_none() {
                input.description_ja = existing.description_ja.clone();
            }
            if input.description_en.is_none() {
                input.description_en = existing.description_en.clone();
            }
            if input.category.is_none() {
                input.category = existing.category.clone();
            }
            if input.brand.is_none() {
                input.brand = existing.brand.clone();
            }
            if input.images.is_none() && !existing.images.is_empty() {
                input.images = Some(existing.images.clone());
            }
            if input.amazon_price_jpy.is_none() {
                input.amazon_price_jpy = existing.amazon_price_jpy;
            }
            if input.amazon_in_stock.is_none() {
                input.amazon_in_stock = existing.amazon_in_stock;
            }
        }

        for field in [
            &mut input.title_ja,
            &mut input.title_en,
            &mut input.description_ja,
            &mut input.description_en,
        ] {
            let removed = self.ng_filter.clean_opt(field);
            if !removed.is_empty() {
                warn!(
                    "removed prohibited keywords from {}: {:?}",
                    input.asin, removed
                );
            }
        }

        let images_json = input
            .images
            .as_ref()
            .map(|imgs| serde_json::to_string(imgs))
            .transpose()
            .context("serialize images")?;
        let now = Utc::now().to_rfc3339();
        let created_at = existing
            .as_ref()
            .and_then(|p| p.created_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| now.clone());

        tx.execute(
            "INSERT OR REPLACE INTO products
             (asin, title_ja, title_en, description_ja, description_en,
              category, brand, images, amazon_price_jpy, amazon_in_stock,
              last_fetched_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                input.asin,
                input.title_ja,
                input.title_en,
                input.description_ja,
                input.description_en,
                input.category,
                input.brand,
                images_json,
                input.amazon_price_jpy,
                input.amazon_in_stock,
                now,
                created_at,
                now,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub async fn get_product(&self, asin: &str) -> Result<Option<Product>> {
        let conn = self.conn.lock().await;
        get_product_conn(&conn, asin)
    }

    /// Phase 1 write for a priced ASIN: price and stock together.
    pub async fn update_amazon_info(&self, asin: &str, price_jpy: i64, in_stock: bool) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let changed = tx.execute(
            "UPDATE products
             SET amazon_price_jpy = ?1, amazon_in_stock = ?2,
                 last_fetched_at = ?3, updated_at = ?3
             WHERE asin = ?4",
            params![price_jpy, in_stock, now, asin],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Phase 1 write for an out-of-stock ASIN: flip the stock flag only,
    /// keeping the last known price for downstream markup math.
    pub async fn update_amazon_stock(&self, asin: &str, in_stock: bool) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let changed = tx.execute(
            "UPDATE products
             SET amazon_in_stock = ?1, last_fetched_at = ?2, updated_at = ?2
             WHERE asin = ?3",
            params![in_stock, now, asin],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Distinct ASINs with at least one `listed` listing, in insertion
    /// order. This is the Phase 1 working set.
    pub async fn distinct_listed_asins(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT asin FROM listings WHERE status = 'listed' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // =====================================================================
    // Listings
    // =====================================================================

    pub async fn upsert_listing(
        &self,
        asin: &str,
        platform: Platform,
        account_id: &str,
        sku: Option<&str>,
        selling_price: Option<f64>,
        currency: &str,
        in_stock_quantity: i64,
        status: ListingStatus,
        visibility: Visibility,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO listings
             (asin, platform, account_id, sku, selling_price, currency,
              in_stock_quantity, status, visibility, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(asin, platform, account_id) DO UPDATE SET
                sku = COALESCE(excluded.sku, listings.sku),
                selling_price = COALESCE(excluded.selling_price, listings.selling_price),
                currency = excluded.currency,
                in_stock_quantity = excluded.in_stock_quantity,
                status = excluded.status,
                visibility = excluded.visibility,
                updated_at = excluded.updated_at",
            params![
                asin,
                platform.as_str(),
                account_id,
                sku,
                selling_price,
                currency,
                in_stock_quantity,
                status.as_str(),
                visibility.as_str(),
                now,
            ],
        )?;

        let id: i64 = tx.query_row(
            "SELECT id FROM listings WHERE asin = ?1 AND platform = ?2 AND account_id = ?3",
            params![asin, platform.as_str(), account_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub async fn get_listing(
        &self,
        asin: &str,
        platform: Platform,
        account_id: &str,
    ) -> Result<Option<Listing>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM listings WHERE asin = ?1 AND platform = ?2 AND account_id = ?3",
        )?;
        stmt.query_row(params![asin, platform.as_str(), account_id], listing_from_row)
            .optional()
            .context("get listing")
    }

    pub async fn get_listing_by_sku(&self, sku: &str) -> Result<Option<Listing>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM listings WHERE sku = ?1")?;
        stmt.query_row(params![sku], listing_from_row)
            .optional()
            .context("get listing by sku")
    }

    pub async fn listings_for_platform(
        &self,
        platform: Platform,
        status: Option<ListingStatus>,
    ) -> Result<Vec<Listing>> {
        let conn = self.conn.lock().await;
        let mut listings = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT * FROM listings WHERE platform = ?1 AND status = ?2 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![platform.as_str(), status.as_str()], listing_from_row)?;
                for row in rows {
                    listings.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare_cached("SELECT * FROM listings WHERE platform = ?1 ORDER BY id ASC")?;
                let rows = stmt.query_map(params![platform.as_str()], listing_from_row)?;
                for row in rows {
                    listings.push(row?);
                }
            }
        }
        Ok(listings)
    }

    pub async fn update_listing_fields(
        &self,
        listing_id: i64,
        selling_price: Option<f64>,
        in_stock_quantity: Option<i64>,
        visibility: Option<Visibility>,
        status: Option<ListingStatus>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let changed = tx.execute(
            "UPDATE listings SET
                selling_price = COALESCE(?1, selling_price),
                in_stock_quantity = COALESCE(?2, in_stock_quantity),
                visibility = COALESCE(?3, visibility),
                status = COALESCE(?4, status),
                updated_at = ?5
             WHERE id = ?6",
            params![
                selling_price,
                in_stock_quantity,
                visibility.map(|v| v.as_str()),
                status.map(|s| s.as_str()),
                now,
                listing_id,
            ],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Attach the marketplace-side id to a listing (platform dump
    /// imports and manual repairs).
    pub async fn set_platform_item_id(&self, listing_id: i64, platform_item_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let changed = tx.execute(
            "UPDATE listings
             SET platform_item_id = ?1,
                 listed_at = COALESCE(listed_at, ?2),
                 updated_at = ?2
             WHERE id = ?3",
            params![platform_item_id, now, listing_id],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    // =====================================================================
    // Upload queue
    // =====================================================================

    /// Add a queue row. Returns `false` without inserting when the listing
    /// is already `listed`, or when the UNIQUE triple already has a row
    /// (idempotent re-queue).
    pub async fn add_to_queue(
        &self,
        asin: &str,
        platform: Platform,
        account_id: &str,
        scheduled_time: DateTime<Utc>,
        priority: i64,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let listed: Option<String> = tx
            .query_row(
                "SELECT status FROM listings
                 WHERE asin = ?1 AND platform = ?2 AND account_id = ?3",
                params![asin, platform.as_str(), account_id],
                |row| row.get(0),
            )
            .optional()?;
        if listed.as_deref() == Some("listed") {
            info!("{asin}: already listed on {}, queue skipped", platform.as_str());
            tx.commit()?;
            return Ok(false);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO upload_queue
             (asin, platform, account_id, scheduled_time, priority, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                asin,
                platform.as_str(),
                account_id,
                scheduled_time.to_rfc3339(),
                priority,
            ],
        )?;
        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Claim-ready rows: pending, due, ordered by priority then schedule.
    pub async fn due_queue_entries(&self, platform: Platform, limit: i64) -> Result<Vec<QueueEntry>> {
        self.due_entries_before(platform, Utc::now(), limit).await
    }

    /// Pending rows scheduled before `cutoff` (inspection tooling uses a
    /// future cutoff to preview upcoming schedules).
    pub async fn due_entries_before(
        &self,
        platform: Platform,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM upload_queue
             WHERE platform = ?1 AND status = 'pending' AND scheduled_time <= ?2
             ORDER BY priority DESC, scheduled_time ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![platform.as_str(), cutoff.to_rfc3339(), limit],
            queue_from_row,
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Move a queue row to a new status. Terminal states stamp
    /// `processed_at`; failures bump `retry_count`; success with a
    /// platform item id advances the listing to `listed` in the same
    /// transaction.
    pub async fn update_queue_status(
        &self,
        queue_id: i64,
        status: QueueStatus,
        error_message: Option<&str>,
        platform_item_id: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let triple: Option<(String, String, String)> = tx
            .query_row(
                "SELECT asin, platform, account_id FROM upload_queue WHERE id = ?1",
                params![queue_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((asin, platform, account_id)) = triple else {
            tx.commit()?;
            return Ok(false);
        };

        match status {
            QueueStatus::Success => {
                tx.execute(
                    "UPDATE upload_queue
                     SET status = ?1, error_message = ?2, processed_at = ?3
                     WHERE id = ?4",
                    params![status.as_str(), error_message, now, queue_id],
                )?;
            }
            QueueStatus::Failed => {
                tx.execute(
                    "UPDATE upload_queue
                     SET status = ?1, error_message = ?2, processed_at = ?3,
                         retry_count = retry_count + 1
                     WHERE id = ?4",
                    params![status.as_str(), error_message, now, queue_id],
                )?;
            }
            _ => {
                tx.execute(
                    "UPDATE upload_queue SET status = ?1, error_message = ?2 WHERE id = ?3",
                    params![status.as_str(), error_message, queue_id],
                )?;
            }
        }

        if status == QueueStatus::Success {
            if let Some(item_id) = platform_item_id {
                tx.execute(
                    "UPDATE listings
                     SET status = 'listed', platform_item_id = ?1, listed_at = ?2, updated_at = ?2
                     WHERE asin = ?3 AND platform = ?4 AND account_id = ?5",
                    params![item_id, now, asin, platform, account_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    pub async fn queue_statistics(&self, platform: Platform) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM upload_queue WHERE platform = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![platform.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut stats = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            stats.insert(status, count);
        }
        Ok(stats)
    }

    /// Remove duplicate queue rows, keeping the lowest id per triple.
    /// Idempotent: a second run deletes nothing.
    pub async fn cleanup_duplicate_queue(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM upload_queue WHERE id NOT IN (
                SELECT MIN(id) FROM upload_queue GROUP BY asin, platform, account_id
             )",
            [],
        )?;
        tx.commit()?;
        if deleted > 0 {
            info!("removed {deleted} duplicate queue rows");
        }
        Ok(deleted)
    }

    /// Recover rows a killed worker left in `uploading`.
    pub async fn reset_uploading_to_pending(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let reset = tx.execute(
            "UPDATE upload_queue SET status = 'pending', error_message = NULL
             WHERE status = 'uploading'",
            [],
        )?;
        tx.commit()?;
        if reset > 0 {
            info!("reset {reset} stranded uploading rows to pending");
        }
        Ok(reset)
    }

    /// Queue rows with no matching listing row (integrity repair input).
    pub async fn queue_rows_without_listing(&self, platform: Platform) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT q.* FROM upload_queue q
             LEFT JOIN listings l
               ON q.asin = l.asin AND q.platform = l.platform AND q.account_id = l.account_id
             WHERE q.platform = ?1 AND l.id IS NULL
             ORDER BY q.id ASC",
        )?;
        let rows = stmt.query_map(params![platform.as_str()], queue_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Listings in `pending` with no queue row yet, for the scheduler
    /// front door.
    pub async fn pending_listings_without_queue(&self, platform: Platform) -> Result<Vec<Listing>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT l.* FROM listings l
             LEFT JOIN upload_queue q
               ON q.asin = l.asin AND q.platform = l.platform AND q.account_id = l.account_id
             WHERE l.platform = ?1 AND l.status = 'pending' AND q.id IS NULL
             ORDER BY l.id ASC",
        )?;
        let rows = stmt.query_map(params![platform.as_str()], listing_from_row)?;
        let mut listings = Vec::new();
        for row in rows {
            listings.push(row?);
        }
        Ok(listings)
    }

    /// Queue rows scheduled on `date` for one account, for daily-limit
    /// pacing.
    pub async fn upload_count_for_date(&self, account_id: &str, date: NaiveDate) -> Result<i64> {
        let conn = self.conn.lock().await;
        let start = format!("{}T00:00:00", date.format("%Y-%m-%d"));
        let end = format!("{}T23:59:59", date.format("%Y-%m-%d"));
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM upload_queue
             WHERE account_id = ?1 AND scheduled_time BETWEEN ?2 AND ?3",
            params![account_id, start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // =====================================================================
    // Account configs
    // =====================================================================

    pub async fn upsert_account_config(
        &self,
        account_id: &str,
        platform: Platform,
        name: &str,
        daily_upload_limit: i64,
        rate_limit_per_hour: i64,
        active: bool,
        credentials: Option<&Value>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let credentials_json = credentials
            .map(serde_json::to_string)
            .transpose()
            .context("serialize credentials")?;
        tx.execute(
            "INSERT OR REPLACE INTO account_configs
             (id, platform, name, daily_upload_limit, rate_limit_per_hour,
              active, credentials, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                account_id,
                platform.as_str(),
                name,
                daily_upload_limit,
                rate_limit_per_hour,
                active,
                credentials_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn active_account_ids(&self, platform: Platform) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM account_configs WHERE platform = ?1 AND active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![platform.as_str()], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // =====================================================================
    // eBay metadata sidecar
    // =====================================================================

    pub async fn save_ebay_metadata(&self, metadata: &EbayListingMetadata) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let item_specifics_json = metadata
            .item_specifics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize item specifics")?;

        tx.execute(
            "INSERT INTO ebay_listing_metadata
             (sku, listing_id, offer_id, category_id, policy_payment_id,
              policy_return_id, policy_fulfillment_id, item_specifics,
              merchant_location_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(sku) DO UPDATE SET
                listing_id = excluded.listing_id,
                offer_id = excluded.offer_id,
                category_id = excluded.category_id,
                policy_payment_id = excluded.policy_payment_id,
                policy_return_id = excluded.policy_return_id,
                policy_fulfillment_id = excluded.policy_fulfillment_id,
                item_specifics = excluded.item_specifics,
                merchant_location_key = excluded.merchant_location_key,
                updated_at = excluded.updated_at",
            params![
                metadata.sku,
                metadata.listing_id,
                metadata.offer_id,
                metadata.category_id,
                metadata.policy_payment_id,
                metadata.policy_return_id,
                metadata.policy_fulfillment_id,
                item_specifics_json,
                metadata.merchant_location_key,
                now,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_ebay_metadata(&self, sku: &str) -> Result<Option<EbayListingMetadata>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT * FROM ebay_listing_metadata WHERE sku = ?1")?;
        stmt.query_row(params![sku], |row| {
            let item_specifics: Option<String> = row.get("item_specifics")?;
            Ok(EbayListingMetadata {
                sku: row.get("sku")?,
                listing_id: row.get("listing_id")?,
                offer_id: row.get("offer_id")?,
                category_id: row.get("category_id")?,
                policy_payment_id: row.get("policy_payment_id")?,
                policy_return_id: row.get("policy_return_id")?,
                policy_fulfillment_id: row.get("policy_fulfillment_id")?,
                item_specifics: item_specifics
                    .and_then(|s| serde_json::from_str(&s).ok()),
                merchant_location_key: row.get("merchant_location_key")?,
            })
        })
        .optional()
        .context("get ebay metadata")
    }

    // =====================================================================
    // Price history
    // =====================================================================

    #[allow(clippy::too_many_arguments)]
    pub async fn add_price_history(
        &self,
        asin: &str,
        platform: Platform,
        account_id: &str,
        old_price: Option<f64>,
        new_price: f64,
        amazon_price_jpy: Option<i64>,
        markup_ratio: f64,
        change_reason: &str,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO price_history
             (asin, platform, account_id, old_price, new_price,
              amazon_price_jpy, markup_ratio, strategy_used, change_reason, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'markup', ?8, ?9)",
            params![
                asin,
                platform.as_str(),
                account_id,
                old_price,
                new_price,
                amazon_price_jpy,
                markup_ratio,
                change_reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn price_history_count(&self, asin: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM price_history WHERE asin = ?1",
            params![asin],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// =========================================================================
// Row mapping
// =========================================================================

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<Listing> {
    let platform: String = row.get("platform")?;
    let status: String = row.get("status")?;
    let visibility: String = row.get("visibility")?;
    Ok(Listing {
        id: row.get("id")?,
        asin: row.get("asin")?,
        platform: Platform::parse(&platform).unwrap_or(Platform::Base),
        account_id: row.get("account_id")?,
        platform_item_id: row.get("platform_item_id")?,
        sku: row.get("sku")?,
        selling_price: row.get("selling_price")?,
        currency: row.get("currency")?,
        in_stock_quantity: row.get("in_stock_quantity")?,
        status: ListingStatus::parse(&status).unwrap_or(ListingStatus::Pending),
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Public),
        listed_at: parse_ts(row.get("listed_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn queue_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let platform: String = row.get("platform")?;
    let status: String = row.get("status")?;
    let scheduled: String = row.get("scheduled_time")?;
    Ok(QueueEntry {
        id: row.get("id")?,
        asin: row.get("asin")?,
        platform: Platform::parse(&platform).unwrap_or(Platform::Base),
        account_id: row.get("account_id")?,
        scheduled_time: DateTime::parse_from_rfc3339(&scheduled)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        priority: row.get("priority")?,
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Pending),
        retry_count: row.get("retry_count")?,
        error_message: row.get("error_message")?,
        created_at: parse_ts(row.get("created_at")?),
        processed_at: parse_ts(row.get("processed_at")?),
    })
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    let images: Option<String> = row.get("images")?;
    Ok(Product {
        asin: row.get("asin")?,
        title_ja: row.get("title_ja")?,
        title_en: row.get("title_en")?,
        description_ja: row.get("description_ja")?,
        description_en: row.get("description_en")?,
        category: row.get("category")?,
        brand: row.get("brand")?,
        images: images
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        amazon_price_jpy: row.get("amazon_price_jpy")?,
        amazon_in_stock: row.get("amazon_in_stock")?,
        last_fetched_at: parse_ts(row.get("last_fetched_at")?),
        created_at: parse_ts(row.get("created_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn get_product_conn(conn: &Connection, asin: &str) -> Result<Option<Product>> {
    let mut stmt = conn.prepare_cached("SELECT * FROM products WHERE asin = ?1")?;
    stmt.query_row(params![asin], product_from_row)
        .optional()
        .context("get product")
}

fn get_product_tx(tx: &rusqlite::Transaction<'_>, asin: &str) -> Result<Option<Product>> {
    let mut stmt = tx.prepare("SELECT * FROM products WHERE asin = ?1")?;
    stmt.query_row(params![asin], product_from_row)
        .optional()
        .context("get product in tx")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn db() -> MasterDb {
        MasterDb::open_in_memory(Arc::new(NgKeywordFilter::default())).unwrap()
    }

    fn db_with_ng(keywords: Vec<String>) -> MasterDb {
        MasterDb::open_in_memory(Arc::new(NgKeywordFilter::new(keywords))).unwrap()
    }

    #[tokio::test]
    async fn add_product_merges_null_fields() {
        let db = db();
        let mut input = ProductInput::new("B000TEST01");
        input.title_ja = Some("最初のタイトル".to_string());
        input.amazon_price_jpy = Some(1500);
        db.add_product(input).await.unwrap();

        // Second write passes title as None and a new price: the title
        // must survive, the price must change.
        let mut update = ProductInput::new("B000TEST01");
        update.amazon_price_jpy = Some(1800);
        db.add_product(update).await.unwrap();

        let product = db.get_product("B000TEST01").await.unwrap().unwrap();
        assert_eq!(product.title_ja.as_deref(), Some("最初のタイトル"));
        assert_eq!(product.amazon_price_jpy, Some(1800));
    }

    #[tokio::test]
    async fn add_product_cleans_prohibited_keywords() {
        let db = db_with_ng(vec!["禁止語".to_string()]);
        let mut input = ProductInput::new("B000TEST02");
        input.title_ja = Some("商品 禁止語 名".to_string());
        db.add_product(input).await.unwrap();

        let product = db.get_product("B000TEST02").await.unwrap().unwrap();
        assert!(!product.title_ja.unwrap().contains("禁止語"));
    }

    #[tokio::test]
    async fn out_of_stock_write_keeps_last_price() {
        let db = db();
        let mut input = ProductInput::new("B01TEST003");
        input.amazon_price_jpy = Some(1500);
        input.amazon_in_stock = Some(true);
        db.add_product(input).await.unwrap();

        db.update_amazon_stock("B01TEST003", false).await.unwrap();

        let product = db.get_product("B01TEST003").await.unwrap().unwrap();
        assert_eq!(product.amazon_price_jpy, Some(1500));
        assert_eq!(product.amazon_in_stock, Some(false));
    }

    #[tokio::test]
    async fn listing_triple_is_unique() {
        let db = db();
        let id1 = db
            .upsert_listing(
                "B1", Platform::Base, "acc1", Some("b-B1-1"), Some(100.0),
                "JPY", 1, ListingStatus::Pending, Visibility::Public,
            )
            .await
            .unwrap();
        let id2 = db
            .upsert_listing(
                "B1", Platform::Base, "acc1", None, Some(120.0),
                "JPY", 1, ListingStatus::Pending, Visibility::Public,
            )
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let listing = db.get_listing("B1", Platform::Base, "acc1").await.unwrap().unwrap();
        assert_eq!(listing.selling_price, Some(120.0));
        // sku survives a None upsert
        assert_eq!(listing.sku.as_deref(), Some("b-B1-1"));
    }

    #[tokio::test]
    async fn queue_success_advances_listing_to_listed() {
        let db = db();
        db.upsert_listing(
            "B01TEST006", Platform::Base, "base_account_1", Some("b-B01TEST006-x"),
            Some(2000.0), "JPY", 1, ListingStatus::Pending, Visibility::Public,
        )
        .await
        .unwrap();
        let added = db
            .add_to_queue("B01TEST006", Platform::Base, "base_account_1", Utc::now(), 5)
            .await
            .unwrap();
        assert!(added);

        let due = db.due_queue_entries(Platform::Base, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        let entry = &due[0];

        db.update_queue_status(entry.id, QueueStatus::Uploading, None, None)
            .await
            .unwrap();
        db.update_queue_status(entry.id, QueueStatus::Success, None, Some("77777"))
            .await
            .unwrap();

        let listing = db
            .get_listing("B01TEST006", Platform::Base, "base_account_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listing.status, ListingStatus::Listed);
        assert_eq!(listing.platform_item_id.as_deref(), Some("77777"));
        assert!(listing.listed_at.is_some());
    }

    #[tokio::test]
    async fn queue_skips_already_listed() {
        let db = db();
        db.upsert_listing(
            "B2", Platform::Base, "acc1", None, None, "JPY", 1,
            ListingStatus::Listed, Visibility::Public,
        )
        .await
        .unwrap();
        let added = db
            .add_to_queue("B2", Platform::Base, "acc1", Utc::now(), 0)
            .await
            .unwrap();
        assert!(!added);
    }

    #[tokio::test]
    async fn duplicate_queue_insert_is_idempotent() {
        let db = db();
        assert!(db
            .add_to_queue("B3", Platform::Base, "acc1", Utc::now(), 0)
            .await
            .unwrap());
        assert!(!db
            .add_to_queue("B3", Platform::Base, "acc1", Utc::now(), 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn due_entries_order_by_priority_then_schedule() {
        let db = db();
        let now = Utc::now();
        db.add_to_queue("A1", Platform::Base, "acc", now - Duration::minutes(5), 1)
            .await
            .unwrap();
        db.add_to_queue("A2", Platform::Base, "acc", now - Duration::minutes(10), 9)
            .await
            .unwrap();
        db.add_to_queue("A3", Platform::Base, "acc", now - Duration::minutes(1), 9)
            .await
            .unwrap();
        // Not yet due
        db.add_to_queue("A4", Platform::Base, "acc", now + Duration::hours(1), 20)
            .await
            .unwrap();

        let due = db.due_queue_entries(Platform::Base, 10).await.unwrap();
        let asins: Vec<&str> = due.iter().map(|e| e.asin.as_str()).collect();
        assert_eq!(asins, vec!["A2", "A3", "A1"]);
    }

    #[tokio::test]
    async fn failed_status_increments_retry_count() {
        let db = db();
        db.add_to_queue("B4", Platform::Base, "acc1", Utc::now(), 0)
            .await
            .unwrap();
        let entry = &db.due_queue_entries(Platform::Base, 1).await.unwrap()[0];
        db.update_queue_status(entry.id, QueueStatus::Failed, Some("boom"), None)
            .await
            .unwrap();

        let stats = db.queue_statistics(Platform::Base).await.unwrap();
        assert_eq!(stats.get("failed"), Some(&1));
    }

    #[tokio::test]
    async fn cleanup_duplicate_queue_is_idempotent() {
        let db = db();
        // The UNIQUE index prevents new duplicates; simulate a legacy
        // duplicate by bypassing it with distinct account ids, then check
        // the pass removes nothing extra on a second run.
        db.add_to_queue("C1", Platform::Base, "acc1", Utc::now(), 0)
            .await
            .unwrap();
        db.add_to_queue("C1", Platform::Base, "acc2", Utc::now(), 0)
            .await
            .unwrap();
        let first = db.cleanup_duplicate_queue().await.unwrap();
        assert_eq!(first, 0);
        let second = db.cleanup_duplicate_queue().await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn reset_uploading_recovers_stranded_rows() {
        let db = db();
        db.add_to_queue("D1", Platform::Base, "acc1", Utc::now(), 0)
            .await
            .unwrap();
        let entry = &db.due_queue_entries(Platform::Base, 1).await.unwrap()[0];
        db.update_queue_status(entry.id, QueueStatus::Uploading, None, None)
            .await
            .unwrap();
        assert!(db.due_queue_entries(Platform::Base, 1).await.unwrap().is_empty());

        let reset = db.reset_uploading_to_pending().await.unwrap();
        assert_eq!(reset, 1);
        assert_eq!(db.due_queue_entries(Platform::Base, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_listed_asins_spans_platforms() {
        let db = db();
        db.upsert_listing("E1", Platform::Base, "a1", None, None, "JPY", 1,
            ListingStatus::Listed, Visibility::Public).await.unwrap();
        db.upsert_listing("E1", Platform::Ebay, "e1", None, None, "USD", 1,
            ListingStatus::Listed, Visibility::Public).await.unwrap();
        db.upsert_listing("E2", Platform::Base, "a1", None, None, "JPY", 1,
            ListingStatus::Pending, Visibility::Public).await.unwrap();

        let asins = db.distinct_listed_asins().await.unwrap();
        assert_eq!(asins, vec!["E1".to_string()]);
    }

    #[tokio::test]
    async fn ebay_metadata_round_trip() {
        let db = db();
        let metadata = EbayListingMetadata {
            sku: "s-F1-202501".to_string(),
            listing_id: Some("L1".to_string()),
            offer_id: Some("O1".to_string()),
            category_id: Some("16427".to_string()),
            merchant_location_key: "JP_LOCATION".to_string(),
            ..Default::default()
        };
        db.save_ebay_metadata(&metadata).await.unwrap();

        let loaded = db.get_ebay_metadata("s-F1-202501").await.unwrap().unwrap();
        assert_eq!(loaded.offer_id.as_deref(), Some("O1"));

        // Upsert path
        let mut updated = metadata.clone();
        updated.listing_id = Some("L2".to_string());
        db.save_ebay_metadata(&updated).await.unwrap();
        let loaded = db.get_ebay_metadata("s-F1-202501").await.unwrap().unwrap();
        assert_eq!(loaded.listing_id.as_deref(), Some("L2"));
    }

    #[tokio::test]
    async fn price_history_appends() {
        let db = db();
        db.add_price_history("G1", Platform::Base, "acc", Some(100.0), 130.0, Some(100), 1.3, "sync")
            .await
            .unwrap();
        db.add_price_history("G1", Platform::Base, "acc", Some(130.0), 150.0, Some(115), 1.3, "sync")
            .await
            .unwrap();
        assert_eq!(db.price_history_count("G1").await.unwrap(), 2);
    }
}
