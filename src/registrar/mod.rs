//! Product registration and import.
//!
//! Canonical (product, listing) pairs are produced from a live SP-API
//! fetch, from pre-parsed legacy records (CSV parsing itself lives with
//! the maintenance tooling), and from a downstream platform listing dump.
//! All paths honor the listings UNIQUE triple and the store's
//! partial-update rule, so every import is idempotent.

use crate::amazon::SpApiClient;
use crate::models::{ListingStatus, Platform, Visibility};
use crate::store::{MasterDb, ProductInput};
use anyhow::Result;
use chrono::{DateTime, Local};
use serde_json::Value;
use tracing::{info, warn};

/// SKU shape: `{platform-prefix}-{ASIN}-{YYYYMMDD_HHMM}`.
pub fn make_sku(platform: Platform, asin: &str, now: DateTime<Local>) -> String {
    format!(
        "{}-{}-{}",
        platform.sku_prefix(),
        asin,
        now.format("%Y%m%d_%H%M")
    )
}

/// Extract the ASIN from a marketplace-side identifier.
///
/// Recognizes the legacy shapes observed on BASE: `base-{asin}-…`,
/// `b-{asin}-…`, `s-{asin}-…` and the bare ASIN.
pub fn parse_identifier_asin(identifier: &str) -> Option<String> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return None;
    }

    for prefix in ["base-", "b-", "s-"] {
        if let Some(rest) = identifier.strip_prefix(prefix) {
            let candidate = rest.split('-').next().unwrap_or("");
            if looks_like_asin(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    if looks_like_asin(identifier) {
        return Some(identifier.to_string());
    }
    None
}

fn looks_like_asin(s: &str) -> bool {
    s.len() == 10 && s.chars().all(|c| c.is_ascii_alphanumeric()) && s.starts_with('B')
}

/// A pre-parsed legacy record (the CSV reader itself is external).
#[derive(Debug, Clone)]
pub struct ImportRecord {
    pub asin: String,
    pub title_ja: Option<String>,
    pub title_en: Option<String>,
    pub description_ja: Option<String>,
    pub selling_price: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportStats {
    pub products: usize,
    pub listings_created: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct ProductRegistrar {
    db: MasterDb,
}

impl ProductRegistrar {
    pub fn new(db: MasterDb) -> Self {
        Self { db }
    }

    /// Register one ASIN from a live SP-API fetch: product row plus a
    /// `pending` listing. Returns `false` when the catalog yields
    /// nothing.
    pub async fn register_from_amazon(
        &self,
        sp_api: &SpApiClient,
        asin: &str,
        platform: Platform,
        account_id: &str,
    ) -> Result<bool> {
        let Some(info) = sp_api.get_product_info(asin).await? else {
            warn!("{asin}: no catalog data, registration skipped");
            return Ok(false);
        };

        let price = sp_api.get_product_price(asin).await?;

        let mut input = ProductInput::new(asin);
        input.title_ja = info.title_ja;
        input.title_en = info.title_en;
        input.description_ja = info.description_ja;
        input.category = info.category;
        input.brand = info.brand;
        input.images = Some(info.images);
        if let Some(price) = &price {
            input.amazon_price_jpy = price.price();
            input.amazon_in_stock = Some(price.in_stock());
        }
        self.db.add_product(input).await?;

        let sku = make_sku(platform, asin, Local::now());
        self.db
            .upsert_listing(
                asin,
                platform,
                account_id,
                Some(&sku),
                None,
                default_currency(platform),
                1,
                ListingStatus::Pending,
                Visibility::Public,
            )
            .await?;

        info!("registered {asin} for {} / {}", platform.as_str(), account_id);
        Ok(true)
    }

    /// Import pre-parsed legacy records. Existing products keep their
    /// non-null fields (partial-update rule); the UNIQUE triple makes a
    /// second run create zero listings.
    pub async fn import_records(
        &self,
        records: &[ImportRecord],
        platform: Platform,
        account_id: &str,
    ) -> Result<ImportStats> {
        let mut stats = ImportStats::default();

        for record in records {
            if !looks_like_asin(&record.asin) {
                warn!("skipping record with invalid asin: {}", record.asin);
                stats.errors += 1;
                continue;
            }

            let mut input = ProductInput::new(&record.asin);
            input.title_ja = record.title_ja.clone();
            input.title_en = record.title_en.clone();
            input.description_ja = record.description_ja.clone();
            self.db.add_product(input).await?;
            stats.products += 1;

            let existing = self
                .db
                .get_listing(&record.asin, platform, account_id)
                .await?;
            if existing.is_some() {
                stats.skipped += 1;
                continue;
            }

            let sku = make_sku(platform, &record.asin, Local::now());
            self.db
                .upsert_listing(
                    &record.asin,
                    platform,
                    account_id,
                    Some(&sku),
                    record.selling_price,
                    default_currency(platform),
                    1,
                    ListingStatus::Pending,
                    Visibility::Public,
                )
                .await?;
            stats.listings_created += 1;
        }

        Ok(stats)
    }

    /// Import a live platform listing dump (BASE items JSON). Rows with a
    /// recognizable identifier become `listed` listings backfilling data
    /// for already-listed products; no queue rows are created.
    pub async fn sync_from_platform_items(
        &self,
        items: &[Value],
        platform: Platform,
        account_id: &str,
    ) -> Result<ImportStats> {
        let mut stats = ImportStats::default();

        for item in items {
            let identifier = item
                .get("identifier")
                .and_then(Value::as_str)
                .unwrap_or("");
            let Some(asin) = parse_identifier_asin(identifier) else {
                stats.skipped += 1;
                continue;
            };

            let item_id = match item.get("item_id") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            let Some(item_id) = item_id else {
                stats.skipped += 1;
                continue;
            };

            let mut input = ProductInput::new(&asin);
            input.title_ja = item.get("title").and_then(Value::as_str).map(str::to_string);
            self.db.add_product(input).await?;
            stats.products += 1;

            let price = item.get("price").and_then(Value::as_f64);
            let stock = item.get("stock").and_then(Value::as_i64).unwrap_or(0);
            let visible = item.get("visible").and_then(Value::as_i64).unwrap_or(1) == 1;

            // Keep the marketplace identifier as the SKU so later syncs
            // find the same row
            let listing_id = self
                .db
                .upsert_listing(
                    &asin,
                    platform,
                    account_id,
                    Some(identifier),
                    price,
                    default_currency(platform),
                    stock,
                    ListingStatus::Listed,
                    if visible {
                        Visibility::Public
                    } else {
                        Visibility::Hidden
                    },
                )
                .await?;

            // `listed` requires the platform item id; write it through the
            // queue-independent path
            self.db
                .set_platform_item_id(listing_id, &item_id)
                .await?;
            stats.listings_created += 1;
        }

        Ok(stats)
    }

    /// Create the missing `pending` listing for every queue row without
    /// one. A second run creates zero listings.
    pub async fn backfill_missing_listings(&self, platform: Platform) -> Result<usize> {
        let orphans = self.db.queue_rows_without_listing(platform).await?;
        let mut created = 0usize;

        for entry in orphans {
            let sku = make_sku(platform, &entry.asin, Local::now());
            self.db
                .upsert_listing(
                    &entry.asin,
                    platform,
                    &entry.account_id,
                    Some(&sku),
                    None,
                    default_currency(platform),
                    1,
                    ListingStatus::Pending,
                    Visibility::Public,
                )
                .await?;
            created += 1;
        }

        if created > 0 {
            info!("backfilled {created} missing listings on {}", platform.as_str());
        }
        Ok(created)
    }
}

fn default_currency(platform: Platform) -> &'static str {
    match platform {
        Platform::Base => "JPY",
        Platform::Ebay => "USD",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ng_filter::NgKeywordFilter;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn db() -> MasterDb {
        MasterDb::open_in_memory(Arc::new(NgKeywordFilter::default())).unwrap()
    }

    #[test]
    fn sku_shape_matches_platform_prefix_and_stamp() {
        let now = Local.with_ymd_and_hms(2025, 6, 15, 14, 30, 0).single().unwrap();
        assert_eq!(
            make_sku(Platform::Base, "B01TEST001", now),
            "b-B01TEST001-20250615_1430"
        );
        assert_eq!(
            make_sku(Platform::Ebay, "B01TEST001", now),
            "s-B01TEST001-20250615_1430"
        );
    }

    #[test]
    fn identifier_parsing_accepts_all_legacy_shapes() {
        assert_eq!(
            parse_identifier_asin("base-B01ABCDEF0-20240101").as_deref(),
            Some("B01ABCDEF0")
        );
        assert_eq!(
            parse_identifier_asin("b-B01ABCDEF0-20250615_1430").as_deref(),
            Some("B01ABCDEF0")
        );
        assert_eq!(
            parse_identifier_asin("s-B01ABCDEF0-20250615_1430").as_deref(),
            Some("B01ABCDEF0")
        );
        assert_eq!(
            parse_identifier_asin("B01ABCDEF0").as_deref(),
            Some("B01ABCDEF0")
        );
        assert_eq!(parse_identifier_asin("random-junk"), None);
        assert_eq!(parse_identifier_asin(""), None);
    }

    #[tokio::test]
    async fn import_records_is_idempotent() {
        let db = db();
        let registrar = ProductRegistrar::new(db.clone());
        let records = vec![ImportRecord {
            asin: "B01IMPORT1".to_string(),
            title_ja: Some("商品".to_string()),
            title_en: None,
            description_ja: None,
            selling_price: Some(1000.0),
        }];

        let first = registrar
            .import_records(&records, Platform::Base, "acc1")
            .await
            .unwrap();
        assert_eq!(first.listings_created, 1);

        let second = registrar
            .import_records(&records, Platform::Base, "acc1")
            .await
            .unwrap();
        assert_eq!(second.listings_created, 0);
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn backfill_missing_listings_runs_clean_twice() {
        let db = db();
        let registrar = ProductRegistrar::new(db.clone());
        db.add_to_queue("B01ORPHAN1", Platform::Base, "acc1", chrono::Utc::now(), 0)
            .await
            .unwrap();

        let first = registrar
            .backfill_missing_listings(Platform::Base)
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = registrar
            .backfill_missing_listings(Platform::Base)
            .await
            .unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn platform_dump_import_creates_listed_rows() {
        let db = db();
        let registrar = ProductRegistrar::new(db.clone());
        let items = vec![
            json!({
                "item_id": 4242,
                "identifier": "b-B01DUMP001-20250101_0900",
                "title": "ダンプ商品",
                "price": 2600,
                "stock": 1,
                "visible": 1,
            }),
            json!({"item_id": 4243, "identifier": "not-an-asin"}),
        ];

        let stats = registrar
            .sync_from_platform_items(&items, Platform::Base, "acc1")
            .await
            .unwrap();
        assert_eq!(stats.listings_created, 1);
        assert_eq!(stats.skipped, 1);

        let listing = db
            .get_listing("B01DUMP001", Platform::Base, "acc1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listing.status, ListingStatus::Listed);
        assert_eq!(listing.platform_item_id.as_deref(), Some("4242"));
    }
}
