//! End-to-end listing lifecycle against the store: import, queue
//! admission pacing, claim ordering, upload bookkeeping and the
//! integrity invariants.

use chrono::{Timelike, Utc};
use std::sync::Arc;

use resellbot_backend::accounts::AccountManager;
use resellbot_backend::models::{ListingStatus, Platform, QueueStatus, Visibility};
use resellbot_backend::ng_filter::NgKeywordFilter;
use resellbot_backend::registrar::{ImportRecord, ProductRegistrar};
use resellbot_backend::scheduler::schedule_pending;
use resellbot_backend::store::{MasterDb, ProductInput};

fn db() -> MasterDb {
    MasterDb::open_in_memory(Arc::new(NgKeywordFilter::default())).unwrap()
}

fn empty_account_manager(dir: &tempfile::TempDir) -> AccountManager {
    std::fs::write(
        dir.path().join("accounts.json"),
        r#"{"accounts": [], "owners": []}"#,
    )
    .unwrap();
    AccountManager::load(dir.path()).unwrap()
}

#[tokio::test]
async fn import_schedule_upload_happy_path() {
    let db = db();
    let registrar = ProductRegistrar::new(db.clone());
    let tokens = tempfile::TempDir::new().unwrap();
    let accounts = empty_account_manager(&tokens);

    // Import three products as pending listings
    let records: Vec<ImportRecord> = (1..=3)
        .map(|i| ImportRecord {
            asin: format!("B0LIFECY{i:02}"),
            title_ja: Some(format!("商品{i}")),
            title_en: None,
            description_ja: None,
            selling_price: Some(1000.0 * i as f64),
        })
        .collect();
    let imported = registrar
        .import_records(&records, Platform::Base, "base_account_1")
        .await
        .unwrap();
    assert_eq!(imported.listings_created, 3);

    // Admit them into the queue: schedules land inside the business
    // window starting tomorrow
    let scheduled = schedule_pending(&db, &accounts, Platform::Base, 5)
        .await
        .unwrap();
    assert_eq!(scheduled.queued, 3);

    // Invariant: every pending queue row has exactly one listing with
    // the same triple
    for entry in db
        .queue_rows_without_listing(Platform::Base)
        .await
        .unwrap()
    {
        panic!("queue row without listing: {}", entry.asin);
    }

    // A second admission pass finds nothing new
    let again = schedule_pending(&db, &accounts, Platform::Base, 5)
        .await
        .unwrap();
    assert_eq!(again.queued, 0);

    // Simulate the worker finishing one upload
    db.add_to_queue(
        "B0LIFEDUE1",
        Platform::Base,
        "base_account_1",
        Utc::now() - chrono::Duration::minutes(1),
        9,
    )
    .await
    .unwrap();
    db.upsert_listing(
        "B0LIFEDUE1",
        Platform::Base,
        "base_account_1",
        Some("b-B0LIFEDUE1-20250101_0600"),
        Some(2600.0),
        "JPY",
        1,
        ListingStatus::Pending,
        Visibility::Public,
    )
    .await
    .unwrap();

    let due = db.due_queue_entries(Platform::Base, 10).await.unwrap();
    assert_eq!(due.len(), 1, "only the past-due row is claimable");
    let entry = &due[0];

    db.update_queue_status(entry.id, QueueStatus::Uploading, None, None)
        .await
        .unwrap();
    db.update_queue_status(entry.id, QueueStatus::Success, None, Some("77777"))
        .await
        .unwrap();

    // Invariant: listed implies a platform item id and a listed_at stamp
    let listing = db
        .get_listing("B0LIFEDUE1", Platform::Base, "base_account_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listing.status, ListingStatus::Listed);
    assert_eq!(listing.platform_item_id.as_deref(), Some("77777"));
    assert!(listing.listed_at.is_some());
}

#[tokio::test]
async fn scheduled_times_respect_the_business_window() {
    let db = db();
    let registrar = ProductRegistrar::new(db.clone());
    let tokens = tempfile::TempDir::new().unwrap();
    let accounts = empty_account_manager(&tokens);

    let records: Vec<ImportRecord> = (1..=20)
        .map(|i| ImportRecord {
            asin: format!("B0WINDOW{i:02}"),
            title_ja: Some("w".to_string()),
            title_en: None,
            description_ja: None,
            selling_price: Some(500.0),
        })
        .collect();
    registrar
        .import_records(&records, Platform::Base, "acc")
        .await
        .unwrap();
    schedule_pending(&db, &accounts, Platform::Base, 1)
        .await
        .unwrap();

    // All scheduled times fall inside [06:00, 23:00) local
    let far_future = Utc::now() + chrono::Duration::days(30);
    let mut conn_count = 0;
    for entry in db
        .due_entries_before(Platform::Base, far_future, 100)
        .await
        .unwrap()
    {
        let local = entry.scheduled_time.with_timezone(&chrono::Local);
        assert!(local.hour() >= 6 && local.hour() < 23);
        conn_count += 1;
    }
    assert_eq!(conn_count, 20);
}

#[tokio::test]
async fn partial_product_update_preserves_stored_fields() {
    let db = db();
    let mut input = ProductInput::new("B0PARTIAL1");
    input.title_ja = Some("タイトル".to_string());
    input.description_ja = Some("説明".to_string());
    input.amazon_price_jpy = Some(980);
    db.add_product(input).await.unwrap();

    let mut update = ProductInput::new("B0PARTIAL1");
    update.amazon_in_stock = Some(true);
    db.add_product(update).await.unwrap();

    let product = db.get_product("B0PARTIAL1").await.unwrap().unwrap();
    assert_eq!(product.title_ja.as_deref(), Some("タイトル"));
    assert_eq!(product.description_ja.as_deref(), Some("説明"));
    assert_eq!(product.amazon_price_jpy, Some(980));
    assert_eq!(product.amazon_in_stock, Some(true));
}
