//! Marketplace adapters.
//!
//! Every downstream platform implements the same capability set behind
//! [`PlatformAdapter`], so the upload worker and the sync engine never
//! know which marketplace they are talking to. Construction goes through
//! [`create_adapter`] keyed by the platform, with the owner-aware account
//! manager supplying credentials and proxy resolution.

pub mod base;
pub mod ebay;

use crate::accounts::AccountManager;
use crate::amazon::RateLimiter;
use crate::models::{ItemData, Listing, Platform, UploadResult, Visibility};
use crate::store::MasterDb;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Create the marketplace-side item. On success the result carries
    /// the platform item id.
    async fn upload_item(&self, item: &ItemData) -> UploadResult;

    async fn update_item(&self, platform_item_id: &str, updates: &[(String, String)])
        -> UploadResult;

    async fn delete_item(&self, platform_item_id: &str) -> UploadResult;

    async fn update_price(&self, listing: &Listing, new_price: f64) -> UploadResult;

    async fn update_quantity(&self, listing: &Listing, quantity: i64) -> UploadResult;

    async fn update_visibility(&self, listing: &Listing, visibility: Visibility) -> UploadResult;

    async fn list_items(&self, max_items: Option<usize>) -> Result<Vec<Value>>;

    async fn get_item(&self, platform_item_id: &str) -> Result<Option<Value>>;

    /// Pre-upload validation; `Err` carries the reason recorded on the
    /// queue row.
    fn validate_item(&self, item: &ItemData) -> std::result::Result<(), String>;

    /// Whether the marketplace already carries this asin/sku.
    async fn check_duplicate(&self, asin: &str, sku: &str) -> Result<bool>;

    /// Push the image list after item creation (no-op on platforms where
    /// images ride along with the item payload).
    async fn upload_images(&self, platform_item_id: &str, images: &[String]) -> UploadResult;
}

/// Shared dependencies adapters are built from.
#[derive(Clone)]
pub struct AdapterContext {
    pub account_manager: Arc<AccountManager>,
    pub db: MasterDb,
    pub limiter: Arc<RateLimiter>,
}

/// Uploader factory keyed by platform.
pub fn create_adapter(
    ctx: &AdapterContext,
    platform: Platform,
    account_id: &str,
) -> Result<Box<dyn PlatformAdapter>> {
    match platform {
        Platform::Base => Ok(Box::new(base::BaseAdapter::new(ctx, account_id)?)),
        Platform::Ebay => Ok(Box::new(ebay::EbayAdapter::new(ctx, account_id)?)),
    }
}

pub fn supported_platforms() -> &'static [Platform] {
    &[Platform::Base, Platform::Ebay]
}
