use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marketplace a listing lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Base,
    Ebay,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Base => "base",
            Platform::Ebay => "ebay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "base" => Some(Platform::Base),
            "ebay" => Some(Platform::Ebay),
            _ => None,
        }
    }

    /// SKU prefix used when generating new listing SKUs
    pub fn sku_prefix(&self) -> &'static str {
        match self {
            Platform::Base => "b",
            Platform::Ebay => "s",
        }
    }
}

/// Listing lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Pending,
    Queued,
    Listed,
    Sold,
    Delisted,
    Deleted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Pending => "pending",
            ListingStatus::Queued => "queued",
            ListingStatus::Listed => "listed",
            ListingStatus::Sold => "sold",
            ListingStatus::Delisted => "delisted",
            ListingStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ListingStatus::Pending),
            "queued" => Some(ListingStatus::Queued),
            "listed" => Some(ListingStatus::Listed),
            "sold" => Some(ListingStatus::Sold),
            "delisted" => Some(ListingStatus::Delisted),
            "deleted" => Some(ListingStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Hidden,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Hidden => "hidden",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "hidden" => Some(Visibility::Hidden),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Uploading,
    Success,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Uploading => "uploading",
            QueueStatus::Success => "success",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "uploading" => Some(QueueStatus::Uploading),
            "success" => Some(QueueStatus::Success),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// One product per ASIN. Text fields are cleaned through the NG-keyword
/// filter before persistence; null inputs never clobber stored values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    pub asin: String,
    pub title_ja: Option<String>,
    pub title_en: Option<String>,
    pub description_ja: Option<String>,
    pub description_en: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub images: Vec<String>,
    pub amazon_price_jpy: Option<i64>,
    pub amazon_in_stock: Option<bool>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn new(asin: &str) -> Self {
        Self {
            asin: asin.to_string(),
            ..Default::default()
        }
    }
}

/// One selling attempt per (asin, platform, account_id). The triple is
/// UNIQUE in the store; `status = listed` implies a non-null
/// `platform_item_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub asin: String,
    pub platform: Platform,
    pub account_id: String,
    pub platform_item_id: Option<String>,
    pub sku: Option<String>,
    pub selling_price: Option<f64>,
    pub currency: String,
    pub in_stock_quantity: i64,
    pub status: ListingStatus,
    pub visibility: Visibility,
    pub listed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A scheduled upload. Same UNIQUE triple as listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub asin: String,
    pub platform: Platform,
    pub account_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub priority: i64,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Outcome of offer selection for one ASIN.
///
/// `ApiError` is load-bearing: callers must retain the previous snapshot
/// instead of treating it as zero stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OfferResult {
    Success {
        price: i64,
        is_prime: bool,
        is_fba: bool,
    },
    OutOfStock,
    FilteredOut,
    EmptyPayload,
    ApiError {
        error_code: Option<i64>,
        message: String,
    },
}

impl OfferResult {
    pub fn price(&self) -> Option<i64> {
        match self {
            OfferResult::Success { price, .. } => Some(*price),
            _ => None,
        }
    }

    pub fn in_stock(&self) -> bool {
        matches!(self, OfferResult::Success { .. })
    }

    pub fn is_api_error(&self) -> bool {
        matches!(self, OfferResult::ApiError { .. })
    }
}

/// Catalog data for one ASIN, as assembled from the SP-API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductInfo {
    pub asin: String,
    pub title_ja: Option<String>,
    pub title_en: Option<String>,
    pub description_ja: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub images: Vec<String>,
    pub bullet_points: Vec<String>,
}

/// Uniform adapter result for upload/update/delete operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub status: UploadStatus,
    pub platform_item_id: Option<String>,
    pub error_code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Success,
    Failed,
}

impl UploadResult {
    pub fn success(platform_item_id: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Success,
            platform_item_id: Some(platform_item_id.into()),
            error_code: None,
            message: None,
        }
    }

    pub fn ok() -> Self {
        Self {
            status: UploadStatus::Success,
            platform_item_id: None,
            error_code: None,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Failed,
            platform_item_id: None,
            error_code: None,
            message: Some(message.into()),
        }
    }

    pub fn failed_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Failed,
            platform_item_id: None,
            error_code: Some(code.into()),
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Success
    }
}

/// Flattened item payload handed to platform adapters by the upload worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemData {
    pub asin: String,
    pub sku: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub price: Option<f64>,
    pub stock: i64,
    pub images: Vec<String>,
    pub account_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips_through_strings() {
        for p in [Platform::Base, Platform::Ebay] {
            assert_eq!(Platform::parse(p.as_str()), Some(p));
        }
        assert_eq!(Platform::parse("yahoo"), None);
    }

    #[test]
    fn offer_result_serializes_with_status_tag() {
        let v = serde_json::to_value(OfferResult::Success {
            price: 1200,
            is_prime: true,
            is_fba: false,
        })
        .unwrap();
        assert_eq!(v["status"], "success");
        assert_eq!(v["price"], 1200);

        let v = serde_json::to_value(OfferResult::FilteredOut).unwrap();
        assert_eq!(v["status"], "filtered_out");
    }

    #[test]
    fn api_error_is_not_out_of_stock() {
        let err = OfferResult::ApiError {
            error_code: Some(400),
            message: "bad request".into(),
        };
        assert!(err.is_api_error());
        assert!(!err.in_stock());
        assert_eq!(err.price(), None);
        assert!(!OfferResult::OutOfStock.is_api_error());
    }
}
