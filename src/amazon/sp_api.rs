//! Amazon SP-API client.
//!
//! Catalog Items for product data, Product Pricing (getItemOffersBatch)
//! for price/stock. All requests go through the per-endpoint rate limiter;
//! the 12-second inter-batch wait is interruptible via the shared shutdown
//! signal. QuotaExceeded triggers a single notification per client
//! lifetime while every occurrence is still counted.

use crate::amazon::config::SpApiCredentials;
use crate::amazon::rate_limit::{EndpointClass, RateLimiter};
use crate::daemon::ShutdownSignal;
use crate::models::{OfferResult, ProductInfo};
use crate::notify::{Notifier, NotifyLevel};
use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const LWA_TOKEN_URL: &str = "https://api.amazon.com/auth/o2/token";
const SP_API_BASE: &str = "https://sellingpartnerapi-fe.amazon.com";
pub const MARKETPLACE_ID_JP: &str = "A1VC38T7YXB528";

const MAX_BATCH_SIZE: usize = 20;
const PRICE_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Token safety margin: treat the LWA token as expired 300 s early.
const TOKEN_MARGIN_SECS: u64 = 300;

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct SpApiClient {
    client: Client,
    credentials: SpApiCredentials,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
    notifier: Option<Arc<Notifier>>,
    token: Mutex<Option<CachedToken>>,
    quota_notified: AtomicBool,
    quota_count: AtomicU64,
    debug_asin: Option<String>,
}

impl SpApiClient {
    pub fn new(
        credentials: SpApiCredentials,
        limiter: Arc<RateLimiter>,
        shutdown: ShutdownSignal,
        notifier: Option<Arc<Notifier>>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let debug_asin = std::env::var("DEBUG_ASIN").ok().filter(|v| !v.is_empty());

        Self {
            client,
            credentials,
            limiter,
            shutdown,
            notifier,
            token: Mutex::new(None),
            quota_notified: AtomicBool::new(false),
            quota_count: AtomicU64::new(0),
            debug_asin,
        }
    }

    pub fn quota_exceeded_count(&self) -> u64 {
        self.quota_count.load(Ordering::Relaxed)
    }

    /// LWA access token, refreshed when the cached one is within the
    /// safety margin of expiry. Failures here are fatal to the call.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let response = self
            .client
            .post(LWA_TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("client_id", self.credentials.lwa_app_id.as_str()),
                ("client_secret", self.credentials.lwa_client_secret.as_str()),
            ])
            .send()
            .await
            .context("LWA token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LWA token exchange failed: {status} - {body}");
        }

        let token: TokenResponse = response.json().await.context("parse LWA token response")?;
        let expires_at = Instant::now()
            + Duration::from_secs(token.expires_in.saturating_sub(TOKEN_MARGIN_SECS));
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }

    // =====================================================================
    // Catalog
    // =====================================================================

    /// Fetch catalog data for one ASIN.
    ///
    /// Returns `Ok(None)` for an unknown ASIN or when the rate-limit wait
    /// was interrupted by shutdown.
    pub async fn get_product_info(&self, asin: &str) -> Result<Option<ProductInfo>> {
        if !self.limiter.wait(EndpointClass::Catalog).await {
            return Ok(None);
        }

        let token = self.access_token().await?;
        let url = format!("{SP_API_BASE}/catalog/2022-04-01/items/{asin}");
        let response = self
            .client
            .get(&url)
            .header("x-amz-access-token", token)
            .query(&[
                ("marketplaceIds", MARKETPLACE_ID_JP),
                ("includedData", "attributes,summaries,images,salesRanks"),
            ])
            .send()
            .await
            .context("catalog request")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("catalog item not found: {asin}");
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("catalog request failed for {asin}: {status} - {body}");
            self.track_quota_exceeded(asin, &body).await;
            return Ok(None);
        }

        let item: Value = response.json().await.context("parse catalog response")?;
        Ok(Some(build_product_info(asin, &item)))
    }

    // =====================================================================
    // Pricing (getItemOffersBatch)
    // =====================================================================

    /// Fetch offers for a set of ASINs in batches of up to 20, one
    /// rate-limited batch request at a time.
    ///
    /// Every input ASIN gets an entry unless the shutdown signal aborted
    /// the remaining batches.
    pub async fn get_prices_batch(
        &self,
        asins: &[String],
        batch_size: usize,
    ) -> Result<HashMap<String, OfferResult>> {
        let batch_size = if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            warn!("batch size clamped to {MAX_BATCH_SIZE}");
            MAX_BATCH_SIZE
        } else {
            batch_size
        };

        let mut results = HashMap::new();
        let batches: Vec<&[String]> = asins.chunks(batch_size).collect();
        let total = batches.len();

        for (idx, batch) in batches.into_iter().enumerate() {
            if !self.limiter.wait(EndpointClass::ItemOffersBatch).await {
                info!(
                    "shutdown requested, aborting price batches ({}/{} done)",
                    idx, total
                );
                break;
            }

            let started = Instant::now();
            info!("price batch {}/{}: {} asins", idx + 1, total, batch.len());

            match self.request_offers_batch(batch).await {
                Ok(responses) => {
                    let mut ok = 0usize;
                    let mut failed = 0usize;
                    for item in responses {
                        let Some(asin) = item.asin() else { continue };
                        let result = self.parse_batch_item(&asin, &item);
                        if result.is_api_error() {
                            failed += 1;
                        } else {
                            ok += 1;
                        }
                        results.insert(asin, result);
                    }
                    info!(
                        "price batch {}/{} done in {:.2}s: {} ok, {} failed",
                        idx + 1,
                        total,
                        started.elapsed().as_secs_f64(),
                        ok,
                        failed
                    );
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    error!("price batch {}/{} failed: {}", idx + 1, total, message);
                    if is_quota_exceeded(&message) {
                        let sample = batch.first().map(String::as_str).unwrap_or("n/a");
                        self.track_quota_exceeded(sample, &message).await;
                    }
                    for asin in batch {
                        results
                            .entry(asin.clone())
                            .or_insert_with(|| OfferResult::ApiError {
                                error_code: None,
                                message: message.clone(),
                            });
                    }
                }
            }
        }

        Ok(results)
    }

    async fn request_offers_batch(&self, asins: &[String]) -> Result<Vec<BatchItemResponse>> {
        let token = self.access_token().await?;

        let requests: Vec<Value> = asins
            .iter()
            .map(|asin| {
                json!({
                    "uri": format!("/products/pricing/v0/items/{asin}/offers"),
                    "method": "GET",
                    "MarketplaceId": MARKETPLACE_ID_JP,
                    "ItemCondition": "New",
                })
            })
            .collect();

        let url = format!("{SP_API_BASE}/batches/products/pricing/v0/itemOffers");
        let response = self
            .client
            .post(&url)
            .header("x-amz-access-token", token)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .context("item offers batch request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("item offers batch failed: {status} - {body}");
        }

        #[derive(Deserialize)]
        struct BatchEnvelope {
            responses: Vec<BatchItemResponse>,
        }

        let envelope: BatchEnvelope = response
            .json()
            .await
            .context("parse item offers batch response")?;
        Ok(envelope.responses)
    }

    fn parse_batch_item(&self, asin: &str, item: &BatchItemResponse) -> OfferResult {
        let status_code = item.status.as_ref().map(|s| s.status_code).unwrap_or(0);

        if status_code != 200 {
            let reason = item
                .status
                .as_ref()
                .and_then(|s| s.reason_phrase.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            warn!("{asin}: status {status_code}: {reason}");
            return OfferResult::ApiError {
                error_code: Some(status_code),
                message: reason,
            };
        }

        let payload = item
            .body
            .as_ref()
            .and_then(|b| b.get("payload"))
            .cloned()
            .unwrap_or(Value::Null);
        if payload.is_null() {
            return OfferResult::EmptyPayload;
        }

        let offers: Vec<Offer> = payload
            .get("Offers")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let debug = self.debug_asin.as_deref() == Some(asin);
        select_best_offer(asin, &offers, debug)
    }

    /// Single-ASIN price lookup with retry on QuotaExceeded.
    pub async fn get_product_price(&self, asin: &str) -> Result<Option<OfferResult>> {
        let mut last_error = None;

        for attempt in 1..=PRICE_RETRIES {
            if !self.limiter.wait(EndpointClass::Catalog).await {
                return Ok(None);
            }

            match self.request_item_offers(asin).await {
                Ok(result) => return Ok(Some(result)),
                Err(e) => {
                    let message = format!("{e:#}");
                    if is_quota_exceeded(&message) {
                        warn!(
                            "QuotaExceeded for {asin} ({attempt}/{PRICE_RETRIES})"
                        );
                        self.track_quota_exceeded(asin, &message).await;
                    } else {
                        warn!("price lookup failed for {asin} ({attempt}/{PRICE_RETRIES}): {message}");
                    }
                    last_error = Some(message);

                    if attempt < PRICE_RETRIES {
                        if !self.shutdown.sleep(RETRY_DELAY).await {
                            info!("shutdown requested, aborting retries for {asin}");
                            return Ok(None);
                        }
                    }
                }
            }
        }

        // Retries exhausted: an API error, distinct from out-of-stock, so
        // the caller keeps its previous snapshot.
        error!(
            "price lookup for {asin} failed after {PRICE_RETRIES} attempts: {}",
            last_error.as_deref().unwrap_or("unknown")
        );
        Ok(Some(OfferResult::ApiError {
            error_code: None,
            message: last_error.unwrap_or_else(|| "retries exhausted".to_string()),
        }))
    }

    async fn request_item_offers(&self, asin: &str) -> Result<OfferResult> {
        let token = self.access_token().await?;
        let url = format!("{SP_API_BASE}/products/pricing/v0/items/{asin}/offers");
        let response = self
            .client
            .get(&url)
            .header("x-amz-access-token", token)
            .query(&[
                ("MarketplaceId", MARKETPLACE_ID_JP),
                ("ItemCondition", "New"),
            ])
            .send()
            .await
            .context("item offers request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("item offers failed: {status} - {body}");
        }

        let body: Value = response.json().await.context("parse item offers")?;
        let offers: Vec<Offer> = body
            .get("payload")
            .and_then(|p| p.get("Offers"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let debug = self.debug_asin.as_deref() == Some(asin);
        Ok(select_best_offer(asin, &offers, debug))
    }

    // =====================================================================
    // Pricing (getPricingForAsins) — alternative path, currently not
    // driven by the sync engine
    // =====================================================================

    /// Batch price lookup via the getPricing endpoint. Faster quota but a
    /// coarser payload: free-shipping + FBA is used as the delivery proxy.
    pub async fn get_pricing_batch(
        &self,
        asins: &[String],
    ) -> Result<HashMap<String, OfferResult>> {
        let mut results = HashMap::new();

        for batch in asins.chunks(MAX_BATCH_SIZE) {
            if !self.limiter.wait(EndpointClass::PricingForAsins).await {
                break;
            }

            let token = self.access_token().await?;
            let asin_list = batch.join(",");
            let url = format!("{SP_API_BASE}/products/pricing/v0/price");
            let response = self
                .client
                .get(&url)
                .header("x-amz-access-token", token)
                .query(&[
                    ("MarketplaceId", MARKETPLACE_ID_JP),
                    ("Asins", asin_list.as_str()),
                    ("ItemType", "Asin"),
                    ("ItemCondition", "New"),
                ])
                .send()
                .await
                .context("getPricing request")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!("getPricing batch failed: {status} - {body}");
                for asin in batch {
                    results.insert(
                        asin.clone(),
                        OfferResult::ApiError {
                            error_code: Some(status.as_u16() as i64),
                            message: body.clone(),
                        },
                    );
                }
                continue;
            }

            let body: Value = response.json().await.context("parse getPricing response")?;
            let items = body
                .get("payload")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for item in items {
                let Some(asin) = item.get("ASIN").and_then(Value::as_str) else {
                    continue;
                };
                results.insert(asin.to_string(), parse_pricing_item(&item));
            }
        }

        Ok(results)
    }

    // =====================================================================
    // Combined helpers
    // =====================================================================

    /// Catalog info merged with a single-ASIN price lookup.
    pub async fn get_product_with_price(
        &self,
        asin: &str,
    ) -> Result<Option<(ProductInfo, Option<OfferResult>)>> {
        let Some(info) = self.get_product_info(asin).await? else {
            return Ok(None);
        };
        let price = self.get_product_price(asin).await?;
        Ok(Some((info, price)))
    }

    async fn track_quota_exceeded(&self, asin: &str, message: &str) {
        if !is_quota_exceeded(message) {
            return;
        }
        self.quota_count.fetch_add(1, Ordering::Relaxed);

        // Notify operators once per client lifetime, count the rest.
        if self.quota_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(notifier) = &self.notifier {
            notifier
                .notify(
                    "quota_exceeded",
                    "SP-API QuotaExceeded",
                    &format!("first occurrence on ASIN {asin}: {message}"),
                    NotifyLevel::Warning,
                )
                .await;
        }
    }
}

fn is_quota_exceeded(message: &str) -> bool {
    message.contains("QuotaExceeded") || message.to_lowercase().contains("rate limit")
}

// =========================================================================
// Response types
// =========================================================================

#[derive(Debug, Deserialize)]
struct BatchItemResponse {
    status: Option<BatchItemStatus>,
    request: Option<Value>,
    body: Option<Value>,
}

impl BatchItemResponse {
    fn asin(&self) -> Option<String> {
        self.request
            .as_ref()?
            .get("Asin")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
struct BatchItemStatus {
    #[serde(rename = "statusCode", default)]
    status_code: i64,
    #[serde(rename = "reasonPhrase")]
    reason_phrase: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Offer {
    #[serde(rename = "SubCondition", default)]
    pub sub_condition: String,
    #[serde(rename = "Shipping")]
    pub shipping: Option<Money>,
    #[serde(rename = "ShippingTime")]
    pub shipping_time: Option<ShippingTime>,
    #[serde(rename = "ListingPrice")]
    pub listing_price: Option<Money>,
    #[serde(rename = "PrimeInformation")]
    pub prime_information: Option<PrimeInformation>,
    #[serde(rename = "IsFulfilledByAmazon", default)]
    pub is_fulfilled_by_amazon: bool,
    #[serde(rename = "IsBuyBoxWinner", default)]
    pub is_buy_box_winner: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Money {
    #[serde(rename = "Amount")]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShippingTime {
    #[serde(rename = "availabilityType")]
    pub availability_type: Option<String>,
    #[serde(rename = "maximumHours")]
    pub maximum_hours: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrimeInformation {
    #[serde(rename = "IsPrime", default)]
    pub is_prime: bool,
}

// =========================================================================
// Offer selection
// =========================================================================

/// The sentinel maximumHours carries when the field is absent; those
/// offers are invitation-only and never eligible.
const INVITATION_ONLY_HOURS: i64 = 999;
const MAX_DELIVERY_HOURS: i64 = 72;

/// Filter and score the offers for one ASIN.
///
/// Hard filters: condition New, free shipping, delivery within 72 hours,
/// and not invitation-only. Score: +1000 for immediate availability,
/// +(72 - maximumHours), +100 Prime, +50 FBA. Highest score wins, ties go
/// to the lowest price.
pub fn select_best_offer(asin: &str, offers: &[Offer], debug: bool) -> OfferResult {
    if offers.is_empty() {
        if debug {
            debug!("{asin}: no offers (out of stock)");
        }
        return OfferResult::OutOfStock;
    }

    struct Candidate {
        price: f64,
        score: i64,
        is_prime: bool,
        is_fba: bool,
    }

    let mut candidates: Vec<Candidate> = Vec::new();

    for (idx, offer) in offers.iter().enumerate() {
        if offer.sub_condition.to_lowercase() != "new" {
            if debug {
                debug!("{asin} offer #{}: not new, skipped", idx + 1);
            }
            continue;
        }

        let shipping_amount = offer
            .shipping
            .as_ref()
            .and_then(|s| s.amount)
            .unwrap_or(0.0);
        let max_hours = offer
            .shipping_time
            .as_ref()
            .and_then(|t| t.maximum_hours)
            .unwrap_or(INVITATION_ONLY_HOURS);
        let availability = offer
            .shipping_time
            .as_ref()
            .and_then(|t| t.availability_type.as_deref())
            .unwrap_or("");

        if max_hours == INVITATION_ONLY_HOURS {
            if debug {
                debug!("{asin} offer #{}: invitation-only, skipped", idx + 1);
            }
            continue;
        }
        if max_hours > MAX_DELIVERY_HOURS || shipping_amount != 0.0 {
            if debug {
                debug!(
                    "{asin} offer #{}: hours={} shipping={} fails hard filter",
                    idx + 1,
                    max_hours,
                    shipping_amount
                );
            }
            continue;
        }

        let Some(price) = offer.listing_price.as_ref().and_then(|p| p.amount) else {
            continue;
        };

        let is_prime = offer
            .prime_information
            .as_ref()
            .map(|p| p.is_prime)
            .unwrap_or(false);
        let is_fba = offer.is_fulfilled_by_amazon;
        let is_immediate = availability == "NOW";

        let mut score = 0i64;
        if is_immediate {
            score += 1000;
        }
        score += MAX_DELIVERY_HOURS - max_hours;
        if is_prime {
            score += 100;
        }
        if is_fba {
            score += 50;
        }

        if debug {
            debug!(
                "{asin} offer #{}: price={} score={} prime={} fba={}",
                idx + 1,
                price,
                score,
                is_prime,
                is_fba
            );
        }

        candidates.push(Candidate {
            price,
            score,
            is_prime,
            is_fba,
        });
    }

    if candidates.is_empty() {
        if debug {
            debug!("{asin}: offers exist but none passed the filters");
        }
        return OfferResult::FilteredOut;
    }

    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal))
    });
    let best = &candidates[0];

    if debug {
        debug!("{asin}: selected price={} score={}", best.price, best.score);
    }

    OfferResult::Success {
        price: best.price.round() as i64,
        is_prime: best.is_prime,
        is_fba: best.is_fba,
    }
}

fn parse_pricing_item(item: &Value) -> OfferResult {
    let offers = item
        .pointer("/Product/Offers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if offers.is_empty() {
        return OfferResult::OutOfStock;
    }

    // Buy-box price preferred, lowest otherwise
    let selected = offers
        .iter()
        .find(|o| o.get("OfferType").and_then(Value::as_str) == Some("BuyBox"))
        .or_else(|| {
            offers
                .iter()
                .find(|o| o.get("OfferType").and_then(Value::as_str) == Some("Lowest"))
        })
        .or_else(|| offers.first());

    let Some(offer) = selected else {
        return OfferResult::OutOfStock;
    };

    let price = offer.pointer("/BuyingPrice/ListingPrice/Amount").and_then(Value::as_f64);
    let shipping = offer
        .pointer("/BuyingPrice/Shipping/Amount")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let is_fba = offer
        .get("IsFulfilledByAmazon")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    match price {
        // FBA with free shipping stands in for the 72-hour rule here
        Some(price) if shipping == 0.0 && is_fba => OfferResult::Success {
            price: price.round() as i64,
            is_prime: true,
            is_fba,
        },
        Some(_) => OfferResult::FilteredOut,
        None => OfferResult::OutOfStock,
    }
}

// =========================================================================
// Catalog parsing
// =========================================================================

fn build_product_info(asin: &str, item: &Value) -> ProductInfo {
    let mut info = ProductInfo {
        asin: asin.to_string(),
        ..Default::default()
    };

    // Title and brand come from the marketplace summary
    if let Some(summaries) = item.get("summaries").and_then(Value::as_array) {
        let summary = summaries
            .iter()
            .find(|s| s.get("marketplaceId").and_then(Value::as_str) == Some(MARKETPLACE_ID_JP))
            .or_else(|| summaries.first());
        if let Some(summary) = summary {
            info.title_ja = summary
                .get("itemName")
                .and_then(Value::as_str)
                .map(str::to_string);
            info.brand = summary
                .get("brandName")
                .or_else(|| summary.get("brand"))
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }

    // Bullet points formatted into a plain-text description
    if let Some(points) = item.pointer("/attributes/bullet_point").and_then(Value::as_array) {
        for point in points {
            let text = point
                .get("value")
                .and_then(Value::as_str)
                .or_else(|| point.as_str())
                .unwrap_or("");
            if !text.is_empty() {
                info.bullet_points.push(text.to_string());
            }
        }
    }
    if !info.bullet_points.is_empty() {
        info.description_ja = Some(format_bullet_description(&info.bullet_points));
    } else {
        info.description_ja = info.title_ja.clone();
    }

    info.category = category_from_sales_ranks(item)
        .or_else(|| category_from_browse_nodes(item));

    info.images = collect_marketplace_images(item);

    info
}

/// Bullet points rendered one per block, long sentences split at the
/// Japanese full stop.
fn format_bullet_description(bullet_points: &[String]) -> String {
    let mut out = String::new();
    for point in bullet_points {
        let formatted = point.replace("。 ", "。\n").replace('。', "。\n");
        let formatted = formatted.trim_end_matches('\n');
        out.push_str(&format!("■ {formatted}\n\n"));
    }
    out.trim_end_matches('\n').to_string()
}

fn category_from_sales_ranks(item: &Value) -> Option<String> {
    let groups = item.get("salesRanks").and_then(Value::as_array)?;
    let jp = groups
        .iter()
        .find(|g| g.get("marketplaceId").and_then(Value::as_str) == Some(MARKETPLACE_ID_JP))?;
    let ranks = jp.get("ranks").and_then(Value::as_array)?;
    let titles: Vec<&str> = ranks
        .iter()
        .filter_map(|r| r.get("title").and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .collect();
    if titles.is_empty() {
        None
    } else {
        Some(titles.join(" > "))
    }
}

fn category_from_browse_nodes(item: &Value) -> Option<String> {
    let nodes = item
        .pointer("/browseNodeInfo/browseNodes")
        .and_then(Value::as_array)?;
    let node = nodes.first()?;

    let mut names: Vec<String> = Vec::new();
    if let Some(ancestors) = node.get("ancestor").and_then(Value::as_array) {
        for ancestor in ancestors {
            if let Some(name) = ancestor.get("displayName").and_then(Value::as_str) {
                names.push(name.to_string());
            }
        }
    }
    if let Some(name) = node.get("displayName").and_then(Value::as_str) {
        names.push(name.to_string());
    }

    if names.is_empty() {
        None
    } else {
        Some(names.join(" > "))
    }
}

/// For the JP marketplace image set: keep the largest rendition per
/// variant (MAIN, PT01, ...), MAIN first, then strip size duplicates of
/// the same image id.
fn collect_marketplace_images(item: &Value) -> Vec<String> {
    let Some(groups) = item.get("images").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(jp) = groups
        .iter()
        .find(|g| g.get("marketplaceId").and_then(Value::as_str) == Some(MARKETPLACE_ID_JP))
    else {
        return Vec::new();
    };
    let Some(images) = jp.get("images").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut by_variant: HashMap<String, (String, i64)> = HashMap::new();
    for image in images {
        let variant = image
            .get("variant")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();
        let Some(link) = image.get("link").and_then(Value::as_str) else {
            continue;
        };
        let area = image.get("height").and_then(Value::as_i64).unwrap_or(0)
            * image.get("width").and_then(Value::as_i64).unwrap_or(0);

        let larger = by_variant
            .get(&variant)
            .map_or(true, |(_, best)| area > *best);
        if larger {
            by_variant.insert(variant, (link.to_string(), area));
        }
    }

    let mut variants: Vec<String> = by_variant.keys().cloned().collect();
    variants.sort_by_key(|v| if v == "MAIN" { "0".to_string() } else { v.replace("PT", "1") });

    let urls: Vec<String> = variants
        .into_iter()
        .filter_map(|v| by_variant.get(&v).map(|(url, _)| url.clone()))
        .collect();
    deduplicate_image_urls(&urls)
}

/// Drop size renditions of the same image id, keeping the largest.
///
/// Amazon image URLs look like
/// `https://m.media-amazon.com/images/I/81abc123._AC_SL1500_.jpg`; the id
/// is the segment after `/images/I/`, the size the number after
/// `SL`/`UL`/`SR`.
pub fn deduplicate_image_urls(urls: &[String]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, (String, u32)> = HashMap::new();

    for url in urls {
        let key = image_id(url).unwrap_or_else(|| url.clone());
        let size = image_size(url);

        match best.get(&key).map(|(_, existing)| *existing) {
            None => {
                order.push(key.clone());
                best.insert(key, (url.clone(), size));
            }
            Some(existing) if size > existing => {
                best.insert(key, (url.clone(), size));
            }
            Some(_) => {}
        }
    }

    order
        .into_iter()
        .filter_map(|k| best.get(&k).map(|(url, _)| url.clone()))
        .collect()
}

fn image_id(url: &str) -> Option<String> {
    let start = url.find("/images/I/")? + "/images/I/".len();
    let rest = &url[start..];
    let end = rest.find('.')?;
    Some(rest[..end].to_string())
}

fn image_size(url: &str) -> u32 {
    for marker in ["SL", "UL", "SR"] {
        let mut search = url;
        while let Some(pos) = search.find(marker) {
            let digits: String = search[pos + marker.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !digits.is_empty() {
                if let Ok(size) = digits.parse() {
                    return size;
                }
            }
            search = &search[pos + marker.len()..];
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(
        condition: &str,
        shipping: f64,
        max_hours: Option<i64>,
        availability: Option<&str>,
        prime: bool,
        fba: bool,
        price: f64,
    ) -> Offer {
        Offer {
            sub_condition: condition.to_string(),
            shipping: Some(Money {
                amount: Some(shipping),
            }),
            shipping_time: Some(ShippingTime {
                availability_type: availability.map(str::to_string),
                maximum_hours: max_hours,
            }),
            listing_price: Some(Money {
                amount: Some(price),
            }),
            prime_information: Some(PrimeInformation { is_prime: prime }),
            is_fulfilled_by_amazon: fba,
            is_buy_box_winner: false,
        }
    }

    #[test]
    fn scoring_picks_the_immediate_prime_fba_offer() {
        // A: NOW, 24h, Prime, FBA, 1200 -> 1000+48+100+50 = 1198
        // B: 48h, Prime, FBA, 1100 -> 24+100+50 = 174
        // C: paid shipping -> filtered
        let offers = vec![
            offer("New", 0.0, Some(24), Some("NOW"), true, true, 1200.0),
            offer("New", 0.0, Some(48), None, true, true, 1100.0),
            offer("New", 500.0, Some(24), None, false, false, 1000.0),
        ];
        let result = select_best_offer("B01TEST001", &offers, false);
        assert_eq!(
            result,
            OfferResult::Success {
                price: 1200,
                is_prime: true,
                is_fba: true,
            }
        );
    }

    #[test]
    fn invitation_only_offers_are_never_selected() {
        let offers = vec![offer("New", 0.0, Some(999), None, true, true, 500.0)];
        let result = select_best_offer("B01TEST002", &offers, false);
        assert_eq!(result, OfferResult::FilteredOut);
    }

    #[test]
    fn missing_maximum_hours_counts_as_invitation_only() {
        let offers = vec![offer("New", 0.0, None, None, true, true, 500.0)];
        assert_eq!(
            select_best_offer("B01TESTXX", &offers, false),
            OfferResult::FilteredOut
        );
    }

    #[test]
    fn no_offers_means_out_of_stock() {
        assert_eq!(select_best_offer("B01", &[], false), OfferResult::OutOfStock);
    }

    #[test]
    fn slow_delivery_and_used_condition_are_filtered() {
        let offers = vec![
            offer("Used", 0.0, Some(24), None, false, false, 800.0),
            offer("New", 0.0, Some(96), None, false, false, 900.0),
        ];
        assert_eq!(
            select_best_offer("B01", &offers, false),
            OfferResult::FilteredOut
        );
    }

    #[test]
    fn ties_break_by_lowest_price() {
        let offers = vec![
            offer("New", 0.0, Some(48), None, false, false, 1500.0),
            offer("New", 0.0, Some(48), None, false, false, 1400.0),
        ];
        assert_eq!(
            select_best_offer("B01", &offers, false),
            OfferResult::Success {
                price: 1400,
                is_prime: false,
                is_fba: false,
            }
        );
    }

    #[test]
    fn image_dedup_keeps_the_largest_size_per_id() {
        let urls = vec![
            "https://m.media-amazon.com/images/I/81abc._AC_SL1000_.jpg".to_string(),
            "https://m.media-amazon.com/images/I/81abc._AC_SL1500_.jpg".to_string(),
            "https://m.media-amazon.com/images/I/99xyz._AC_SL500_.jpg".to_string(),
        ];
        let deduped = deduplicate_image_urls(&urls);
        assert_eq!(deduped.len(), 2);
        assert!(deduped[0].contains("SL1500"));
        assert!(deduped[1].contains("99xyz"));
    }

    #[test]
    fn image_dedup_preserves_unmatched_urls() {
        let urls = vec![
            "https://example.com/a.jpg".to_string(),
            "https://example.com/b.jpg".to_string(),
        ];
        assert_eq!(deduplicate_image_urls(&urls).len(), 2);
    }

    #[test]
    fn bullet_description_formats_blocks() {
        let points = vec!["第一。第二。".to_string(), "シンプル".to_string()];
        let desc = format_bullet_description(&points);
        assert!(desc.starts_with("■ "));
        assert!(desc.contains("第一。\n"));
        assert!(desc.contains("■ シンプル"));
    }

    #[test]
    fn category_joins_sales_rank_titles() {
        let item = json!({
            "salesRanks": [{
                "marketplaceId": MARKETPLACE_ID_JP,
                "ranks": [
                    {"title": "DIY・工具・ガーデン"},
                    {"title": "ガーデン噴霧器"}
                ]
            }]
        });
        assert_eq!(
            category_from_sales_ranks(&item).as_deref(),
            Some("DIY・工具・ガーデン > ガーデン噴霧器")
        );
    }

    #[test]
    fn category_falls_back_to_browse_nodes() {
        let item = json!({
            "salesRanks": [],
            "browseNodeInfo": {
                "browseNodes": [{
                    "displayName": "Leaf",
                    "ancestor": [{"displayName": "Root"}]
                }]
            }
        });
        assert_eq!(category_from_sales_ranks(&item), None);
        assert_eq!(
            category_from_browse_nodes(&item).as_deref(),
            Some("Root > Leaf")
        );
    }
}
