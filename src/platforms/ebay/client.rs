//! eBay Inventory API client.
//!
//! Listing is a two-step state machine: the inventory item carries the
//! product, the offer carries price and policies. Publishing an offer
//! yields the listing id; a sold-through offer drops back to UNPUBLISHED
//! and is re-published by the relist flow.

use crate::platforms::ebay::auth::EbayTokenManager;
use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const MARKETPLACE_US: &str = "EBAY_US";
pub const DEFAULT_MERCHANT_LOCATION: &str = "JP_LOCATION";
pub const MAX_LISTING_IMAGES: usize = 12;
const TITLE_MAX_CHARS: usize = 80;

/// Offer fields eBay rejects on PUT (error 25004 when included).
const READ_ONLY_OFFER_FIELDS: &[&str] = &["availableQuantity", "offerId", "listing", "status"];

pub struct EbayApiClient {
    client: Client,
    base_url: String,
    account_id: String,
    token_manager: EbayTokenManager,
}

impl EbayApiClient {
    pub fn new(account_id: &str, base_url: &str, token_manager: EbayTokenManager) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
            account_id: account_id.to_string(),
            token_manager,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.token_manager.valid_token().await?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header("Content-Language", "en-US")
            .header("X-EBAY-C-MARKETPLACE-ID", MARKETPLACE_US))
    }

    // -----------------------------------------------------------------
    // Inventory items
    // -----------------------------------------------------------------

    pub async fn create_or_update_inventory_item(&self, sku: &str, item: &Value) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/sell/inventory/v1/inventory_item/{sku}"))
            .await?
            .json(item)
            .send()
            .await
            .context("inventory item PUT")?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        error!(
            "[eBay/{}] inventory item PUT failed: sku={sku} status={status} {body}",
            self.account_id
        );
        bail!("inventory item PUT failed: {status} - {body}");
    }

    pub async fn get_inventory_item(&self, sku: &str) -> Result<Option<Value>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/sell/inventory/v1/inventory_item/{sku}"))
            .await?
            .send()
            .await
            .context("inventory item GET")?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await.context("parse inventory item")?)),
            StatusCode::NOT_FOUND => {
                debug!("[eBay/{}] inventory item not found: {sku}", self.account_id);
                Ok(None)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "[eBay/{}] inventory item GET failed: sku={sku} status={status} {body}",
                    self.account_id
                );
                Ok(None)
            }
        }
    }

    pub async fn delete_inventory_item(&self, sku: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/sell/inventory/v1/inventory_item/{sku}"),
            )
            .await?
            .send()
            .await
            .context("inventory item DELETE")?;
        Ok(response.status().is_success())
    }

    pub async fn list_inventory_items(&self, max_items: Option<usize>) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        let limit = 100usize;
        let mut offset = 0usize;

        loop {
            let response = self
                .request(reqwest::Method::GET, "/sell/inventory/v1/inventory_item")
                .await?
                .query(&[("limit", limit.to_string()), ("offset", offset.to_string())])
                .send()
                .await
                .context("inventory items list")?;

            if !response.status().is_success() {
                break;
            }
            let body: Value = response.json().await.context("parse inventory items")?;
            let items = body
                .get("inventoryItems")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if items.is_empty() {
                break;
            }
            let got = items.len();
            all.extend(items);

            if let Some(max) = max_items {
                if all.len() >= max {
                    all.truncate(max);
                    break;
                }
            }
            if got < limit {
                break;
            }
            offset += limit;
        }
        Ok(all)
    }

    pub async fn update_inventory_quantity(&self, sku: &str, quantity: i64) -> Result<()> {
        let Some(mut item) = self.get_inventory_item(sku).await? else {
            bail!("inventory item not found: {sku}");
        };
        if let Some(q) = item.pointer_mut("/availability/shipToLocationAvailability/quantity") {
            *q = json!(quantity);
        } else {
            item["availability"] = json!({
                "shipToLocationAvailability": { "quantity": quantity }
            });
        }
        self.create_or_update_inventory_item(sku, &item).await
    }

    // -----------------------------------------------------------------
    // Offers
    // -----------------------------------------------------------------

    pub async fn create_offer(
        &self,
        sku: &str,
        price_usd: f64,
        category_id: &str,
        policies: &OfferPolicies,
        quantity: i64,
        merchant_location_key: &str,
    ) -> Result<String> {
        let offer = json!({
            "sku": sku,
            "marketplaceId": MARKETPLACE_US,
            "format": "FIXED_PRICE",
            "availableQuantity": quantity,
            "categoryId": category_id,
            "merchantLocationKey": merchant_location_key,
            "listingPolicies": {
                "paymentPolicyId": policies.payment,
                "returnPolicyId": policies.return_policy,
                "fulfillmentPolicyId": policies.fulfillment,
            },
            "pricingSummary": {
                "price": {
                    "value": format!("{:.2}", price_usd),
                    "currency": "USD",
                }
            },
            "listingDuration": "GTC",
        });

        let response = self
            .request(reqwest::Method::POST, "/sell/inventory/v1/offer")
            .await?
            .json(&offer)
            .send()
            .await
            .context("offer POST")?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!("offer create failed: {status} - {body}");
        }
        body.get("offerId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("offerId missing from create response")
    }

    pub async fn publish_offer(&self, offer_id: &str) -> Result<String> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sell/inventory/v1/offer/{offer_id}/publish"),
            )
            .await?
            .send()
            .await
            .context("offer publish")?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!("offer publish failed: {status} - {body}");
        }
        body.get("listingId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("listingId missing from publish response")
    }

    pub async fn get_offer(&self, offer_id: &str) -> Result<Option<Value>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/sell/inventory/v1/offer/{offer_id}"))
            .await?
            .send()
            .await
            .context("offer GET")?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await.context("parse offer")?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "[eBay/{}] offer GET failed: {offer_id} status={status} {body}",
                    self.account_id
                );
                Ok(None)
            }
        }
    }

    pub async fn get_offers_by_sku(&self, sku: &str) -> Result<Vec<Value>> {
        let response = self
            .request(reqwest::Method::GET, "/sell/inventory/v1/offer")
            .await?
            .query(&[("sku", sku), ("limit", "10")])
            .send()
            .await
            .context("offers by sku")?;

        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        let body: Value = response.json().await.context("parse offers")?;
        Ok(body
            .get("offers")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn delete_offer(&self, offer_id: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/sell/inventory/v1/offer/{offer_id}"))
            .await?
            .send()
            .await
            .context("offer DELETE")?;
        Ok(response.status().is_success())
    }

    async fn put_offer(&self, offer_id: &str, offer: &Value) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/sell/inventory/v1/offer/{offer_id}"))
            .await?
            .json(offer)
            .send()
            .await
            .context("offer PUT")?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        error!(
            "[eBay/{}] offer PUT failed: {offer_id} status={status} {body}",
            self.account_id
        );
        bail!("offer PUT failed: {status} - {body}");
    }

    /// Update the price of an offer.
    ///
    /// eBay rejects a price update on a PUBLISHED offer whose inventory
    /// quantity is 0, so the quantity is lifted to 1 first in that case.
    pub async fn update_offer_price(&self, offer_id: &str, new_price_usd: f64) -> Result<()> {
        let Some(offer) = self.get_offer(offer_id).await? else {
            bail!("offer not found: {offer_id}");
        };

        let offer_status = offer.get("status").and_then(Value::as_str).unwrap_or("");
        let offer_quantity = offer
            .get("availableQuantity")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let sku = offer.get("sku").and_then(Value::as_str).unwrap_or("");

        if offer_status == "PUBLISHED" && offer_quantity == 0 && !sku.is_empty() {
            let stored_quantity = self
                .get_inventory_item(sku)
                .await?
                .and_then(|item| {
                    item.pointer("/availability/shipToLocationAvailability/quantity")
                        .and_then(Value::as_i64)
                })
                .unwrap_or(0);
            if stored_quantity == 0 {
                info!(
                    "[eBay/{}] lifting inventory quantity to 1 before price update: {sku}",
                    self.account_id
                );
                self.update_inventory_quantity(sku, 1)
                    .await
                    .context("lift quantity before price update")?;
            }
        }

        let mut update = strip_read_only_fields(&offer);
        update["pricingSummary"]["price"]["value"] = json!(format!("{:.2}", new_price_usd));
        self.put_offer(offer_id, &update).await
    }

    /// Re-publish an UNPUBLISHED offer, ensuring it carries a merchant
    /// location key first. Returns the new listing id; a PUBLISHED offer
    /// short-circuits to its existing listing id.
    pub async fn relist_offer(
        &self,
        offer_id: &str,
        merchant_location_key: &str,
    ) -> Result<Option<String>> {
        let Some(offer) = self.get_offer(offer_id).await? else {
            warn!("[eBay/{}] relist: offer not found {offer_id}", self.account_id);
            return Ok(None);
        };

        let status = offer.get("status").and_then(Value::as_str).unwrap_or("");
        if status == "PUBLISHED" {
            return Ok(offer
                .pointer("/listing/listingId")
                .and_then(Value::as_str)
                .map(str::to_string));
        }
        if status != "UNPUBLISHED" {
            warn!(
                "[eBay/{}] relist: offer {offer_id} in unexpected state {status}",
                self.account_id
            );
            return Ok(None);
        }

        if offer
            .get("merchantLocationKey")
            .and_then(Value::as_str)
            .unwrap_or("")
            .is_empty()
        {
            info!(
                "[eBay/{}] relist: setting merchantLocationKey on {offer_id}",
                self.account_id
            );
            let mut update = strip_read_only_fields(&offer);
            update["merchantLocationKey"] = json!(merchant_location_key);
            self.put_offer(offer_id, &update).await?;
        }

        let listing_id = self.publish_offer(offer_id).await?;
        Ok(Some(listing_id))
    }

    // -----------------------------------------------------------------
    // Locations
    // -----------------------------------------------------------------

    pub async fn create_location(&self, location_key: &str, name: &str) -> Result<bool> {
        let location = json!({
            "location": {
                "address": {
                    "addressLine1": "Tokyo",
                    "city": "Tokyo",
                    "stateOrProvince": "Tokyo",
                    "postalCode": "155-0031",
                    "country": "JP",
                }
            },
            "locationInstructions": "Items ship from Japan",
            "name": name,
            "merchantLocationStatus": "ENABLED",
            "locationTypes": ["WAREHOUSE"],
        });

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/sell/inventory/v1/location/{location_key}"),
            )
            .await?
            .json(&location)
            .send()
            .await
            .context("location PUT")?;
        Ok(response.status().is_success())
    }
}

#[derive(Debug, Clone)]
pub struct OfferPolicies {
    pub payment: String,
    pub return_policy: String,
    pub fulfillment: String,
}

/// Drop the offer fields eBay refuses to accept back on a PUT.
pub fn strip_read_only_fields(offer: &Value) -> Value {
    let mut cleaned = offer.clone();
    if let Some(obj) = cleaned.as_object_mut() {
        for field in READ_ONLY_OFFER_FIELDS {
            obj.remove(*field);
        }
    }
    cleaned
}

/// Inventory item payload from canonical product data: English title
/// capped at 80 chars, at most 12 images, Japan-sourced aspects.
pub fn build_inventory_item(
    title_en: &str,
    description_en: Option<&str>,
    brand: Option<&str>,
    images: &[String],
    quantity: i64,
) -> Value {
    let title: String = title_en.chars().take(TITLE_MAX_CHARS).collect();
    let description = description_en
        .filter(|d| !d.is_empty())
        .unwrap_or(title.as_str());
    let images: Vec<&String> = images.iter().take(MAX_LISTING_IMAGES).collect();

    json!({
        "product": {
            "title": title,
            "description": description,
            "imageUrls": images,
            "aspects": {
                "Brand": [brand.unwrap_or("Unbranded")],
                "Condition": ["New"],
                "Country/Region of Manufacture": ["Japan"],
            }
        },
        "condition": "NEW",
        "conditionDescription": "Brand new, sealed",
        "availability": {
            "shipToLocationAvailability": { "quantity": quantity }
        },
        "packageWeightAndSize": {
            "dimensions": {
                "height": 10,
                "length": 20,
                "width": 15,
                "unit": "CENTIMETER",
            },
            "weight": {
                "value": 500,
                "unit": "GRAM",
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_read_only_offer_fields() {
        let offer = json!({
            "sku": "s-1",
            "availableQuantity": 0,
            "offerId": "O1",
            "listing": {"listingId": "L1"},
            "status": "PUBLISHED",
            "pricingSummary": {"price": {"value": "10.00", "currency": "USD"}},
        });
        let cleaned = strip_read_only_fields(&offer);
        assert!(cleaned.get("availableQuantity").is_none());
        assert!(cleaned.get("offerId").is_none());
        assert!(cleaned.get("listing").is_none());
        assert!(cleaned.get("status").is_none());
        assert!(cleaned.get("pricingSummary").is_some());
    }

    #[test]
    fn inventory_item_caps_title_and_images() {
        let long_title = "x".repeat(120);
        let images: Vec<String> = (0..20).map(|i| format!("https://img/{i}.jpg")).collect();
        let item = build_inventory_item(&long_title, None, Some("Tamiya"), &images, 1);

        let title = item.pointer("/product/title").and_then(Value::as_str).unwrap();
        assert_eq!(title.chars().count(), 80);
        let urls = item
            .pointer("/product/imageUrls")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(urls.len(), 12);
        assert_eq!(
            item.pointer("/product/aspects/Brand/0").and_then(Value::as_str),
            Some("Tamiya")
        );
    }
}
