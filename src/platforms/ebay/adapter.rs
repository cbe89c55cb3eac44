//! eBay implementation of the platform adapter contract.
//!
//! For this adapter `platform_item_id` arguments are the inventory SKU:
//! the Inventory API is keyed by SKU, while the published listing id is
//! kept on the listing row and in the metadata sidecar.

use crate::models::{ItemData, Listing, Platform, UploadResult, Visibility};
use crate::platforms::ebay::auth::{EbayAuthClient, EbayTokenManager, Environment};
use crate::platforms::ebay::category::CategoryMapper;
use crate::platforms::ebay::client::{
    build_inventory_item, EbayApiClient, OfferPolicies, DEFAULT_MERCHANT_LOCATION,
};
use crate::platforms::{AdapterContext, PlatformAdapter};
use crate::store::{EbayListingMetadata, MasterDb};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct EbayAdapter {
    client: EbayApiClient,
    category_mapper: CategoryMapper,
    db: MasterDb,
    policies: Option<OfferPolicies>,
    merchant_location_key: String,
}

impl EbayAdapter {
    pub fn new(ctx: &AdapterContext, account_id: &str) -> Result<Self> {
        let account = ctx
            .account_manager
            .get_account(account_id)
            .with_context(|| format!("unknown eBay account {account_id}"))?;

        let app_id = account
            .credential("app_id")
            .context("eBay credentials missing app_id")?;
        let cert_id = account
            .credential("cert_id")
            .context("eBay credentials missing cert_id")?;
        let redirect_uri = account.credential("redirect_uri").unwrap_or_default();
        let environment = match account.credential("environment").as_deref() {
            Some("sandbox") => Environment::Sandbox,
            _ => Environment::Production,
        };

        let auth = Arc::new(EbayAuthClient::new(
            &app_id,
            &cert_id,
            &redirect_uri,
            environment,
        ));
        let token_manager =
            EbayTokenManager::new(account_id, auth.clone(), ctx.account_manager.clone());
        let client = EbayApiClient::new(account_id, environment.api_base(), token_manager);

        let cache_dir = std::env::var("EBAY_CATEGORY_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/category_cache"));
        let category_mapper = CategoryMapper::new(auth, environment.api_base(), &cache_dir)?;

        let policies = match (
            account.credential("policy_payment_id"),
            account.credential("policy_return_id"),
            account.credential("policy_fulfillment_id"),
        ) {
            (Some(payment), Some(return_policy), Some(fulfillment)) => Some(OfferPolicies {
                payment,
                return_policy,
                fulfillment,
            }),
            _ => None,
        };

        let merchant_location_key = account
            .credential("merchant_location_key")
            .unwrap_or_else(|| DEFAULT_MERCHANT_LOCATION.to_string());

        Ok(Self {
            client,
            category_mapper,
            db: ctx.db.clone(),
            policies,
            merchant_location_key,
        })
    }

    async fn offer_id_for_sku(&self, sku: &str) -> Result<Option<String>> {
        if let Some(metadata) = self.db.get_ebay_metadata(sku).await? {
            if let Some(offer_id) = metadata.offer_id {
                return Ok(Some(offer_id));
            }
        }
        let offers = self.client.get_offers_by_sku(sku).await?;
        Ok(offers
            .first()
            .and_then(|o| o.get("offerId"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[async_trait]
impl PlatformAdapter for EbayAdapter {
    fn platform(&self) -> Platform {
        Platform::Ebay
    }

    async fn upload_item(&self, item: &ItemData) -> UploadResult {
        let Some(policies) = self.policies.clone() else {
            return UploadResult::failed_with_code(
                "missing_policies",
                "account credentials lack payment/return/fulfillment policy ids",
            );
        };

        let title = item.title.clone().unwrap_or_default();
        let inventory_item = build_inventory_item(
            &title,
            item.description.as_deref(),
            item.brand.as_deref(),
            &item.images,
            item.stock.max(1),
        );

        if let Err(e) = self
            .client
            .create_or_update_inventory_item(&item.sku, &inventory_item)
            .await
        {
            return UploadResult::failed(format!("{e:#}"));
        }

        let category = self.category_mapper.recommended_category(&title, None).await;
        let price = item.price.unwrap_or(0.0);

        let offer_id = match self
            .client
            .create_offer(
                &item.sku,
                price,
                &category.category_id,
                &policies,
                item.stock.max(1),
                &self.merchant_location_key,
            )
            .await
        {
            Ok(offer_id) => offer_id,
            Err(e) => return UploadResult::failed(format!("{e:#}")),
        };

        let listing_id = match self.client.publish_offer(&offer_id).await {
            Ok(listing_id) => listing_id,
            Err(e) => return UploadResult::failed(format!("offer created but publish failed: {e:#}")),
        };

        let metadata = EbayListingMetadata {
            sku: item.sku.clone(),
            listing_id: Some(listing_id.clone()),
            offer_id: Some(offer_id),
            category_id: Some(category.category_id),
            policy_payment_id: Some(policies.payment),
            policy_return_id: Some(policies.return_policy),
            policy_fulfillment_id: Some(policies.fulfillment),
            item_specifics: None,
            merchant_location_key: self.merchant_location_key.clone(),
        };
        if let Err(e) = self.db.save_ebay_metadata(&metadata).await {
            warn!("eBay metadata save failed for {}: {e:#}", item.sku);
        }

        info!("eBay listing published: {} -> {}", item.asin, listing_id);
        UploadResult::success(listing_id)
    }

    async fn update_item(
        &self,
        platform_item_id: &str,
        updates: &[(String, String)],
    ) -> UploadResult {
        // platform_item_id is the SKU here
        let item = match self.client.get_inventory_item(platform_item_id).await {
            Ok(Some(item)) => item,
            Ok(None) => return UploadResult::failed("inventory item not found"),
            Err(e) => return UploadResult::failed(format!("{e:#}")),
        };

        let mut updated = item;
        for (key, value) in updates {
            match key.as_str() {
                "title" => updated["product"]["title"] = Value::String(value.clone()),
                "description" => updated["product"]["description"] = Value::String(value.clone()),
                other => {
                    warn!("unsupported eBay item update field: {other}");
                }
            }
        }

        match self
            .client
            .create_or_update_inventory_item(platform_item_id, &updated)
            .await
        {
            Ok(()) => UploadResult::ok(),
            Err(e) => UploadResult::failed(format!("{e:#}")),
        }
    }

    async fn delete_item(&self, platform_item_id: &str) -> UploadResult {
        match self.client.delete_inventory_item(platform_item_id).await {
            Ok(true) => UploadResult::ok(),
            Ok(false) => UploadResult::failed("inventory item delete rejected"),
            Err(e) => UploadResult::failed(format!("{e:#}")),
        }
    }

    async fn update_price(&self, listing: &Listing, new_price: f64) -> UploadResult {
        let Some(sku) = listing.sku.as_deref() else {
            return UploadResult::failed("listing has no sku");
        };
        let offer_id = match self.offer_id_for_sku(sku).await {
            Ok(Some(offer_id)) => offer_id,
            Ok(None) => return UploadResult::failed("no offer found for sku"),
            Err(e) => return UploadResult::failed(format!("{e:#}")),
        };
        match self.client.update_offer_price(&offer_id, new_price).await {
            Ok(()) => UploadResult::ok(),
            Err(e) => UploadResult::failed(format!("{e:#}")),
        }
    }

    async fn update_quantity(&self, listing: &Listing, quantity: i64) -> UploadResult {
        let Some(sku) = listing.sku.as_deref() else {
            return UploadResult::failed("listing has no sku");
        };
        match self.client.update_inventory_quantity(sku, quantity).await {
            Ok(()) => UploadResult::ok(),
            Err(e) => UploadResult::failed(format!("{e:#}")),
        }
    }

    /// eBay has no visibility flag: hidden maps to quantity 0, public
    /// restores quantity 1 and relists the offer if it dropped to
    /// UNPUBLISHED.
    async fn update_visibility(&self, listing: &Listing, visibility: Visibility) -> UploadResult {
        let Some(sku) = listing.sku.as_deref() else {
            return UploadResult::failed("listing has no sku");
        };

        match visibility {
            Visibility::Hidden => match self.client.update_inventory_quantity(sku, 0).await {
                Ok(()) => UploadResult::ok(),
                Err(e) => UploadResult::failed(format!("{e:#}")),
            },
            Visibility::Public => {
                if let Err(e) = self.client.update_inventory_quantity(sku, 1).await {
                    return UploadResult::failed(format!("{e:#}"));
                }
                match self.offer_id_for_sku(sku).await {
                    Ok(Some(offer_id)) => {
                        match self
                            .client
                            .relist_offer(&offer_id, &self.merchant_location_key)
                            .await
                        {
                            Ok(Some(listing_id)) => UploadResult::success(listing_id),
                            Ok(None) => UploadResult::ok(),
                            Err(e) => UploadResult::failed(format!("{e:#}")),
                        }
                    }
                    Ok(None) => UploadResult::ok(),
                    Err(e) => UploadResult::failed(format!("{e:#}")),
                }
            }
        }
    }

    async fn list_items(&self, max_items: Option<usize>) -> Result<Vec<Value>> {
        self.client.list_inventory_items(max_items).await
    }

    async fn get_item(&self, platform_item_id: &str) -> Result<Option<Value>> {
        self.client.get_inventory_item(platform_item_id).await
    }

    fn validate_item(&self, item: &ItemData) -> std::result::Result<(), String> {
        if item.title.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err("title is missing".to_string());
        }
        match item.price {
            Some(p) if p > 0.0 => {}
            _ => return Err("price must be positive".to_string()),
        }
        if item.sku.trim().is_empty() {
            return Err("sku is missing".to_string());
        }
        Ok(())
    }

    async fn check_duplicate(&self, _asin: &str, sku: &str) -> Result<bool> {
        if self.client.get_inventory_item(sku).await?.is_some() {
            return Ok(true);
        }
        Ok(!self.client.get_offers_by_sku(sku).await?.is_empty())
    }

    /// Images travel inside the inventory item payload; nothing to push
    /// separately.
    async fn upload_images(&self, platform_item_id: &str, _images: &[String]) -> UploadResult {
        UploadResult {
            status: crate::models::UploadStatus::Success,
            platform_item_id: Some(platform_item_id.to_string()),
            error_code: None,
            message: Some("images are part of the inventory item".to_string()),
        }
    }
}
