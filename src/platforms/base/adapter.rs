//! BASE implementation of the platform adapter contract.

use crate::models::{ItemData, Listing, Platform, UploadResult, Visibility};
use crate::platforms::base::client::{BaseApiClient, MAX_ITEM_IMAGES};
use crate::platforms::{AdapterContext, PlatformAdapter};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

pub struct BaseAdapter {
    client: BaseApiClient,
}

impl BaseAdapter {
    pub fn new(ctx: &AdapterContext, account_id: &str) -> Result<Self> {
        let client = BaseApiClient::new(
            account_id,
            ctx.account_manager.clone(),
            ctx.limiter.clone(),
            None,
        )?;
        Ok(Self { client })
    }

    fn failure(&self, err: anyhow::Error) -> UploadResult {
        let message = format!("{err:#}");
        // BASE error bodies surface as "{code}: {description}"
        match message.split_once(": ") {
            Some((code, _)) if !code.contains(' ') => {
                let code = code.to_string();
                UploadResult::failed_with_code(code, message)
            }
            _ => UploadResult::failed(message),
        }
    }
}

fn item_id_from_response(response: &Value) -> Option<String> {
    let id = response.pointer("/item/item_id")?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl PlatformAdapter for BaseAdapter {
    fn platform(&self) -> Platform {
        Platform::Base
    }

    async fn upload_item(&self, item: &ItemData) -> UploadResult {
        let price = item.price.unwrap_or(0.0).round() as i64;
        let form = vec![
            ("title".to_string(), item.title.clone().unwrap_or_default()),
            ("price".to_string(), price.to_string()),
            ("stock".to_string(), item.stock.max(1).to_string()),
            (
                "detail".to_string(),
                item.description.clone().unwrap_or_default(),
            ),
            ("visible".to_string(), "1".to_string()),
            ("identifier".to_string(), item.sku.clone()),
        ];

        match self.client.create_item(&form).await {
            Ok(response) => match item_id_from_response(&response) {
                Some(item_id) => {
                    info!("BASE item created: {} -> {}", item.asin, item_id);
                    UploadResult::success(item_id)
                }
                None => UploadResult::failed("item_id missing from BASE response"),
            },
            Err(e) => self.failure(e),
        }
    }

    async fn update_item(
        &self,
        platform_item_id: &str,
        updates: &[(String, String)],
    ) -> UploadResult {
        match self.client.update_item(platform_item_id, updates).await {
            Ok(_) => UploadResult::ok(),
            Err(e) => self.failure(e),
        }
    }

    async fn delete_item(&self, platform_item_id: &str) -> UploadResult {
        match self.client.delete_item(platform_item_id).await {
            Ok(_) => UploadResult::ok(),
            Err(e) => self.failure(e),
        }
    }

    async fn update_price(&self, listing: &Listing, new_price: f64) -> UploadResult {
        let Some(item_id) = listing.platform_item_id.as_deref() else {
            return UploadResult::failed("listing has no platform_item_id");
        };
        let price = new_price.round() as i64;
        self.update_item(item_id, &[("price".to_string(), price.to_string())])
            .await
    }

    async fn update_quantity(&self, listing: &Listing, quantity: i64) -> UploadResult {
        let Some(item_id) = listing.platform_item_id.as_deref() else {
            return UploadResult::failed("listing has no platform_item_id");
        };
        self.update_item(item_id, &[("stock".to_string(), quantity.to_string())])
            .await
    }

    async fn update_visibility(&self, listing: &Listing, visibility: Visibility) -> UploadResult {
        let Some(item_id) = listing.platform_item_id.as_deref() else {
            return UploadResult::failed("listing has no platform_item_id");
        };
        let visible = match visibility {
            Visibility::Public => "1",
            Visibility::Hidden => "0",
        };
        self.update_item(item_id, &[("visible".to_string(), visible.to_string())])
            .await
    }

    async fn list_items(&self, max_items: Option<usize>) -> Result<Vec<Value>> {
        self.client.get_all_items(max_items).await
    }

    async fn get_item(&self, platform_item_id: &str) -> Result<Option<Value>> {
        match self.client.get_item(platform_item_id).await {
            Ok(item) => Ok(Some(item)),
            Err(e) => {
                warn!("BASE get_item failed for {platform_item_id}: {e:#}");
                Ok(None)
            }
        }
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

    /// Scan the shop's items for an identifier that already carries this
    /// SKU or ASIN.
    async fn check_duplicate(&self, asin: &str, sku: &str) -> Result<bool> {
        let items = self.client.get_all_items(Some(1000)).await?;
        for item in items {
            let identifier = item
                .get("identifier")
                .and_then(Value::as_str)
                .unwrap_or("");
            if identifier.is_empty() {
                continue;
            }
            if identifier == sku || identifier.contains(asin) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Push images one by one through `items/add_image` (capped at 20);
    /// partial failures degrade to a count, never to an error.
    async fn upload_images(&self, platform_item_id: &str, images: &[String]) -> UploadResult {
        let mut uploaded = 0usize;
        let mut failed = 0usize;

        for (idx, image_url) in images.iter().take(MAX_ITEM_IMAGES).enumerate() {
            if image_url.is_empty() {
                continue;
            }
            match self
                .client
                .add_image_from_url(platform_item_id, idx + 1, image_url)
                .await
            {
                Ok(_) => uploaded += 1,
                Err(e) => {
                    warn!(
                        "image {} upload failed for {}: {:#}",
                        idx + 1,
                        platform_item_id,
                        e
                    );
                    failed += 1;
                }
            }
        }

        UploadResult {
            status: crate::models::UploadStatus::Success,
            platform_item_id: Some(platform_item_id.to_string()),
            error_code: None,
            message: Some(format!("{uploaded} images uploaded, {failed} failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_id_parses_number_and_string() {
        assert_eq!(
            item_id_from_response(&json!({"item": {"item_id": 77777}})).as_deref(),
            Some("77777")
        );
        assert_eq!(
            item_id_from_response(&json!({"item": {"item_id": "abc"}})).as_deref(),
            Some("abc")
        );
        assert!(item_id_from_response(&json!({"ok": true})).is_none());
    }
}
