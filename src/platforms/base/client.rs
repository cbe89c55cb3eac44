//! BASE REST client.
//!
//! Form-encoded calls against `api.thebase.in/1` with a bearer token that
//! auto-refreshes per account, the owner-resolved proxy on every request,
//! and explicit handling for the platform's `hour_api_limit` responses.
//!
//! The update path relies on BASE's documented partial-update guarantee:
//! an `items/edit` carrying only `identifier` leaves images and every
//! other field untouched.

use crate::accounts::AccountManager;
use crate::amazon::{EndpointClass, RateLimiter};
use crate::platforms::base::auth::token_with_auto_refresh;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

pub const BASE_URL: &str = "https://api.thebase.in/1";
pub const MAX_ITEM_IMAGES: usize = 20;

pub const ERROR_HOUR_API_LIMIT: &str = "hour_api_limit";

pub struct BaseApiClient {
    client: Client,
    account_id: String,
    account_manager: Arc<AccountManager>,
    limiter: Arc<RateLimiter>,
}

impl BaseApiClient {
    /// Build for one account. The proxy is resolved explicit → account →
    /// owner → direct and baked into the HTTP client.
    pub fn new(
        account_id: &str,
        account_manager: Arc<AccountManager>,
        limiter: Arc<RateLimiter>,
        explicit_proxy: Option<&str>,
    ) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = account_manager.proxy_for_account(account_id, explicit_proxy) {
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("build BASE http client")?;

        Ok(Self {
            client,
            account_id: account_id.to_string(),
            account_manager,
            limiter,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn bearer(&self) -> Result<String> {
        let token = token_with_auto_refresh(&self.account_manager, &self.account_id).await?;
        Ok(token.access_token)
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<Value> {
        if !self.limiter.wait(EndpointClass::BaseWrite).await {
            bail!("interrupted");
        }
        let token = self.bearer().await?;
        let response = self
            .client
            .post(format!("{BASE_URL}{path}"))
            .bearer_auth(token)
            .form(form)
            .send()
            .await
            .with_context(|| format!("BASE POST {path}"))?;
        self.handle_response(path, response).await
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{BASE_URL}{path}"))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("BASE GET {path}"))?;
        self.handle_response(path, response).await
    }

    async fn handle_response(&self, path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            return serde_json::from_str(&body)
                .with_context(|| format!("parse BASE response for {path}"));
        }

        let (error_type, description) = parse_error_body(&body);

        if error_type.as_deref() == Some(ERROR_HOUR_API_LIMIT) {
            warn!(
                account = self.account_id.as_str(),
                "BASE hourly rate limit reached on {path}: {description}; resets within the hour"
            );
        }
        error!(
            account = self.account_id.as_str(),
            "BASE request failed: {path} status={status} error={:?} {description}", error_type
        );

        match error_type {
            Some(code) => Err(anyhow!("{code}: {description}")),
            None => Err(anyhow!("status {status}: {description}")),
        }
    }

    // -----------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------

    pub async fn create_item(&self, form: &[(String, String)]) -> Result<Value> {
        self.post_form("/items/add", form).await
    }

    pub async fn update_item(&self, item_id: &str, updates: &[(String, String)]) -> Result<Value> {
        let mut form = vec![("item_id".to_string(), item_id.to_string())];
        form.extend_from_slice(updates);
        self.post_form("/items/edit", &form).await
    }

    pub async fn delete_item(&self, item_id: &str) -> Result<Value> {
        self.post_form("/items/delete", &[("item_id".to_string(), item_id.to_string())])
            .await
    }

    pub async fn get_item(&self, item_id: &str) -> Result<Value> {
        self.get_json(&format!("/items/detail/{item_id}"), &[]).await
    }

    pub async fn get_items(&self, limit: usize, offset: usize) -> Result<Vec<Value>> {
        let response = self
            .get_json(
                "/items",
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
            )
            .await?;
        Ok(response
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// All items with pagination, capped at `max_items` when given.
    pub async fn get_all_items(&self, max_items: Option<usize>) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        let limit = 100usize;
        let mut offset = 0usize;

        loop {
            let items = self.get_items(limit, offset).await?;
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
            if !self.limiter.wait(EndpointClass::BaseWrite).await {
                break;
            }
        }
        Ok(all)
    }

    pub async fn add_image_from_url(
        &self,
        item_id: &str,
        image_no: usize,
        image_url: &str,
    ) -> Result<Value> {
        self.post_form(
            "/items/add_image",
            &[
                ("item_id".to_string(), item_id.to_string()),
                ("image_no".to_string(), image_no.to_string()),
                ("image_url".to_string(), image_url.to_string()),
            ],
        )
        .await
    }

    // -----------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------

    pub async fn get_orders(&self, limit: usize, offset: usize) -> Result<Vec<Value>> {
        let response = self
            .get_json(
                "/orders",
                &[("limit", limit.to_string()), ("offset", offset.to_string())],
            )
            .await?;
        Ok(response
            .get("orders")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn get_order_detail(&self, unique_key: &str) -> Result<Value> {
        self.get_json(&format!("/orders/detail/{unique_key}"), &[]).await
    }
}

fn parse_error_body(body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => {
            let error = json
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string);
            let description = json
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (error, description)
        }
        Err(_) => (None, body.chars().take(200).collect()),
    }
}

/// Whether an error from this client is the hourly quota body; the
/// scheduler records those as `failed` and retains the row for the next
/// cycle.
pub fn is_hour_api_limit(error: &anyhow::Error) -> bool {
    format!("{error:#}").contains(ERROR_HOUR_API_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_error_bodies() {
        let (code, desc) =
            parse_error_body(r#"{"error":"hour_api_limit","error_description":"too many"}"#);
        assert_eq!(code.as_deref(), Some("hour_api_limit"));
        assert_eq!(desc, "too many");
    }

    #[test]
    fn truncates_plain_text_errors() {
        let long = "x".repeat(500);
        let (code, desc) = parse_error_body(&long);
        assert!(code.is_none());
        assert_eq!(desc.len(), 200);
    }

    #[test]
    fn hour_api_limit_detection() {
        let err = anyhow!("hour_api_limit: too many requests");
        assert!(is_hour_api_limit(&err));
        let other = anyhow!("status 500: boom");
        assert!(!is_hour_api_limit(&other));
    }
}
