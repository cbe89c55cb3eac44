//! eBay category recommendation via the Taxonomy API.
//!
//! Suggestions are cached on disk keyed by a hash of the lowercased
//! query; when the API yields nothing (or the application token is
//! unavailable) a hard-coded default category is used.

use crate::platforms::ebay::auth::EbayAuthClient;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const FALLBACK_CATEGORY_ID: &str = "16427";
pub const FALLBACK_CATEGORY_NAME: &str = "Action Figures";
const QUERY_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorySuggestion {
    pub category_id: String,
    pub category_name: String,
    pub source: String,
}

pub struct CategoryMapper {
    auth: Arc<EbayAuthClient>,
    client: Client,
    base_url: String,
    cache_dir: PathBuf,
}

impl CategoryMapper {
    pub fn new(auth: Arc<EbayAuthClient>, base_url: &str, cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("create category cache dir {}", cache_dir.display()))?;
        Ok(Self {
            auth,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    /// Category for a title/description pair: cache, then Taxonomy API,
    /// then the fallback.
    pub async fn recommended_category(
        &self,
        title: &str,
        description: Option<&str>,
    ) -> CategorySuggestion {
        let query = match description {
            Some(desc) => format!("{title} {desc}"),
            None => title.to_string(),
        };

        if let Some(mut cached) = self.cached(&query) {
            cached.source = "cache".to_string();
            return cached;
        }

        match self.query_taxonomy(title).await {
            Ok(Some(suggestion)) => {
                self.save_cache(&query, &suggestion);
                suggestion
            }
            Ok(None) => fallback_category(),
            Err(e) => {
                warn!("taxonomy lookup failed: {e:#}");
                fallback_category()
            }
        }
    }

    async fn query_taxonomy(&self, title: &str) -> Result<Option<CategorySuggestion>> {
        let token = self.auth.application_token().await?;
        let query: String = title.chars().take(QUERY_MAX_CHARS).collect();

        let response = self
            .client
            .get(format!(
                "{}/commerce/taxonomy/v1/category_tree/0/get_category_suggestions",
                self.base_url
            ))
            .bearer_auth(token)
            .query(&[("q", query.as_str())])
            .send()
            .await
            .context("taxonomy request")?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let body: Value = response.json().await.context("parse taxonomy response")?;
        let suggestion = body
            .get("categorySuggestions")
            .and_then(Value::as_array)
            .and_then(|s| s.first())
            .and_then(|s| s.get("category"));

        Ok(suggestion.and_then(|category| {
            let id = category.get("categoryId").and_then(Value::as_str)?;
            let name = category
                .get("categoryName")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            Some(CategorySuggestion {
                category_id: id.to_string(),
                category_name: name.to_string(),
                source: "api".to_string(),
            })
        }))
    }

    fn cache_path(&self, query: &str) -> PathBuf {
        let digest = Sha256::digest(query.to_lowercase().as_bytes());
        self.cache_dir.join(format!("{}.json", hex::encode(digest)))
    }

    fn cached(&self, query: &str) -> Option<CategorySuggestion> {
        let raw = std::fs::read_to_string(self.cache_path(query)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn save_cache(&self, query: &str, suggestion: &CategorySuggestion) {
        if let Ok(raw) = serde_json::to_string_pretty(suggestion) {
            // A failed cache write only costs a future API call
            std::fs::write(self.cache_path(query), raw).ok();
        }
    }
}

pub fn fallback_category() -> CategorySuggestion {
    CategorySuggestion {
        category_id: FALLBACK_CATEGORY_ID.to_string(),
        category_name: FALLBACK_CATEGORY_NAME.to_string(),
        source: "fallback".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::ebay::auth::Environment;
    use tempfile::TempDir;

    fn mapper(dir: &TempDir) -> CategoryMapper {
        let auth = Arc::new(EbayAuthClient::new(
            "app",
            "cert",
            "https://cb",
            Environment::Sandbox,
        ));
        CategoryMapper::new(auth, Environment::Sandbox.api_base(), dir.path()).unwrap()
    }

    #[test]
    fn cache_round_trip_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let mapper = mapper(&dir);
        let suggestion = CategorySuggestion {
            category_id: "1234".to_string(),
            category_name: "Trains".to_string(),
            source: "api".to_string(),
        };
        mapper.save_cache("Model Train", &suggestion);

        let cached = mapper.cached("model train").unwrap();
        assert_eq!(cached.category_id, "1234");
    }

    #[test]
    fn fallback_has_the_default_category() {
        let fallback = fallback_category();
        assert_eq!(fallback.category_id, FALLBACK_CATEGORY_ID);
        assert_eq!(fallback.source, "fallback");
    }
}
