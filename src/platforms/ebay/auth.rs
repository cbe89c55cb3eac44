//! eBay OAuth: application tokens for public data, user tokens for the
//! selling APIs.
//!
//! Application tokens come from the client-credentials grant and are
//! cached in memory with a five-minute safety margin. User tokens are
//! per-account files refreshed against the stored refresh token; a new
//! refresh token is not always returned, so the old one is kept.

use crate::accounts::{AccountManager, TokenData};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub const SCOPES_SELL: &[&str] = &[
    "https://api.ebay.com/oauth/api_scope/sell.inventory",
    "https://api.ebay.com/oauth/api_scope/sell.marketing",
    "https://api.ebay.com/oauth/api_scope/sell.account",
    "https://api.ebay.com/oauth/api_scope/sell.fulfillment",
];

const APP_TOKEN_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Sandbox,
}

impl Environment {
    pub fn api_base(&self) -> &'static str {
        match self {
            Environment::Production => "https://api.ebay.com",
            Environment::Sandbox => "https://api.sandbox.ebay.com",
        }
    }

    pub fn auth_base(&self) -> &'static str {
        match self {
            Environment::Production => "https://auth.ebay.com",
            Environment::Sandbox => "https://auth.sandbox.ebay.com",
        }
    }
}

struct CachedAppToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct EbayAuthClient {
    app_id: String,
    cert_id: String,
    redirect_uri: String,
    environment: Environment,
    client: Client,
    app_token: Mutex<Option<CachedAppToken>>,
}

#[derive(Deserialize)]
struct OauthTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl EbayAuthClient {
    pub fn new(app_id: &str, cert_id: &str, redirect_uri: &str, environment: Environment) -> Self {
        Self {
            app_id: app_id.to_string(),
            cert_id: cert_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            environment,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            app_token: Mutex::new(None),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/identity/v1/oauth2/token", self.environment.api_base())
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<OauthTokenResponse> {
        let response = self
            .client
            .post(self.token_url())
            .basic_auth(&self.app_id, Some(&self.cert_id))
            .form(form)
            .send()
            .await
            .context("eBay token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("eBay token request failed: {status} - {body}");
        }
        response.json().await.context("parse eBay token response")
    }

    /// Application token for public data (Taxonomy). Cached until five
    /// minutes before expiry.
    pub async fn application_token(&self) -> Result<String> {
        let mut cached = self.app_token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let token = self
            .token_request(&[
                ("grant_type", "client_credentials"),
                ("scope", "https://api.ebay.com/oauth/api_scope"),
            ])
            .await?;

        let expires_in = token.expires_in.unwrap_or(7200);
        let expires_at =
            Utc::now() + ChronoDuration::seconds(expires_in - APP_TOKEN_MARGIN_SECS);
        let access_token = token.access_token.clone();
        *cached = Some(CachedAppToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }

    /// Consent URL for the authorization-code grant (documented flow; the
    /// consent webapp itself is external).
    pub fn user_consent_url(&self, scopes: Option<&[&str]>) -> String {
        let scopes = scopes.unwrap_or(SCOPES_SELL).join(" ");
        format!(
            "{}/oauth2/authorize?client_id={}&redirect_uri={}&response_type=code&scope={}",
            self.environment.auth_base(),
            self.app_id,
            self.redirect_uri,
            scopes,
        )
    }

    /// Exchange an authorization code for the first user token.
    pub async fn exchange_user_code(&self, auth_code: &str) -> Result<TokenData> {
        let token = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", auth_code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .await?;
        Ok(self.into_token_data(token, None))
    }

    /// Refresh a user token. eBay may omit the refresh token from the
    /// response; the original one is carried over.
    pub async fn refresh_user_token(&self, refresh_token: &str) -> Result<TokenData> {
        let scope = SCOPES_SELL.join(" ");
        let token = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", scope.as_str()),
            ])
            .await?;
        Ok(self.into_token_data(token, Some(refresh_token)))
    }

    fn into_token_data(
        &self,
        token: OauthTokenResponse,
        previous_refresh: Option<&str>,
    ) -> TokenData {
        let mut data = TokenData {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            token_type: token.token_type,
            expires_in: token.expires_in,
            token_saved_at: None,
        };
        data.stamp_saved_at();
        data
    }
}

/// Account-scoped token manager: loads the stored user token, refreshes
/// it when the validity window has passed, and persists the result.
pub struct EbayTokenManager {
    account_id: String,
    auth: Arc<EbayAuthClient>,
    manager: Arc<AccountManager>,
}

impl EbayTokenManager {
    pub fn new(account_id: &str, auth: Arc<EbayAuthClient>, manager: Arc<AccountManager>) -> Self {
        Self {
            account_id: account_id.to_string(),
            auth,
            manager,
        }
    }

    pub async fn valid_token(&self) -> Result<String> {
        let Some(token) = self.manager.get_token(&self.account_id) else {
            bail!(
                "no eBay token stored for {}; run the account setup consent flow",
                self.account_id
            );
        };

        if !token.is_expired() {
            return Ok(token.access_token);
        }

        let Some(refresh_token) = token.refresh_token else {
            bail!("eBay token for {} has no refresh token", self.account_id);
        };

        info!("refreshing eBay user token for {}", self.account_id);
        let new_token = self.auth.refresh_user_token(&refresh_token).await?;
        self.manager.save_token(&self.account_id, &new_token)?;
        Ok(new_token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consent_url_carries_default_scopes() {
        let auth = EbayAuthClient::new("app", "cert", "https://cb", Environment::Sandbox);
        let url = auth.user_consent_url(None);
        assert!(url.starts_with("https://auth.sandbox.ebay.com/oauth2/authorize"));
        assert!(url.contains("sell.inventory"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn environment_urls() {
        assert_eq!(Environment::Production.api_base(), "https://api.ebay.com");
        assert_eq!(
            Environment::Sandbox.api_base(),
            "https://api.sandbox.ebay.com"
        );
    }
}
