//! BASE OAuth token lifecycle.
//!
//! Tokens live as per-account files managed by the account manager and
//! are refreshed via the client credentials when older than the validity
//! window.

use crate::accounts::{AccountManager, TokenData};
use anyhow::{bail, Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::info;

const OAUTH_TOKEN_URL: &str = "https://api.thebase.in/1/oauth/token";

pub struct BaseOAuthClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    client: Client,
}

impl BaseOAuthClient {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenData> {
        let response = self
            .client
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .context("BASE token refresh request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("BASE token refresh failed: {status} - {body}");
        }

        let mut token: TokenData = response
            .json()
            .await
            .context("parse BASE token response")?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        token.stamp_saved_at();
        Ok(token)
    }
}

/// Stored token for `account_id`, refreshed and re-saved when expired.
/// Refresh failure is fatal to the current call; the operator must
/// re-consent.
pub async fn token_with_auto_refresh(
    manager: &AccountManager,
    account_id: &str,
) -> Result<TokenData> {
    let Some(token) = manager.get_token(account_id) else {
        bail!("no token stored for account {account_id}");
    };

    if !token.is_expired() {
        return Ok(token);
    }

    let Some(refresh_token) = token.refresh_token.clone() else {
        bail!("account {account_id} has no refresh token");
    };
    let Some(account) = manager.get_account(account_id) else {
        bail!("unknown account {account_id}");
    };

    let client_id = account
        .credential("client_id")
        .context("account credentials missing client_id")?;
    let client_secret = account
        .credential("client_secret")
        .context("account credentials missing client_secret")?;
    let redirect_uri = account.credential("redirect_uri").unwrap_or_default();

    info!("refreshing BASE token for {account_id}");
    let oauth = BaseOAuthClient::new(&client_id, &client_secret, &redirect_uri);
    let new_token = oauth.refresh_access_token(&refresh_token).await?;
    manager.save_token(account_id, &new_token)?;
    Ok(new_token)
}
