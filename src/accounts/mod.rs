//! Account and owner configuration.
//!
//! Accounts are grouped under owners (the legal entities); each owner owns
//! one outbound proxy. Proxy resolution for a request: explicit call-site
//! proxy, then the account's own proxy_id, then the owner's, then direct.
//! Per-account OAuth tokens are persisted as `{account_id}_token.json`
//! under the tokens directory.

pub mod proxy;

pub use proxy::ProxyManager;

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Tokens are refreshed once they are ~55 minutes old (60 min validity
/// with a 5 min safety margin; the same window fits BASE and eBay).
pub const TOKEN_VALID_MINUTES: i64 = 55;

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub proxy_id: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub platform: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub proxy_id: Option<String>,
    #[serde(default = "default_daily_upload_limit")]
    pub daily_upload_limit: i64,
    #[serde(default = "default_rate_limit_per_hour")]
    pub rate_limit_per_hour: i64,
    #[serde(default)]
    pub credentials: Value,
}

fn default_daily_upload_limit() -> i64 {
    1000
}

fn default_rate_limit_per_hour() -> i64 {
    50
}

impl AccountConfig {
    pub fn credential(&self, key: &str) -> Option<String> {
        self.credentials
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: Vec<AccountConfig>,
    #[serde(default)]
    owners: Vec<OwnerConfig>,
}

/// Persisted OAuth token blob, one file per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_saved_at: Option<String>,
}

impl TokenData {
    pub fn stamp_saved_at(&mut self) {
        self.token_saved_at = Some(Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }

    /// A token with no save timestamp, or one saved more than the validity
    /// window ago, counts as expired.
    pub fn is_expired(&self) -> bool {
        let Some(saved_at) = self.token_saved_at.as_deref() else {
            return true;
        };
        let Ok(saved) = NaiveDateTime::parse_from_str(saved_at, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(saved_at, "%Y-%m-%dT%H:%M:%S"))
        else {
            return true;
        };
        let age = Local::now().naive_local() - saved;
        age > Duration::minutes(TOKEN_VALID_MINUTES)
    }
}

pub struct AccountManager {
    accounts: Vec<AccountConfig>,
    owners: HashMap<String, OwnerConfig>,
    tokens_dir: PathBuf,
    proxy_manager: ProxyManager,
}

impl AccountManager {
    /// Load `config/accounts.json` and the proxy table; tokens live under
    /// `config/tokens/`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("accounts.json");
        let (accounts, owners) = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let file: AccountsFile =
                    serde_json::from_str(&raw).context("parse accounts.json")?;
                (file.accounts, file.owners)
            }
            Err(e) => {
                warn!("account config unavailable ({}): {}", path.display(), e);
                (Vec::new(), Vec::new())
            }
        };

        let tokens_dir = config_dir.join("tokens");
        std::fs::create_dir_all(&tokens_dir)
            .with_context(|| format!("create tokens dir {}", tokens_dir.display()))?;

        Ok(Self {
            accounts,
            owners: owners.into_iter().map(|o| (o.id.clone(), o)).collect(),
            tokens_dir,
            proxy_manager: ProxyManager::load(config_dir),
        })
    }

    #[cfg(test)]
    pub fn for_tests(
        accounts: Vec<AccountConfig>,
        owners: Vec<OwnerConfig>,
        tokens_dir: PathBuf,
    ) -> Self {
        Self {
            accounts,
            owners: owners.into_iter().map(|o| (o.id.clone(), o)).collect(),
            tokens_dir,
            proxy_manager: ProxyManager::default(),
        }
    }

    pub fn get_account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == account_id)
    }

    pub fn active_accounts(&self, platform: &str) -> Vec<&AccountConfig> {
        self.accounts
            .iter()
            .filter(|a| a.active && a.platform == platform)
            .collect()
    }

    pub fn get_owner(&self, owner_id: &str) -> Option<&OwnerConfig> {
        self.owners.get(owner_id)
    }

    pub fn owner_for_account(&self, account_id: &str) -> Option<&OwnerConfig> {
        let account = self.get_account(account_id)?;
        self.get_owner(account.owner_id.as_deref()?)
    }

    /// Proxy id for a request: explicit override, then the account's own
    /// proxy_id, then the owner's, then none (direct).
    pub fn proxy_id_for_account(
        &self,
        account_id: &str,
        explicit: Option<&str>,
    ) -> Option<String> {
        if let Some(explicit) = explicit {
            return Some(explicit.to_string());
        }
        let account = self.get_account(account_id)?;
        if let Some(proxy_id) = &account.proxy_id {
            return Some(proxy_id.clone());
        }
        self.owner_for_account(account_id)?.proxy_id.clone()
    }

    pub fn proxy_for_account(
        &self,
        account_id: &str,
        explicit: Option<&str>,
    ) -> Option<reqwest::Proxy> {
        let proxy_id = self.proxy_id_for_account(account_id, explicit)?;
        self.proxy_manager.get_proxy(&proxy_id)
    }

    // ---------------------------------------------------------------
    // Token storage
    // ---------------------------------------------------------------

    fn token_path(&self, account_id: &str) -> PathBuf {
        self.tokens_dir.join(format!("{account_id}_token.json"))
    }

    pub fn get_token(&self, account_id: &str) -> Option<TokenData> {
        let path = self.token_path(account_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("broken token file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save_token(&self, account_id: &str, token: &TokenData) -> Result<()> {
        let path = self.token_path(account_id);
        let raw = serde_json::to_string_pretty(token).context("serialize token")?;
        std::fs::write(&path, raw)
            .with_context(|| format!("write token file {}", path.display()))?;
        Ok(())
    }

    pub fn has_valid_token(&self, account_id: &str) -> bool {
        self.get_token(account_id)
            .map(|t| !t.access_token.is_empty() && !t.is_expired())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn account(id: &str, proxy_id: Option<&str>, owner_id: Option<&str>) -> AccountConfig {
        AccountConfig {
            id: id.to_string(),
            platform: "base".to_string(),
            name: id.to_string(),
            active: true,
            owner_id: owner_id.map(str::to_string),
            proxy_id: proxy_id.map(str::to_string),
            daily_upload_limit: 1000,
            rate_limit_per_hour: 50,
            credentials: Value::Null,
        }
    }

    fn owner(id: &str, proxy_id: Option<&str>) -> OwnerConfig {
        OwnerConfig {
            id: id.to_string(),
            name: id.to_string(),
            proxy_id: proxy_id.map(str::to_string),
            description: String::new(),
        }
    }

    #[test]
    fn proxy_resolution_order() {
        let dir = TempDir::new().unwrap();
        let manager = AccountManager::for_tests(
            vec![
                account("acc_direct", Some("proxy_account"), Some("owner_01")),
                account("acc_owner", None, Some("owner_01")),
                account("acc_none", None, None),
            ],
            vec![owner("owner_01", Some("proxy_owner"))],
            dir.path().to_path_buf(),
        );

        // explicit beats everything
        assert_eq!(
            manager.proxy_id_for_account("acc_direct", Some("proxy_explicit")),
            Some("proxy_explicit".to_string())
        );
        // account-level beats owner
        assert_eq!(
            manager.proxy_id_for_account("acc_direct", None),
            Some("proxy_account".to_string())
        );
        // owner fallback
        assert_eq!(
            manager.proxy_id_for_account("acc_owner", None),
            Some("proxy_owner".to_string())
        );
        // direct
        assert_eq!(manager.proxy_id_for_account("acc_none", None), None);
    }

    #[test]
    fn token_round_trip_and_expiry() {
        let dir = TempDir::new().unwrap();
        let manager =
            AccountManager::for_tests(vec![account("acc", None, None)], vec![], dir.path().to_path_buf());

        let mut token = TokenData {
            access_token: "tok".to_string(),
            refresh_token: Some("ref".to_string()),
            token_type: None,
            expires_in: Some(3600),
            token_saved_at: None,
        };
        assert!(token.is_expired());

        token.stamp_saved_at();
        assert!(!token.is_expired());

        manager.save_token("acc", &token).unwrap();
        let loaded = manager.get_token("acc").unwrap();
        assert_eq!(loaded.access_token, "tok");
        assert!(manager.has_valid_token("acc"));
    }

    #[test]
    fn old_token_is_expired() {
        let token = TokenData {
            access_token: "tok".to_string(),
            refresh_token: None,
            token_type: None,
            expires_in: Some(3600),
            token_saved_at: Some(
                (Local::now().naive_local() - Duration::minutes(TOKEN_VALID_MINUTES + 5))
                    .format("%Y-%m-%dT%H:%M:%S%.f")
                    .to_string(),
            ),
        };
        assert!(token.is_expired());
    }
}
