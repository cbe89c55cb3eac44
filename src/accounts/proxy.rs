//! Outbound proxy configuration.
//!
//! Proxies are declared in `config/proxies.json` and referenced by id from
//! owners and accounts. URLs may embed `${ENV_VAR}` placeholders for
//! credentials.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ProxyFile {
    #[serde(default)]
    proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyManager {
    proxies: HashMap<String, ProxyConfig>,
}

impl ProxyManager {
    /// Load `config/proxies.json`; a missing file means no proxies.
    pub fn load(config_dir: &Path) -> Self {
        dotenv::dotenv().ok();

        let path = config_dir.join("proxies.json");
        match Self::load_file(&path) {
            Ok(manager) => manager,
            Err(e) => {
                warn!("proxy config unavailable ({}): {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let file: ProxyFile = serde_json::from_str(&raw).context("parse proxies.json")?;
        Ok(Self {
            proxies: file.proxies.into_iter().map(|p| (p.id.clone(), p)).collect(),
        })
    }

    pub fn proxy_url(&self, proxy_id: &str) -> Option<String> {
        let config = self.proxies.get(proxy_id)?;
        Some(expand_env_vars(&config.url))
    }

    /// Resolve a proxy id into a reqwest proxy for both schemes.
    pub fn get_proxy(&self, proxy_id: &str) -> Option<reqwest::Proxy> {
        let url = self.proxy_url(proxy_id)?;
        match reqwest::Proxy::all(&url) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!("invalid proxy url for {}: {}", proxy_id, e);
                None
            }
        }
    }
}

/// Replace `${VAR}` with the environment value; unset variables become
/// empty and are logged.
fn expand_env_vars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => warn!("environment variable not set: {}", name),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_variables() {
        std::env::set_var("RESELLBOT_TEST_PROXY_USER", "alice");
        let expanded = expand_env_vars("http://${RESELLBOT_TEST_PROXY_USER}@proxy:8080");
        assert_eq!(expanded, "http://alice@proxy:8080");
    }

    #[test]
    fn unknown_variables_become_empty() {
        let expanded = expand_env_vars("http://${RESELLBOT_TEST_NO_SUCH_VAR}@proxy:8080");
        assert_eq!(expanded, "http://@proxy:8080");
    }

    #[test]
    fn missing_proxy_yields_none() {
        let manager = ProxyManager::default();
        assert!(manager.get_proxy("proxy_01").is_none());
    }
}
