//! SP-API credential loading from the environment.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// LWA credentials for the SP-API refresh-token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpApiCredentials {
    pub refresh_token: String,
    pub lwa_app_id: String,
    pub lwa_client_secret: String,
}

impl SpApiCredentials {
    /// Read from the environment. `REFRESH_TOKEN` / `LWA_APP_ID` /
    /// `LWA_CLIENT_SECRET` take precedence, with the legacy `SP_API_`
    /// prefixed names as fallback.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let refresh_token = env_either("REFRESH_TOKEN", "SP_API_REFRESH_TOKEN");
        let lwa_app_id = env_either("LWA_APP_ID", "SP_API_LWA_APP_ID");
        let lwa_client_secret = env_either("LWA_CLIENT_SECRET", "SP_API_LWA_CLIENT_SECRET");

        match (refresh_token, lwa_app_id, lwa_client_secret) {
            (Some(refresh_token), Some(lwa_app_id), Some(lwa_client_secret)) => Ok(Self {
                refresh_token,
                lwa_app_id,
                lwa_client_secret,
            }),
            _ => bail!(
                "missing SP-API credentials: set REFRESH_TOKEN, LWA_APP_ID and \
                 LWA_CLIENT_SECRET (or their SP_API_ prefixed aliases)"
            ),
        }
    }
}

fn env_either(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|v| !v.is_empty()))
}
