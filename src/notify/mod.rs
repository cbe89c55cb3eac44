//! Event notifications for the daemons.
//!
//! Routing is configured in `config/notifications.json`: a global enable
//! flag, the delivery method, per-method credentials, and a per-event
//! enable map. Delivery failures are logged and swallowed so a broken
//! webhook can never take a daemon down.

use anyhow::{Context, Result};
use chrono::Local;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

impl NotifyLevel {
    fn as_str(&self) -> &'static str {
        match self {
            NotifyLevel::Info => "INFO",
            NotifyLevel::Warning => "WARNING",
            NotifyLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub chatwork: ChatworkConfig,
    #[serde(default)]
    pub discord: WebhookConfig,
    #[serde(default)]
    pub slack: WebhookConfig,
    #[serde(default)]
    pub events: HashMap<String, bool>,
}

fn default_method() -> String {
    "chatwork".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatworkConfig {
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    #[serde(default)]
    pub webhook_url: String,
}

pub struct Notifier {
    config: NotificationConfig,
    client: Client,
}

impl Notifier {
    pub fn new(config: NotificationConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Load from `config/notifications.json`; a missing or broken file
    /// yields a disabled notifier.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join("notifications.json");
        let config = match Self::load_file(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("notification config unavailable ({}): {}", path.display(), e);
                NotificationConfig::default()
            }
        };
        Self::new(config)
    }

    fn load_file(path: &Path) -> Result<NotificationConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).context("parse notifications.json")
    }

    pub fn is_enabled(&self, event: &str) -> bool {
        self.config.enabled && self.config.events.get(event).copied().unwrap_or(false)
    }

    /// Send a notification for `event`. No-op when the notifier or the
    /// event is disabled; delivery errors are logged, never returned.
    pub async fn notify(&self, event: &str, title: &str, message: &str, level: NotifyLevel) {
        if !self.is_enabled(event) {
            return;
        }

        let result = match self.config.method.as_str() {
            "chatwork" => self.send_chatwork(title, message, level).await,
            "discord" => self.send_discord(title, message, level).await,
            "slack" => self.send_slack(title, message, level).await,
            // email and eventlog delivery run through external transports
            "email" | "eventlog" => {
                warn!(
                    method = self.config.method.as_str(),
                    "notification method not handled in-process, dropping event {}", event
                );
                Ok(())
            }
            other => {
                warn!("unknown notification method: {}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("notification delivery failed (event={}): {}", event, e);
        }
    }

    async fn send_chatwork(&self, title: &str, message: &str, level: NotifyLevel) -> Result<()> {
        let cfg = &self.config.chatwork;
        if cfg.api_token.is_empty() || cfg.room_id.is_empty() {
            warn!("chatwork api_token or room_id not configured");
            return Ok(());
        }

        let marker = match level {
            NotifyLevel::Info => "[info]",
            NotifyLevel::Warning => "[!]",
            NotifyLevel::Error => "[!!!]",
        };
        let body = format!(
            "{}{}\n{}\n{}",
            marker,
            title,
            message,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        let url = format!(
            "https://api.chatwork.com/v2/rooms/{}/messages",
            cfg.room_id
        );
        self.client
            .post(&url)
            .header("X-ChatWorkToken", &cfg.api_token)
            .form(&[("body", body)])
            .send()
            .await
            .context("chatwork request")?
            .error_for_status()
            .context("chatwork response")?;
        Ok(())
    }

    async fn send_discord(&self, title: &str, message: &str, level: NotifyLevel) -> Result<()> {
        let url = &self.config.discord.webhook_url;
        if url.is_empty() {
            warn!("discord webhook_url not configured");
            return Ok(());
        }

        let color = match level {
            NotifyLevel::Info => 0x00ff00,
            NotifyLevel::Warning => 0xffa500,
            NotifyLevel::Error => 0xff0000,
        };
        let payload = json!({
            "embeds": [{
                "title": title,
                "description": message,
                "color": color,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }]
        });

        self.client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("discord request")?
            .error_for_status()
            .context("discord response")?;
        Ok(())
    }

    async fn send_slack(&self, title: &str, message: &str, level: NotifyLevel) -> Result<()> {
        let url = &self.config.slack.webhook_url;
        if url.is_empty() {
            warn!("slack webhook_url not configured");
            return Ok(());
        }

        let color = match level {
            NotifyLevel::Info => "good",
            NotifyLevel::Warning => "warning",
            NotifyLevel::Error => "danger",
        };
        let payload = json!({
            "attachments": [{
                "title": title,
                "text": message,
                "color": color,
                "ts": chrono::Utc::now().timestamp(),
            }]
        });

        self.client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("slack request")?
            .error_for_status()
            .context("slack response")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_event(enabled: bool, event_on: bool) -> NotificationConfig {
        let mut events = HashMap::new();
        events.insert("task_failure".to_string(), event_on);
        NotificationConfig {
            enabled,
            method: "chatwork".to_string(),
            events,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_notifier_short_circuits() {
        let n = Notifier::new(config_with_event(false, true));
        assert!(!n.is_enabled("task_failure"));
    }

    #[test]
    fn disabled_event_short_circuits() {
        let n = Notifier::new(config_with_event(true, false));
        assert!(!n.is_enabled("task_failure"));
        assert!(!n.is_enabled("unknown_event"));
    }

    #[test]
    fn enabled_event_passes() {
        let n = Notifier::new(config_with_event(true, true));
        assert!(n.is_enabled("task_failure"));
    }

    #[tokio::test]
    async fn notify_with_missing_credentials_does_not_error() {
        let n = Notifier::new(config_with_event(true, true));
        // No credentials configured: must log and return, never panic.
        n.notify("task_failure", "t", "m", NotifyLevel::Warning).await;
    }
}
