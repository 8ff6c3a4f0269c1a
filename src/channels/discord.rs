//! Discord channel: outbound direct messages through the Bot REST API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::channels::channel::{
    Channel, ChannelKind, ChannelState, ChannelStatus, ConnectivityStatus, IncomingMessage,
    RestartOutcome, SendOptions, split_message,
};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ConfigError};

/// Discord rejects message content over 2000 characters.
const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
pub struct DiscordSettings {
    pub bot_token: SecretString,
    pub api_base: String,
}

impl DiscordSettings {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bot_token: SecretString::from(config.require_str("bot_token")?.to_string()),
            api_base: config
                .setting_str("api_base")
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token.expose_secret())
    }
}

/// Outcome of the most recent `/users/@me` probe.
#[derive(Debug, Clone, Default)]
struct Probe {
    account: Option<String>,
    latency_ms: Option<u64>,
    checked_at: Option<chrono::DateTime<Utc>>,
    error: Option<String>,
}

/// Discord channel. Outbound only: `receive_messages` is always empty.
pub struct DiscordChannel {
    config: ChannelConfig,
    state: ChannelState,
    client: reqwest::Client,
    settings: RwLock<Option<Arc<DiscordSettings>>>,
    /// Recipient user id → DM channel id.
    dm_channels: Mutex<HashMap<String, String>>,
    probe: Mutex<Probe>,
}

impl DiscordChannel {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            state: ChannelState::new(&config.name),
            client,
            settings: RwLock::new(None),
            dm_channels: Mutex::new(HashMap::new()),
            probe: Mutex::new(Probe::default()),
        })
    }

    fn settings(&self) -> Option<Arc<DiscordSettings>> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_status(&self, resp: &reqwest::Response, action: &str) -> Result<(), ChannelError> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(ChannelError::RateLimited {
                name: self.config.name.clone(),
            })
        } else {
            Err(ChannelError::Http(format!(
                "{}: {action} returned {status}",
                self.config.name
            )))
        }
    }

    /// `GET /users/@me`; records latency and the bot account on the probe.
    async fn probe_account(&self, settings: &DiscordSettings) -> Result<String, ChannelError> {
        let started = Instant::now();
        let result = async {
            let resp = self
                .client
                .get(settings.url("/users/@me"))
                .header("Authorization", settings.auth_header())
                .send()
                .await
                .map_err(|e| ChannelError::Http(format!("{}: {e}", self.config.name)))?;
            self.check_status(&resp, "users/@me")?;
            let data: Value = resp
                .json()
                .await
                .map_err(|e| ChannelError::Http(format!("{}: {e}", self.config.name)))?;
            Ok::<_, ChannelError>(
                data.get("username")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            )
        }
        .await;

        let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        probe.checked_at = Some(Utc::now());
        match &result {
            Ok(account) => {
                probe.account = Some(account.clone());
                probe.latency_ms = u64::try_from(started.elapsed().as_millis()).ok();
                probe.error = None;
            }
            Err(e) => {
                probe.latency_ms = None;
                probe.error = Some(e.to_string());
            }
        }
        result
    }

    /// Resolve (and cache) the DM channel for a recipient user id.
    async fn dm_channel(
        &self,
        settings: &DiscordSettings,
        recipient: &str,
    ) -> Result<String, ChannelError> {
        let cached = self
            .dm_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(recipient)
            .cloned();
        if let Some(id) = cached {
            return Ok(id);
        }

        let resp = self
            .client
            .post(settings.url("/users/@me/channels"))
            .header("Authorization", settings.auth_header())
            .json(&serde_json::json!({ "recipient_id": recipient }))
            .send()
            .await
            .map_err(|e| self.send_failed(e.to_string()))?;
        self.check_status(&resp, "create DM")?;

        let data: Value = resp.json().await.map_err(|e| self.send_failed(e.to_string()))?;
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| self.send_failed("DM channel response has no id".into()))?
            .to_string();

        self.dm_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(recipient.to_string(), id.clone());
        Ok(id)
    }

    fn send_failed(&self, reason: String) -> ChannelError {
        ChannelError::SendFailed {
            name: self.config.name.clone(),
            reason,
        }
    }

    async fn deliver(
        &self,
        settings: &DiscordSettings,
        recipient: &str,
        message: &str,
    ) -> Result<(), ChannelError> {
        let channel_id = self.dm_channel(settings, recipient).await?;
        let url = settings.url(&format!("/channels/{channel_id}/messages"));

        for chunk in split_message(message, DISCORD_MAX_MESSAGE_LENGTH) {
            let resp = self
                .client
                .post(&url)
                .header("Authorization", settings.auth_header())
                .json(&serde_json::json!({ "content": chunk }))
                .send()
                .await
                .map_err(|e| self.send_failed(e.to_string()))?;
            self.check_status(&resp, "create message")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Async
    }

    fn status(&self) -> ChannelStatus {
        self.state.status()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    async fn initialize(&self) -> bool {
        if !self.state.transition_to(ChannelStatus::Initializing) {
            return false;
        }

        let settings = match DiscordSettings::from_config(&self.config) {
            Ok(settings) => Arc::new(settings),
            Err(e) => {
                self.state.fail(&ChannelError::Misconfigured {
                    name: self.config.name.clone(),
                    reason: e.to_string(),
                });
                return false;
            }
        };

        match self.probe_account(&settings).await {
            Ok(account) => {
                tracing::info!(channel = %self.config.name, account = %account, "Discord channel ready");
                *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Some(settings);
                self.state.transition_to(ChannelStatus::Ready)
            }
            Err(e) => {
                self.state.fail(&ChannelError::StartupFailed {
                    name: self.config.name.clone(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    async fn shutdown(&self) -> bool {
        tracing::info!(channel = %self.config.name, "Discord channel shutting down");
        self.settings.write().unwrap_or_else(|e| e.into_inner()).take();
        self.dm_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.state.transition_to(ChannelStatus::Stopped)
    }

    async fn send_message(&self, recipient: &str, message: &str, _options: &SendOptions) -> bool {
        let Some(settings) = self.settings().filter(|_| self.state.is_ready()) else {
            self.state.record_error(&self.state.not_ready());
            return false;
        };

        match self.deliver(&settings, recipient, message).await {
            Ok(()) => {
                tracing::info!(channel = %self.config.name, recipient, "Discord message sent");
                true
            }
            Err(e) => {
                self.state.record_error(&e);
                false
            }
        }
    }

    async fn receive_messages(&self) -> Vec<IncomingMessage> {
        Vec::new()
    }

    async fn health_check(&self) -> bool {
        let Some(settings) = self.settings() else {
            return false;
        };
        let healthy = match self.probe_account(&settings).await {
            Ok(_) => true,
            Err(e) => {
                self.state.record_error(&e);
                false
            }
        };
        self.state.record_health(healthy);
        healthy && self.state.is_ready()
    }

    async fn restart(&self) -> RestartOutcome {
        self.dm_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if self.initialize().await {
            RestartOutcome::Restarted
        } else {
            RestartOutcome::Failed
        }
    }

    fn connectivity(&self) -> Option<ConnectivityStatus> {
        let probe = self.probe.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let status = self.state.status();
        Some(ConnectivityStatus {
            connected: status == ChannelStatus::Ready && probe.error.is_none(),
            status,
            account: probe.account,
            latency_ms: probe.latency_ms,
            last_checked: probe.checked_at,
            last_error: probe.error.or_else(|| self.state.last_error()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discord_config() -> ChannelConfig {
        ChannelConfig::new("discord").with_setting("bot_token", serde_json::json!("tok"))
    }

    #[test]
    fn settings_urls_and_auth() {
        let settings = DiscordSettings::from_config(&discord_config()).unwrap();
        assert_eq!(
            settings.url("/users/@me"),
            "https://discord.com/api/v10/users/@me"
        );
        assert_eq!(settings.auth_header(), "Bot tok");
    }

    #[test]
    fn settings_require_token() {
        assert!(DiscordSettings::from_config(&ChannelConfig::new("discord")).is_err());
    }

    #[test]
    fn connectivity_before_initialize() {
        let channel = DiscordChannel::from_config(&discord_config()).unwrap();
        let report = channel.connectivity().unwrap();
        assert!(!report.connected);
        assert_eq!(report.status, ChannelStatus::Uninitialized);
        assert!(report.account.is_none());
        assert!(report.last_checked.is_none());
    }

    #[tokio::test]
    async fn failed_probe_is_reported() {
        let config = discord_config()
            .with_setting("api_base", serde_json::json!("http://127.0.0.1:9"))
            .with_timeout(std::time::Duration::from_secs(2));
        let channel = DiscordChannel::from_config(&config).unwrap();

        assert!(!channel.initialize().await);
        let report = channel.connectivity().unwrap();
        assert!(!report.connected);
        assert_eq!(report.status, ChannelStatus::Error);
        assert!(report.last_checked.is_some());
        assert!(report.last_error.is_some());
    }

    #[tokio::test]
    async fn outbound_only() {
        let channel = DiscordChannel::from_config(&discord_config()).unwrap();
        assert!(channel.receive_messages().await.is_empty());
        assert!(!channel.send_message("1234", "hello", &SendOptions::default()).await);
        assert!(channel.shutdown().await);
        assert_eq!(channel.status(), ChannelStatus::Stopped);
    }
}
