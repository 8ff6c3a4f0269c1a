//! Telegram channel: Bot API over HTTPS.
//!
//! Outbound messages go through `sendMessage`; inbound messages are pulled
//! with short `getUpdates` polls that track the update offset.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::channels::channel::{
    Channel, ChannelKind, ChannelState, ChannelStatus, IncomingMessage, RestartOutcome,
    SendOptions, split_message,
};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ConfigError};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: SecretString,
    pub allowed_users: Vec<String>,
    pub api_base: String,
}

impl TelegramSettings {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bot_token: SecretString::from(config.require_str("bot_token")?.to_string()),
            allowed_users: config.setting_list("allowed_users"),
            api_base: config
                .setting_str("api_base")
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }
}

/// Telegram channel.
pub struct TelegramChannel {
    config: ChannelConfig,
    state: ChannelState,
    client: reqwest::Client,
    settings: RwLock<Option<Arc<TelegramSettings>>>,
    offset: AtomicI64,
}

impl TelegramChannel {
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
            offset: AtomicI64::new(0),
        })
    }

    fn settings(&self) -> Option<Arc<TelegramSettings>> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn http_error(&self, e: impl std::fmt::Display) -> ChannelError {
        ChannelError::Http(format!("{}: {e}", self.config.name))
    }

    /// Call `getMe`, returning the bot's username.
    async fn get_me(&self, settings: &TelegramSettings) -> Result<String, ChannelError> {
        let resp = self
            .client
            .get(settings.api_url("getMe"))
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        if !resp.status().is_success() {
            return Err(ChannelError::StartupFailed {
                name: self.config.name.clone(),
                reason: format!("getMe returned {}", resp.status()),
            });
        }

        let data: Value = resp.json().await.map_err(|e| self.http_error(e))?;
        Ok(data
            .pointer("/result/username")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    /// Send one chunk (≤4096 chars), Markdown first with plain-text fallback.
    async fn send_chunk(
        &self,
        settings: &TelegramSettings,
        chat_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let url = settings.api_url("sendMessage");
        let send_failed = |reason: String| ChannelError::SendFailed {
            name: self.config.name.clone(),
            reason,
        };

        let markdown_resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown"
            }))
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }
        if markdown_resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChannelError::RateLimited {
                name: self.config.name.clone(),
            });
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            channel = %self.config.name,
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(send_failed(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            )));
        }
        Ok(())
    }

    async fn poll_updates(
        &self,
        settings: &TelegramSettings,
    ) -> Result<Vec<IncomingMessage>, ChannelError> {
        let resp = self
            .client
            .post(settings.api_url("getUpdates"))
            .json(&serde_json::json!({
                "offset": self.offset.load(Ordering::SeqCst),
                "timeout": 0,
                "allowed_updates": ["message"]
            }))
            .send()
            .await
            .map_err(|e| ChannelError::ReceiveFailed {
                name: self.config.name.clone(),
                reason: e.to_string(),
            })?;

        let data: Value = resp.json().await.map_err(|e| self.http_error(e))?;
        let updates = data
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut messages = Vec::new();
        for update in &updates {
            if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                self.offset.fetch_max(uid + 1, Ordering::SeqCst);
            }
            if let Some(incoming) = parse_update(&self.config.name, &settings.allowed_users, update)
            {
                messages.push(incoming);
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl Channel for TelegramChannel {
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

        let settings = match TelegramSettings::from_config(&self.config) {
            Ok(settings) => Arc::new(settings),
            Err(e) => {
                self.state.fail(&ChannelError::Misconfigured {
                    name: self.config.name.clone(),
                    reason: e.to_string(),
                });
                return false;
            }
        };

        match self.get_me(&settings).await {
            Ok(bot) => {
                tracing::info!(channel = %self.config.name, bot = %bot, "Telegram channel ready");
                *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Some(settings);
                self.state.transition_to(ChannelStatus::Ready)
            }
            Err(e) => {
                self.state.fail(&e);
                false
            }
        }
    }

    async fn shutdown(&self) -> bool {
        tracing::info!(channel = %self.config.name, "Telegram channel shutting down");
        self.settings.write().unwrap_or_else(|e| e.into_inner()).take();
        self.state.transition_to(ChannelStatus::Stopped)
    }

    async fn send_message(&self, recipient: &str, message: &str, _options: &SendOptions) -> bool {
        let Some(settings) = self.settings().filter(|_| self.state.is_ready()) else {
            self.state.record_error(&self.state.not_ready());
            return false;
        };

        for chunk in split_message(message, TELEGRAM_MAX_MESSAGE_LENGTH) {
            if let Err(e) = self.send_chunk(&settings, recipient, &chunk).await {
                self.state.record_error(&e);
                return false;
            }
        }
        tracing::info!(channel = %self.config.name, chat_id = recipient, "Telegram message sent");
        true
    }

    async fn receive_messages(&self) -> Vec<IncomingMessage> {
        let Some(settings) = self.settings().filter(|_| self.state.is_ready()) else {
            return Vec::new();
        };
        match self.poll_updates(&settings).await {
            Ok(messages) => messages,
            Err(e) => {
                self.state.record_error(&e);
                Vec::new()
            }
        }
    }

    async fn health_check(&self) -> bool {
        let Some(settings) = self.settings() else {
            return false;
        };
        let healthy = match self.get_me(&settings).await {
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
        if self.initialize().await {
            RestartOutcome::Restarted
        } else {
            RestartOutcome::Failed
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if any identity matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Turn one `getUpdates` entry into a message, if it is an allowed text message.
fn parse_update(channel: &str, allowed_users: &[String], update: &Value) -> Option<IncomingMessage> {
    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;

    let from = message.get("from");
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string());

    let mut identities = vec![username];
    if let Some(id) = user_id.as_deref() {
        identities.push(id);
    }
    if !check_user_allowed(allowed_users, identities) {
        tracing::warn!(
            channel,
            username,
            user_id = user_id.as_deref().unwrap_or("unknown"),
            "Ignoring Telegram message from unauthorized user"
        );
        return None;
    }

    let chat_id = message
        .pointer("/chat/id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let first_name = from
        .and_then(|f| f.get("first_name"))
        .and_then(Value::as_str);

    let mut incoming = IncomingMessage::new(channel, user_id.as_deref().unwrap_or(username), text)
        .with_metadata(serde_json::json!({
            "chat_id": chat_id,
            "username": username,
        }));
    incoming.user_name = Some(first_name.unwrap_or(username).to_string());
    Some(incoming)
}

// ── Tests ───────────────────────────────────────────────────────────
