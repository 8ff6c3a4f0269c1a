//! Channel contract: the lifecycle and delivery operations every channel exposes.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChannelError;

/// Live channel map shared between the orchestrator and the monitor.
pub type SharedChannels = Arc<RwLock<std::collections::HashMap<String, Arc<dyn Channel>>>>;

/// Whether a channel's underlying work is blocking or natively async.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Blocking I/O, bridged onto `spawn_blocking`.
    Sync,
    /// Natively non-blocking.
    Async,
}

/// Lifecycle status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    /// Terminal.
    Stopped,
}

impl ChannelStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: ChannelStatus) -> bool {
        use ChannelStatus::*;

        matches!(
            (self, target),
            (Uninitialized, Initializing) |
            (Initializing, Ready) | (Initializing, Error) |
            (Ready, Error) | (Error, Ready) |
            // Restart
            (Ready, Initializing) | (Error, Initializing) |
            // Shutdown
            (Uninitialized, Stopped) | (Initializing, Stopped) |
            (Ready, Stopped) | (Error, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// A status the monitor treats as a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Status plus the most recent error, shared by channel implementations.
#[derive(Debug)]
pub struct ChannelState {
    name: String,
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    status: ChannelStatus,
    last_error: Option<String>,
    changed_at: DateTime<Utc>,
}

impl ChannelState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(StateInner {
                status: ChannelStatus::Uninitialized,
                last_error: None,
                changed_at: Utc::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> ChannelStatus {
        self.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn changed_at(&self) -> DateTime<Utc> {
        self.lock().changed_at
    }

    /// Move to `target`. Returns false (and logs) if the transition is invalid.
    pub fn transition_to(&self, target: ChannelStatus) -> bool {
        let mut inner = self.lock();
        if inner.status == target {
            return true;
        }
        if !inner.status.can_transition_to(target) {
            tracing::warn!(
                channel = %self.name,
                from = %inner.status,
                to = %target,
                "Rejected invalid channel status transition"
            );
            return false;
        }
        tracing::debug!(channel = %self.name, from = %inner.status, to = %target, "Channel status changed");
        inner.status = target;
        inner.changed_at = Utc::now();
        if target == ChannelStatus::Ready {
            inner.last_error = None;
        }
        true
    }

    /// Record an error and move to `Error` (unless already stopped).
    pub fn fail(&self, error: &ChannelError) {
        let message = error.to_string();
        tracing::warn!(channel = %self.name, error = %message, "Channel error");
        self.lock().last_error = Some(message);
        self.transition_to(ChannelStatus::Error);
    }

    /// Record an error without changing status (e.g. a single failed send).
    pub fn record_error(&self, error: &ChannelError) {
        let message = error.to_string();
        tracing::warn!(channel = %self.name, error = %message, "Channel operation failed");
        self.lock().last_error = Some(message);
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ChannelStatus::Ready
    }

    /// Apply a health probe result: Ready ⇄ Error.
    pub fn record_health(&self, healthy: bool) {
        match (self.status(), healthy) {
            (ChannelStatus::Error, true) => {
                tracing::info!(channel = %self.name, "Channel recovered");
                self.transition_to(ChannelStatus::Ready);
            }
            (ChannelStatus::Ready, false) => {
                self.fail(&ChannelError::HealthCheckFailed {
                    name: self.name.clone(),
                });
            }
            _ => {}
        }
    }

    /// Error for an operation attempted while not ready.
    pub fn not_ready(&self) -> ChannelError {
        ChannelError::NotReady {
            name: self.name.clone(),
            status: self.status().to_string(),
        }
    }
}

/// Per-send options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// Subject line, for channels that have one.
    pub subject: Option<String>,
    /// Free-form hints (parse mode, reply threading, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SendOptions {
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// A message received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: Uuid,
    pub channel: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl IncomingMessage {
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            user_id: user_id.into(),
            user_name: None,
            content: content.into(),
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of asking a channel to restart itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    Failed,
    /// The channel has no restart capability.
    Unsupported,
}

/// Detailed connectivity report, for channels that keep a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub connected: bool,
    pub status: ChannelStatus,
    pub account: Option<String>,
    pub latency_ms: Option<u64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A pluggable delivery channel.
///
/// Contract methods never return errors: failures are reported as `false`
/// (or an empty list) and recorded in `last_error`.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    fn status(&self) -> ChannelStatus;

    fn last_error(&self) -> Option<String>;

    /// Connect and validate settings. Moves to `Ready` or `Error`.
    async fn initialize(&self) -> bool;

    /// Release resources. Moves to `Stopped`.
    async fn shutdown(&self) -> bool;

    async fn send_message(&self, recipient: &str, message: &str, options: &SendOptions) -> bool;

    async fn receive_messages(&self) -> Vec<IncomingMessage>;

    async fn health_check(&self) -> bool;

    async fn restart(&self) -> RestartOutcome {
        RestartOutcome::Unsupported
    }

    fn connectivity(&self) -> Option<ConnectivityStatus> {
        None
    }
}

/// Split a message into chunks of at most `max_chars` characters.
/// Tries to split on newlines, then spaces, then hard-cuts.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > max_chars {
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map_or(remaining.len(), |(i, _)| i);
        let window = &remaining[..limit];
        let separator = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0);

        match separator {
            // Drop the one separator; keep any indentation that follows it.
            Some(at) => {
                chunks.push(remaining[..at].to_string());
                remaining = &remaining[at + 1..];
            }
            None => {
                chunks.push(remaining[..limit].to_string());
                remaining = &remaining[limit..];
            }
        }
    }

    if !remaining.is_empty() || chunks.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

/// Run one channel operation on its own task, bounded by `timeout`.
///
/// A panic or timeout inside the operation becomes a `ChannelError`, so a
/// misbehaving channel cannot take down a multi-channel call.
pub async fn isolate<F, T>(name: &str, timeout: Duration, fut: F) -> Result<T, ChannelError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(fut);
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ChannelError::Panicked {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => {
            abort.abort();
            Err(ChannelError::Timeout {
                name: name.to_string(),
                timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        use ChannelStatus::*;
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Ready));
        assert!(Initializing.can_transition_to(Error));
        assert!(Ready.can_transition_to(Error));
        assert!(Error.can_transition_to(Ready));
        assert!(Error.can_transition_to(Initializing));
        assert!(Ready.can_transition_to(Stopped));
    }

    #[test]
    fn status_transitions_invalid() {
        use ChannelStatus::*;
        assert!(!Uninitialized.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Initializing));
        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Initializing.can_transition_to(Uninitialized));
    }

    #[test]
    fn only_stopped_is_terminal() {
        assert!(ChannelStatus::Stopped.is_terminal());
        assert!(!ChannelStatus::Error.is_terminal());
        assert!(ChannelStatus::Error.is_failure());
        assert!(!ChannelStatus::Ready.is_failure());
    }

    #[test]
    fn status_display_and_serde() {
        assert_eq!(ChannelStatus::Ready.to_string(), "ready");
        let json = serde_json::to_string(&ChannelStatus::Uninitialized).unwrap();
        assert_eq!(json, "\"uninitialized\"");
        let kind: ChannelKind = serde_json::from_str("\"async\"").unwrap();
        assert_eq!(kind, ChannelKind::Async);
    }

    #[test]
    fn state_reaches_ready_only_through_initializing() {
        let state = ChannelState::new("test");
        assert!(!state.transition_to(ChannelStatus::Ready));
        assert_eq!(state.status(), ChannelStatus::Uninitialized);

        assert!(state.transition_to(ChannelStatus::Initializing));
        assert!(state.transition_to(ChannelStatus::Ready));
        assert!(state.is_ready());
    }

    #[test]
    fn fail_records_error_and_ready_clears_it() {
        let state = ChannelState::new("test");
        state.transition_to(ChannelStatus::Initializing);
        state.fail(&ChannelError::StartupFailed {
            name: "test".into(),
            reason: "connection refused".into(),
        });
        assert_eq!(state.status(), ChannelStatus::Error);
        assert!(state.last_error().unwrap().contains("connection refused"));

        state.transition_to(ChannelStatus::Ready);
        assert!(state.last_error().is_none());
    }

    #[test]
    fn stopped_is_final() {
        let state = ChannelState::new("test");
        assert!(state.transition_to(ChannelStatus::Stopped));
        state.fail(&ChannelError::HealthCheckFailed { name: "test".into() });
        assert_eq!(state.status(), ChannelStatus::Stopped);
    }

    #[test]
    fn split_short_message_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn split_prefers_newlines_then_spaces() {
        let chunks = split_message("first line\nsecond line", 15);
        assert_eq!(chunks, vec!["first line", "second line"]);

        let chunks = split_message("aaaa bbbb cccc", 9);
        assert_eq!(chunks, vec!["aaaa", "bbbb cccc"]);
    }

    #[test]
    fn split_keeps_leading_indentation() {
        let chunks = split_message("fn main() {\n    body();\n}", 12);
        assert_eq!(chunks, vec!["fn main() {", "    body();", "}"]);
    }

    #[test]
    fn split_hard_cuts_without_whitespace() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn split_respects_char_boundaries() {
        let text = "é".repeat(7);
        let chunks = split_message(&text, 3);
        assert_eq!(chunks, vec!["ééé", "ééé", "é"]);
    }

    #[tokio::test]
    async fn isolate_returns_value() {
        let result = isolate("ok", Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn isolate_converts_panic() {
        fn explode() -> bool {
            panic!("kaboom")
        }
        let result = isolate("boom", Duration::from_secs(1), async { explode() }).await;
        assert!(matches!(result, Err(ChannelError::Panicked { .. })));
    }

    #[tokio::test]
    async fn isolate_converts_timeout() {
        let result = isolate("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            true
        })
        .await;
        assert!(matches!(result, Err(ChannelError::Timeout { .. })));
    }
}
