//! Channel monitor: periodic health sweep with gated restarts.
//!
//! Failure counters and restart timestamps live here and nowhere else. A
//! restart is only issued once a channel has accumulated
//! `max_consecutive_failures`, and never twice inside `restart_cooldown`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::channels::channel::{
    Channel, ChannelStatus, RestartOutcome, SharedChannels, isolate,
};
use crate::channels::lifecycle::BackgroundLoop;
use crate::config::MonitorConfig;

type ChannelMap = RwLock<HashMap<String, Arc<dyn Channel>>>;

/// Upper bound on a single restart.
const RESTART_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-channel failure tracking.
#[derive(Debug, Clone, Default)]
struct ChannelHealth {
    failure_count: u32,
    last_restart_attempt: Option<DateTime<Utc>>,
}

/// Health snapshot for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealthReport {
    pub name: String,
    pub failure_count: u32,
    pub last_restart_attempt: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    pub status: Option<ChannelStatus>,
    pub error: Option<String>,
}

struct MonitorState {
    config: MonitorConfig,
    channels: RwLock<Weak<ChannelMap>>,
    health: Mutex<HashMap<String, ChannelHealth>>,
}

/// Health-checks channels and restarts unhealthy ones.
pub struct ChannelMonitor {
    state: Arc<MonitorState>,
    runner: BackgroundLoop,
}

impl ChannelMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            state: Arc::new(MonitorState {
                config,
                channels: RwLock::new(Weak::new()),
                health: Mutex::new(HashMap::new()),
            }),
            runner: BackgroundLoop::new("channel-monitor"),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.state.config
    }

    /// Point the monitor at the orchestrator's live channel map.
    ///
    /// Only a weak reference is kept; the orchestrator owns the channels.
    pub fn set_channels(&self, channels: &SharedChannels) {
        *self
            .state
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(channels);
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// Start the periodic sweep on `handle`. No-op if already running.
    pub fn start_restart_monitor(&self, handle: &Handle) -> bool {
        let state = Arc::clone(&self.state);
        self.runner
            .start(handle, self.state.config.check_interval, move || {
                let state = Arc::clone(&state);
                async move {
                    state.check_and_restart_stuck_channels().await;
                }
            })
    }

    /// Stop the sweep, waiting up to `join_timeout`. No-op if stopped.
    pub async fn stop_restart_monitor(&self, join_timeout: Duration) -> bool {
        self.runner.stop(join_timeout).await
    }

    /// Check every channel once and restart the unhealthy ones.
    pub async fn check_and_restart_stuck_channels(&self) {
        self.state.check_and_restart_stuck_channels().await;
    }

    /// Count a failure; restart once the threshold is reached.
    ///
    /// Returns true if a restart was issued and succeeded.
    pub async fn record_channel_failure(&self, name: &str) -> bool {
        self.state.record_channel_failure(name).await
    }

    /// Reset the failure counter after a successful operation.
    pub fn record_channel_success(&self, name: &str) {
        self.state.record_channel_success(name);
    }

    /// Restart `name` if the cooldown and failure threshold allow it.
    ///
    /// Returns true if a restart was issued and succeeded.
    pub async fn attempt_channel_restart(&self, name: &str) -> bool {
        self.state.attempt_channel_restart(name).await
    }

    pub async fn get_channel_health_status(&self) -> HashMap<String, ChannelHealthReport> {
        self.state.get_channel_health_status().await
    }

    /// Reset counters for one channel, or all channels when `name` is None.
    pub fn reset_channel_failures(&self, name: Option<&str>) {
        let mut health = self.state.lock_health();
        match name {
            Some(name) => {
                if let Some(entry) = health.get_mut(name) {
                    entry.failure_count = 0;
                    entry.last_restart_attempt = None;
                }
                info!(channel = name, "Channel failure counters reset");
            }
            None => {
                health.clear();
                info!("All channel failure counters reset");
            }
        }
    }

    pub fn failure_count(&self, name: &str) -> u32 {
        self.state
            .lock_health()
            .get(name)
            .map_or(0, |h| h.failure_count)
    }
}

impl MonitorState {
    fn lock_health(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChannelHealth>> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channels(&self) -> Option<Arc<ChannelMap>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Channel>)> {
        let Some(map) = self.channels() else {
            return Vec::new();
        };
        let map = map.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = map
            .iter()
            .map(|(name, ch)| (name.clone(), Arc::clone(ch)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn Channel>> {
        let map = self.channels()?;
        let map = map.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    fn in_cooldown(&self, entry: &ChannelHealth, now: DateTime<Utc>) -> bool {
        let Some(last) = entry.last_restart_attempt else {
            return false;
        };
        let cooldown = chrono::Duration::from_std(self.config.restart_cooldown)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        now.signed_duration_since(last) < cooldown
    }

    async fn check_and_restart_stuck_channels(&self) {
        let channels = self.snapshot();
        debug!(count = channels.len(), "Running channel health sweep");

        for (name, channel) in channels {
            let status = channel.status();
            if status.is_terminal() {
                continue;
            }

            let healthy = if status.is_failure() {
                false
            } else {
                let probe = Arc::clone(&channel);
                match isolate(&name, self.config.check_interval, async move {
                    probe.health_check().await
                })
                .await
                {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        error!(channel = %name, error = %e, "Health check raised during sweep");
                        false
                    }
                }
            };

            if healthy {
                continue;
            }

            warn!(channel = %name, status = %status, "Channel unhealthy");
            self.attempt_channel_restart(&name).await;
        }
    }

    async fn record_channel_failure(&self, name: &str) -> bool {
        let restart = {
            let mut health = self.lock_health();
            let now = Utc::now();
            let entry = health.entry(name.to_string()).or_default();
            entry.failure_count += 1;
            debug!(channel = name, failures = entry.failure_count, "Channel failure recorded");

            if entry.failure_count < self.config.max_consecutive_failures {
                false
            } else if self.in_cooldown(entry, now) {
                debug!(channel = name, "Restart suppressed: cooldown active");
                false
            } else {
                entry.last_restart_attempt = Some(now);
                true
            }
        };

        if restart {
            self.restart_channel(name).await
        } else {
            false
        }
    }

    fn record_channel_success(&self, name: &str) {
        let mut health = self.lock_health();
        if let Some(entry) = health.get_mut(name)
            && entry.failure_count > 0
        {
            debug!(channel = name, "Channel recovered; failure count reset");
            entry.failure_count = 0;
        }
    }

    async fn attempt_channel_restart(&self, name: &str) -> bool {
        let restart = {
            let mut health = self.lock_health();
            let now = Utc::now();
            let entry = health.entry(name.to_string()).or_default();

            if self.in_cooldown(entry, now) {
                debug!(channel = name, "Skipping restart: cooldown active");
                return false;
            }

            entry.failure_count += 1;
            if entry.failure_count < self.config.max_consecutive_failures {
                debug!(
                    channel = name,
                    failures = entry.failure_count,
                    threshold = self.config.max_consecutive_failures,
                    "Restart deferred until failure threshold"
                );
                false
            } else {
                entry.last_restart_attempt = Some(now);
                true
            }
        };

        if restart {
            self.restart_channel(name).await
        } else {
            false
        }
    }

    /// Issue the restart. The attempt timestamp is already recorded.
    async fn restart_channel(&self, name: &str) -> bool {
        let Some(channel) = self.lookup(name) else {
            warn!(channel = name, "Cannot restart unknown channel");
            return false;
        };

        info!(channel = name, "Attempting channel restart");
        let outcome = match isolate(name, RESTART_TIMEOUT, async move { channel.restart().await }).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(channel = name, error = %e, "Channel restart raised");
                RestartOutcome::Failed
            }
        };

        match outcome {
            RestartOutcome::Restarted => {
                if let Some(entry) = self.lock_health().get_mut(name) {
                    entry.failure_count = 0;
                }
                info!(channel = name, "Channel restarted");
                true
            }
            RestartOutcome::Failed => {
                warn!(channel = name, "Channel restart failed");
                false
            }
            RestartOutcome::Unsupported => {
                warn!(channel = name, "Channel has no restart capability; skipping");
                false
            }
        }
    }

    async fn get_channel_health_status(&self) -> HashMap<String, ChannelHealthReport> {
        let channels = self.snapshot();
        let counters = self.lock_health().clone();
        let mut reports = HashMap::with_capacity(channels.len());

        for (name, channel) in channels {
            let tracked = counters.get(&name).cloned().unwrap_or_default();
            let probe = Arc::clone(&channel);
            let checked = isolate(&name, self.config.check_interval, async move {
                let status = probe.status();
                let healthy = status == ChannelStatus::Ready && probe.health_check().await;
                (status, healthy, probe.last_error())
            })
            .await;

            let report = match checked {
                Ok((status, is_healthy, last_error)) => ChannelHealthReport {
                    name: name.clone(),
                    failure_count: tracked.failure_count,
                    last_restart_attempt: tracked.last_restart_attempt,
                    is_healthy,
                    status: Some(status),
                    error: if is_healthy { None } else { last_error },
                },
                Err(e) => ChannelHealthReport {
                    name: name.clone(),
                    failure_count: tracked.failure_count,
                    last_restart_attempt: tracked.last_restart_attempt,
                    is_healthy: false,
                    status: None,
                    error: Some(e.to_string()),
                },
            };
            reports.insert(name, report);
        }

        reports
    }
}
