//! Channel orchestrator: owns the live channels and fronts the factory,
//! retry queue, monitor and bridge with a single API.
//!
//! Public operations never return errors: failures come back as `false`,
//! `None` or a per-channel map entry, and are logged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{Local, NaiveTime};
use futures::FutureExt;
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::bridge::Bridge;
use crate::channels::channel::{
    Channel, ChannelStatus, ConnectivityStatus, SendOptions, SharedChannels, isolate,
};
use crate::channels::factory::ChannelFactory;
use crate::channels::monitor::{ChannelHealthReport, ChannelMonitor};
use crate::channels::retry::{QueuedMessage, RetryManager, SendCallback};
use crate::collaborators::Collaborators;
use crate::config::{AppConfig, ChannelConfig};
use crate::error::ChannelError;
use crate::selection::{self, MessageCandidate};

/// Slack on top of a channel's own timeout for the bridged call around it.
const DISPATCH_GRACE: Duration = Duration::from_secs(1);

/// Implementation name whose connectivity report is surfaced.
const DISCORD_IMPLEMENTATION: &str = "discord";

fn read_map(
    channels: &SharedChannels,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Channel>>> {
    channels.read().unwrap_or_else(|e| e.into_inner())
}

fn write_map(
    channels: &SharedChannels,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Channel>>> {
    channels.write().unwrap_or_else(|e| e.into_inner())
}

/// Delivery path shared by direct sends and the retry loop.
#[derive(Clone)]
struct Dispatcher {
    channels: SharedChannels,
    configs: Arc<HashMap<String, ChannelConfig>>,
    monitor: Arc<ChannelMonitor>,
}

impl Dispatcher {
    fn timeout(&self, name: &str) -> Duration {
        self.configs
            .get(name)
            .map_or_else(|| ChannelConfig::default().timeout, |c| c.timeout)
    }

    /// The channel, if it exists and is Ready.
    fn ready_channel(&self, name: &str) -> Option<Arc<dyn Channel>> {
        let Some(channel) = read_map(&self.channels).get(name).cloned() else {
            warn!(channel = name, "Unknown channel; message not sent");
            return None;
        };
        let status = channel.status();
        if status != ChannelStatus::Ready {
            warn!(channel = name, %status, "Channel not ready; message not sent");
            return None;
        }
        Some(channel)
    }

    /// Send once through `channel_name`. Success clears the monitor's failure count.
    async fn deliver(
        self,
        channel_name: String,
        recipient: String,
        message: String,
        options: SendOptions,
    ) -> bool {
        let Some(channel) = self.ready_channel(&channel_name) else {
            return false;
        };

        let timeout = self.timeout(&channel_name);
        let send = async move { channel.send_message(&recipient, &message, &options).await };
        let delivered = match isolate(&channel_name, timeout, send).await {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(channel = %channel_name, error = %e, "Send aborted");
                false
            }
        };

        // A failed send is a delivery failure, not a channel fault: restarts
        // are driven by the monitor's status and health sweep.
        if delivered {
            self.monitor.record_channel_success(&channel_name);
        }
        delivered
    }

    fn retry_callback(&self) -> SendCallback {
        let dispatcher = self.clone();
        Arc::new(move |item: QueuedMessage| {
            dispatcher
                .clone()
                .deliver(
                    item.channel_name,
                    item.recipient,
                    item.message,
                    SendOptions::default(),
                )
                .boxed()
        })
    }
}

/// Coordinates every configured channel.
pub struct ChannelOrchestrator {
    config: AppConfig,
    configs: Arc<HashMap<String, ChannelConfig>>,
    factory: ChannelFactory,
    channels: SharedChannels,
    dispatcher: Dispatcher,
    retry: RetryManager,
    monitor: Arc<ChannelMonitor>,
    bridge: Bridge,
    collaborators: Collaborators,
    lifecycle: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

impl ChannelOrchestrator {
    /// Build an orchestrator. Starts the bridge runtime; channels are not
    /// created until [`start_all`](Self::start_all).
    pub fn new(
        config: AppConfig,
        factory: ChannelFactory,
        collaborators: Collaborators,
    ) -> Result<Self, ChannelError> {
        let configs: Arc<HashMap<String, ChannelConfig>> = Arc::new(
            config
                .channels
                .iter()
                .map(|c| (c.name.clone(), c.clone()))
                .collect(),
        );
        let channels: SharedChannels = Arc::new(RwLock::new(HashMap::new()));
        let monitor = Arc::new(ChannelMonitor::new(config.monitor.clone()));
        let dispatcher = Dispatcher {
            channels: Arc::clone(&channels),
            configs: Arc::clone(&configs),
            monitor: Arc::clone(&monitor),
        };
        let retry = RetryManager::new(
            config.retry.clone(),
            (*configs).clone(),
            dispatcher.retry_callback(),
        );
        let bridge = Bridge::start(config.orchestrator.worker_threads)?;

        Ok(Self {
            config,
            configs,
            factory,
            channels,
            dispatcher,
            retry,
            monitor,
            bridge,
            collaborators,
            lifecycle: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
        })
    }

    /// Orchestrator over the built-in channel catalog and in-memory collaborators.
    pub fn from_config(config: AppConfig) -> Result<Self, ChannelError> {
        let factory = ChannelFactory::from_config(&config);
        Self::new(config, factory, Collaborators::default())
    }

    /// Load [`AppConfig`] from the environment and build from it.
    pub fn load() -> crate::error::Result<Self> {
        let config = AppConfig::load()?;
        Ok(Self::from_config(config)?)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create and initialize every enabled channel, then start the monitor
    /// and retry loops. Idempotent.
    ///
    /// Channels that fail to initialize stay registered in their failed state
    /// so the monitor can restart them.
    pub async fn start_all(&self) -> bool {
        let _guard = self.lifecycle.lock().await;
        if self.started.load(Ordering::SeqCst) {
            debug!("Channel orchestrator already started");
            return true;
        }

        self.factory.initialize_registry();
        let mut created: Vec<(String, Arc<dyn Channel>)> = Vec::new();
        for name in self.factory.registered_channels() {
            let Some(config) = self.configs.get(&name) else {
                continue;
            };
            if let Some(channel) = self.factory.create_channel(&name, config) {
                created.push((name, channel));
            }
        }

        {
            let mut map = write_map(&self.channels);
            for (name, channel) in &created {
                map.insert(name.clone(), Arc::clone(channel));
            }
        }

        let timeout = self.config.orchestrator.lifecycle_timeout;
        let inits = created.into_iter().map(|(name, channel)| async move {
            let probe = Arc::clone(&channel);
            let result = self
                .bridge
                .run(&name, timeout, async move { probe.initialize().await })
                .await;
            (name, channel, result)
        });

        for (name, channel, result) in join_all(inits).await {
            match result {
                Ok(true) => info!(channel = %name, kind = ?channel.kind(), "Channel started"),
                Ok(false) => warn!(
                    channel = %name,
                    error = channel.last_error().as_deref().unwrap_or("unknown"),
                    "Channel failed to initialize"
                ),
                Err(e) => error!(channel = %name, error = %e, "Channel initialization aborted"),
            }
        }

        self.monitor.set_channels(&self.channels);
        self.monitor.start_restart_monitor(self.bridge.handle());
        self.retry.start_retry_thread(self.bridge.handle());
        self.started.store(true, Ordering::SeqCst);

        info!(
            active = ?self.get_active_channels(),
            configured = self.configs.len(),
            "Channel orchestrator started"
        );
        true
    }

    /// Stop the background loops, shut every channel down and clear the map.
    /// Idempotent.
    pub async fn stop_all(&self) -> bool {
        let _guard = self.lifecycle.lock().await;
        let join_timeout = self.config.orchestrator.join_timeout;
        self.monitor.stop_restart_monitor(join_timeout).await;
        self.retry.stop_retry_thread(join_timeout).await;

        let channels: Vec<(String, Arc<dyn Channel>)> = write_map(&self.channels).drain().collect();
        let timeout = self.config.orchestrator.lifecycle_timeout;
        let shutdowns = channels.into_iter().map(|(name, channel)| async move {
            let result = self
                .bridge
                .run(&name, timeout, async move { channel.shutdown().await })
                .await;
            (name, result)
        });

        for (name, result) in join_all(shutdowns).await {
            match result {
                Ok(true) => debug!(channel = %name, "Channel stopped"),
                Ok(false) => warn!(channel = %name, "Channel reported an unclean shutdown"),
                Err(e) => error!(channel = %name, error = %e, "Channel shutdown aborted"),
            }
        }

        if self.started.swap(false, Ordering::SeqCst) {
            info!("Channel orchestrator stopped");
        }
        true
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Send from synchronous code, blocking only the calling thread.
    ///
    /// Returns false without contacting the channel if it is unknown or not
    /// Ready. Failures are not queued for retry; use
    /// [`queue_failed_message`](Self::queue_failed_message) for that.
    pub fn send_message_sync(
        &self,
        channel: &str,
        recipient: &str,
        message: &str,
        options: SendOptions,
    ) -> bool {
        let timeout = self.dispatcher.timeout(channel).saturating_add(DISPATCH_GRACE);
        let delivery = self.dispatcher.clone().deliver(
            channel.to_string(),
            recipient.to_string(),
            message.to_string(),
            options,
        );
        match self.bridge.run_blocking(channel, timeout, delivery) {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(channel, error = %e, "Synchronous send failed");
                false
            }
        }
    }

    /// Send from async code. Same semantics as [`send_message_sync`](Self::send_message_sync).
    pub async fn send_message(&self, channel: &str, recipient: &str, message: &str) -> bool {
        self.send_with_options(channel, recipient, message, SendOptions::default())
            .await
    }

    async fn send_with_options(
        &self,
        channel: &str,
        recipient: &str,
        message: &str,
        options: SendOptions,
    ) -> bool {
        let timeout = self.dispatcher.timeout(channel).saturating_add(DISPATCH_GRACE);
        let delivery = self.dispatcher.clone().deliver(
            channel.to_string(),
            recipient.to_string(),
            message.to_string(),
            options,
        );
        match self.bridge.run(channel, timeout, delivery).await {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(channel, error = %e, "Send failed");
                false
            }
        }
    }

    /// Send `message` to every `channel → recipient` entry concurrently.
    ///
    /// Every entry gets a result, even if its channel panics or hangs.
    pub async fn broadcast_message(
        &self,
        targets: &HashMap<String, String>,
        message: &str,
    ) -> HashMap<String, bool> {
        let sends = targets.iter().map(|(channel, recipient)| async move {
            let delivered = self.send_message(channel, recipient, message).await;
            (channel.clone(), delivered)
        });
        let results: HashMap<String, bool> = join_all(sends).await.into_iter().collect();

        let delivered = results.values().filter(|ok| **ok).count();
        info!(delivered, total = results.len(), "Broadcast finished");
        results
    }

    /// Queue a failed delivery for the retry loop.
    pub fn queue_failed_message(
        &self,
        user_id: &str,
        category: &str,
        message: &str,
        recipient: &str,
        channel_name: &str,
    ) -> Uuid {
        self.retry
            .queue_failed_message(user_id, category, message, recipient, channel_name)
    }

    // ── Status ──────────────────────────────────────────────────────

    pub fn get_channel_status(&self, name: &str) -> Option<ChannelStatus> {
        read_map(&self.channels).get(name).map(|c| c.status())
    }

    pub fn get_all_statuses(&self) -> HashMap<String, ChannelStatus> {
        read_map(&self.channels)
            .iter()
            .map(|(name, channel)| (name.clone(), channel.status()))
            .collect()
    }

    /// Run every channel's health check concurrently.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let channels: Vec<(String, Arc<dyn Channel>)> = read_map(&self.channels)
            .iter()
            .map(|(name, channel)| (name.clone(), Arc::clone(channel)))
            .collect();

        let checks = channels.into_iter().map(|(name, channel)| async move {
            let timeout = self.dispatcher.timeout(&name);
            let healthy = self
                .bridge
                .run(&name, timeout, async move { channel.health_check().await })
                .await
                .unwrap_or_else(|e| {
                    warn!(channel = %name, error = %e, "Health check aborted");
                    false
                });
            (name, healthy)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Names of Ready channels, sorted.
    pub fn get_active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = read_map(&self.channels)
            .iter()
            .filter(|(_, channel)| channel.status() == ChannelStatus::Ready)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every configured channel name, enabled or not, in configuration order.
    pub fn get_configured_channels(&self) -> Vec<String> {
        self.config.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get_registered_channels(&self) -> Vec<String> {
        self.factory.registered_channels()
    }

    /// Connectivity report of the Discord channel, if one is running.
    pub fn get_discord_connectivity_status(&self) -> Option<ConnectivityStatus> {
        let map = read_map(&self.channels);
        let mut names: Vec<&String> = map
            .keys()
            .filter(|name| {
                self.configs
                    .get(name.as_str())
                    .is_some_and(|c| c.implementation() == DISCORD_IMPLEMENTATION)
            })
            .collect();
        names.sort();
        names
            .first()
            .and_then(|name| map.get(name.as_str()))
            .and_then(|channel| channel.connectivity())
    }

    pub async fn channel_health(&self) -> HashMap<String, ChannelHealthReport> {
        self.monitor.get_channel_health_status().await
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    pub fn monitor(&self) -> &ChannelMonitor {
        &self.monitor
    }

    // ── User-facing sends ───────────────────────────────────────────

    /// Remind `user_id` about a task over their preferred channel.
    pub fn handle_task_reminder(&self, user_id: &str, task_id: &str) -> bool {
        let Some(target) = self.collaborators.preferences.delivery_target(user_id) else {
            warn!(user_id, "No delivery preference; reminder not sent");
            return false;
        };
        let Some(title) = self.collaborators.tasks.task_title(user_id, task_id) else {
            warn!(user_id, task_id, "Unknown task; reminder not sent");
            return false;
        };

        let message = format!("Reminder: {title}");
        let options = SendOptions::default().with_subject(format!("Task reminder: {title}"));
        let sent = self.send_message_sync(&target.channel, &target.recipient, &message, options);
        info!(user_id, task_id, channel = %target.channel, sent, "Task reminder");
        sent
    }

    /// Send a `category` message (check-in, motivation, ...) to `user_id`.
    pub fn handle_message_sending(&self, user_id: &str, category: &str) -> bool {
        self.send_category_message(user_id, category, Local::now().time())
    }

    fn send_category_message(&self, user_id: &str, category: &str, now: NaiveTime) -> bool {
        let Some(target) = self.collaborators.preferences.delivery_target(user_id) else {
            warn!(user_id, category, "No delivery preference; message not sent");
            return false;
        };

        let windows = self.collaborators.preferences.delivery_windows(user_id);
        let periods = selection::matching_periods(&windows, now);
        let candidates = self.collaborators.messages.candidates(category);
        let message = self.select_weighted_message(&candidates, &periods);
        if message.is_empty() {
            warn!(user_id, category, ?periods, "No message available for category");
            return false;
        }

        let options = SendOptions::default().with_subject(category);
        let sent = self.send_message_sync(&target.channel, &target.recipient, &message, options);
        info!(user_id, category, channel = %target.channel, sent, "Category message");
        sent
    }

    pub fn select_weighted_message(
        &self,
        candidates: &[MessageCandidate],
        matching_periods: &[String],
    ) -> String {
        selection::select_weighted_message(candidates, matching_periods)
    }
}

impl Drop for ChannelOrchestrator {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            warn!("Channel orchestrator dropped without stop_all");
        }
        self.bridge.shutdown();
    }
}
