//! Retry manager: background queue that re-attempts failed deliveries.
//!
//! Call sites decide when a failure is worth retrying and call
//! [`RetryManager::queue_failed_message`]. A background loop hands due items
//! to an injected send callback and applies exponential backoff between
//! attempts, dropping an item once it exceeds its channel's `max_retries`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::lifecycle::BackgroundLoop;
use crate::config::{ChannelConfig, RetryConfig};

/// A delivery waiting to be retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub user_id: String,
    pub category: String,
    pub message: String,
    pub recipient: String,
    pub channel_name: String,
    pub enqueue_time: DateTime<Utc>,
    pub retry_count: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(
        user_id: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
        recipient: impl Into<String>,
        channel_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            category: category.into(),
            message: message.into(),
            recipient: recipient.into(),
            channel_name: channel_name.into(),
            enqueue_time: now,
            retry_count: 0,
            next_attempt_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }
}

/// Delivers one queued message. Returns true on success.
pub type SendCallback = Arc<dyn Fn(QueuedMessage) -> BoxFuture<'static, bool> + Send + Sync>;

/// Outcome counts for one pass over the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPass {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub deferred: usize,
}

/// Background retry queue.
pub struct RetryManager {
    queue: Arc<Mutex<VecDeque<QueuedMessage>>>,
    policies: Arc<HashMap<String, ChannelConfig>>,
    send_callback: SendCallback,
    config: RetryConfig,
    runner: BackgroundLoop,
}

impl RetryManager {
    /// Create a retry manager. `policies` supplies per-channel retry limits.
    pub fn new(
        config: RetryConfig,
        policies: HashMap<String, ChannelConfig>,
        send_callback: SendCallback,
    ) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            policies: Arc::new(policies),
            send_callback,
            config,
            runner: BackgroundLoop::new("retry-manager"),
        }
    }

    /// Queue a failed delivery for retry.
    pub fn queue_failed_message(
        &self,
        user_id: &str,
        category: &str,
        message: &str,
        recipient: &str,
        channel_name: &str,
    ) -> Uuid {
        let item = QueuedMessage::new(user_id, category, message, recipient, channel_name);
        let id = item.id;
        info!(
            message_id = %id,
            user_id,
            channel = channel_name,
            category,
            "Queued failed message for retry"
        );
        lock(&self.queue).push_back(item);
        id
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Snapshot of queued messages, oldest first.
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        lock(&self.queue).iter().cloned().collect()
    }

    /// Drop everything in the queue. Returns the number removed.
    pub fn clear_queue(&self) -> usize {
        let mut queue = lock(&self.queue);
        let count = queue.len();
        queue.clear();
        count
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// Start the retry loop on `handle`. No-op if already running.
    pub fn start_retry_thread(&self, handle: &Handle) -> bool {
        let queue = Arc::clone(&self.queue);
        let policies = Arc::clone(&self.policies);
        let callback = Arc::clone(&self.send_callback);
        self.runner.start(handle, self.config.interval, move || {
            let queue = Arc::clone(&queue);
            let policies = Arc::clone(&policies);
            let callback = Arc::clone(&callback);
            async move {
                process_queue(&queue, &policies, &callback).await;
            }
        })
    }

    /// Stop the retry loop, waiting up to `join_timeout`. No-op if stopped.
    pub async fn stop_retry_thread(&self, join_timeout: Duration) -> bool {
        self.runner.stop(join_timeout).await
    }

    /// Run one pass over the queue now.
    pub async fn process_retry_queue(&self) -> RetryPass {
        process_queue(&self.queue, &self.policies, &self.send_callback).await
    }
}

fn lock(queue: &Mutex<VecDeque<QueuedMessage>>) -> std::sync::MutexGuard<'_, VecDeque<QueuedMessage>> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

async fn process_queue(
    queue: &Mutex<VecDeque<QueuedMessage>>,
    policies: &HashMap<String, ChannelConfig>,
    callback: &SendCallback,
) -> RetryPass {
    // Take a snapshot so producers are never blocked by delivery.
    let batch: Vec<QueuedMessage> = lock(queue).drain(..).collect();
    let mut pass = RetryPass::default();
    if batch.is_empty() {
        return pass;
    }

    debug!(count = batch.len(), "Processing retry queue");
    let default_policy = ChannelConfig::default();
    let mut keep = Vec::new();

    for mut item in batch {
        let now = Utc::now();
        if !item.is_due(now) {
            pass.deferred += 1;
            keep.push(item);
            continue;
        }

        if callback(item.clone()).await {
            info!(
                message_id = %item.id,
                channel = %item.channel_name,
                retry_count = item.retry_count,
                "Retried message delivered"
            );
            pass.delivered += 1;
            continue;
        }

        let policy = policies.get(&item.channel_name).unwrap_or(&default_policy);
        let delay = policy.backoff_delay(item.retry_count);
        item.retry_count += 1;

        if item.retry_count > policy.max_retries {
            warn!(
                message_id = %item.id,
                user_id = %item.user_id,
                channel = %item.channel_name,
                retry_count = item.retry_count,
                max_retries = policy.max_retries,
                "Message permanently failed; dropping"
            );
            pass.dropped += 1;
            continue;
        }

        item.next_attempt_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        debug!(
            message_id = %item.id,
            channel = %item.channel_name,
            retry_count = item.retry_count,
            delay_secs = delay.as_secs_f64(),
            "Retry failed; requeued with backoff"
        );
        pass.requeued += 1;
        keep.push(item);
    }

    if !keep.is_empty() {
        let mut queue = lock(queue);
        // Items queued during this pass go after the survivors.
        for item in keep.into_iter().rev() {
            queue.push_front(item);
        }
    }

    if pass.delivered + pass.dropped + pass.requeued > 0 {
        info!(
            delivered = pass.delivered,
            requeued = pass.requeued,
            dropped = pass.dropped,
            deferred = pass.deferred,
            "Retry pass complete"
        );
    }
    pass
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    fn callback_returning(result: Arc<AtomicBool>, calls: Arc<AtomicUsize>) -> SendCallback {
        Arc::new(move |_msg| {
            let result = Arc::clone(&result);
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                result.load(Ordering::SeqCst)
            })
        })
    }

    fn immediate_policy(name: &str, max_retries: u32) -> HashMap<String, ChannelConfig> {
        let config = ChannelConfig::new(name)
            .with_max_retries(max_retries)
            .with_retry_delay(Duration::ZERO);
        HashMap::from([(name.to_string(), config)])
    }

    #[tokio::test]
    async fn successful_tick_empties_queue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = RetryManager::new(
            RetryConfig::default(),
            immediate_policy("alpha", 2),
            callback_returning(Arc::new(AtomicBool::new(true)), Arc::clone(&calls)),
        );

        manager.queue_failed_message("u1", "motivational", "hi", "u1", "alpha");
        assert_eq!(manager.queue_size(), 1);

        let pass = manager.process_retry_queue().await;
        assert_eq!(pass.delivered, 1);
        assert_eq!(manager.queue_size(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_requeues_with_incremented_count() {
        let manager = RetryManager::new(
            RetryConfig::default(),
            immediate_policy("alpha", 2),
            callback_returning(Arc::new(AtomicBool::new(false)), Arc::new(AtomicUsize::new(0))),
        );
        manager.queue_failed_message("u1", "motivational", "hi", "u1", "alpha");

        let pass = manager.process_retry_queue().await;
        assert_eq!(pass.requeued, 1);
        let queued = manager.queued_messages();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 1);
    }

    #[tokio::test]
    async fn exceeding_max_retries_drops_message() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = RetryManager::new(
            RetryConfig::default(),
            immediate_policy("alpha", 2),
            callback_returning(Arc::new(AtomicBool::new(false)), Arc::clone(&calls)),
        );
        manager.queue_failed_message("u1", "motivational", "hi", "u1", "alpha");

        manager.process_retry_queue().await; // retry_count 1
        manager.process_retry_queue().await; // retry_count 2
        assert_eq!(manager.queue_size(), 1);

        let pass = manager.process_retry_queue().await; // 3 > 2
        assert_eq!(pass.dropped, 1);
        assert_eq!(manager.queue_size(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_defers_until_due() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = ChannelConfig::new("slow").with_retry_delay(Duration::from_secs(60));
        let manager = RetryManager::new(
            RetryConfig::default(),
            HashMap::from([("slow".to_string(), policy)]),
            callback_returning(Arc::new(AtomicBool::new(false)), Arc::clone(&calls)),
        );
        manager.queue_failed_message("u1", "reminder", "hi", "u1", "slow");

        manager.process_retry_queue().await;
        let item = &manager.queued_messages()[0];
        assert!(item.next_attempt_at > Utc::now() + chrono::Duration::seconds(50));

        let pass = manager.process_retry_queue().await;
        assert_eq!(pass.deferred, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_channel_uses_default_policy() {
        let manager = RetryManager::new(
            RetryConfig::default(),
            HashMap::new(),
            callback_returning(Arc::new(AtomicBool::new(false)), Arc::new(AtomicUsize::new(0))),
        );
        manager.queue_failed_message("u1", "reminder", "hi", "u1", "nowhere");
        manager.process_retry_queue().await;

        let item = &manager.queued_messages()[0];
        assert_eq!(item.retry_count, 1);
        assert!(!item.is_due(Utc::now()));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let manager = RetryManager::new(
            RetryConfig::default(),
            HashMap::new(),
            callback_returning(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0))),
        );
        let handle = Handle::current();
        assert!(manager.start_retry_thread(&handle));
        assert!(!manager.start_retry_thread(&handle));
        assert!(manager.is_running());

        assert!(manager.stop_retry_thread(Duration::from_secs(1)).await);
        assert!(!manager.stop_retry_thread(Duration::from_secs(1)).await);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn background_loop_delivers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = RetryManager::new(
            RetryConfig {
                interval: Duration::from_millis(10),
            },
            HashMap::new(),
            callback_returning(Arc::new(AtomicBool::new(true)), Arc::clone(&calls)),
        );
        manager.queue_failed_message("u1", "reminder", "hi", "u1", "email");
        manager.start_retry_thread(&Handle::current());

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop_retry_thread(Duration::from_secs(1)).await;
        assert_eq!(manager.queue_size(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_queue_reports_count() {
        let manager = RetryManager::new(
            RetryConfig::default(),
            HashMap::new(),
            callback_returning(Arc::new(AtomicBool::new(true)), Arc::new(AtomicUsize::new(0))),
        );
        manager.queue_failed_message("u1", "a", "x", "u1", "email");
        manager.queue_failed_message("u2", "b", "y", "u2", "email");
        assert_eq!(manager.clear_queue(), 2);
        assert_eq!(manager.queue_size(), 0);
    }
}
