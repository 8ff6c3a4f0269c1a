//! Start/stop lifecycle for a periodic background loop.
//!
//! Both the retry manager and the channel monitor run one of these. The loop
//! is either `Stopped` or `Running`; transitions happen under a mutex so
//! concurrent `start`/`stop` calls cannot spawn a second task.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

enum LoopState {
    Stopped,
    Running {
        stop_tx: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
}

/// A named periodic loop with idempotent start/stop.
pub struct BackgroundLoop {
    name: &'static str,
    state: Mutex<LoopState>,
}

impl BackgroundLoop {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LoopState::Stopped),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        match &*self.lock() {
            LoopState::Running { task, .. } => !task.is_finished(),
            LoopState::Stopped => false,
        }
    }

    /// Spawn the loop on `handle`, calling `tick` every `interval`.
    ///
    /// Returns false if the loop was already running.
    pub fn start<F, Fut>(&self, handle: &Handle, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        if let LoopState::Running { task, .. } = &*state
            && !task.is_finished()
        {
            tracing::debug!(task = self.name, "Background loop already running");
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let name = self.name;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            tracing::info!(task = name, interval_secs = interval.as_secs(), "Background loop started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        tick().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(task = name, "Background loop stopped");
        });

        *state = LoopState::Running { stop_tx, task };
        true
    }

    /// Signal the loop to stop and wait up to `join_timeout` for it to exit.
    ///
    /// Returns false if the loop was not running.
    pub async fn stop(&self, join_timeout: Duration) -> bool {
        let previous = std::mem::replace(&mut *self.lock(), LoopState::Stopped);
        let LoopState::Running { stop_tx, task } = previous else {
            return false;
        };

        let _ = stop_tx.send(true);
        let abort = task.abort_handle();
        match tokio::time::timeout(join_timeout, task).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    task = self.name,
                    timeout_secs = join_timeout.as_secs(),
                    "Background loop did not stop in time; aborting"
                );
                abort.abort();
            }
        }
        true
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        if let LoopState::Running { task, .. } = &*self.lock() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn start_is_idempotent() {
        let runner = BackgroundLoop::new("test");
        let handle = Handle::current();
        assert!(runner.start(&handle, Duration::from_secs(60), || async {}));
        assert!(!runner.start(&handle, Duration::from_secs(60), || async {}));
        assert!(runner.is_running());
        assert!(runner.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let runner = BackgroundLoop::new("test");
        assert!(!runner.stop(Duration::from_secs(1)).await);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn ticks_until_stopped_and_can_restart() {
        let runner = BackgroundLoop::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        runner.start(&Handle::current(), Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(runner.stop(Duration::from_secs(1)).await);
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1, "expected at least one tick, got {seen}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);

        assert!(runner.start(&Handle::current(), Duration::from_secs(60), || async {}));
        assert!(runner.stop(Duration::from_secs(1)).await);
    }
}
