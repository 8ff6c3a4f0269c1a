//! Sync/async bridge: a dedicated runtime thread for channel work.
//!
//! Synchronous callers hand a future to the bridge and block only their own
//! thread on the result. Async callers use [`Bridge::run`], which executes on
//! the same runtime so channel work never lands on the caller's executor.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::channels::channel::isolate;
use crate::error::ChannelError;

/// Extra time a blocking caller waits beyond the operation timeout, so the
/// timeout inside the runtime fires first.
const BLOCKING_GRACE: Duration = Duration::from_millis(250);

struct BridgeThread {
    shutdown_tx: oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

/// Owns a multi-threaded tokio runtime on its own OS thread.
pub struct Bridge {
    handle: Handle,
    thread: Mutex<Option<BridgeThread>>,
}

impl Bridge {
    /// Start the bridge runtime with `worker_threads` workers.
    pub fn start(worker_threads: usize) -> Result<Self, ChannelError> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("channel-bridge".into())
            .spawn(move || {
                let runtime = match Builder::new_multi_thread()
                    .worker_threads(worker_threads.max(1))
                    .thread_name("channel-worker")
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(Duration::from_secs(5));
                tracing::debug!("Channel bridge runtime shut down");
            })
            .map_err(|e| ChannelError::BridgeUnavailable(e.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|e| ChannelError::BridgeUnavailable(e.to_string()))?
            .map_err(ChannelError::BridgeUnavailable)?;

        tracing::info!(worker_threads, "Channel bridge runtime started");
        Ok(Self {
            handle,
            thread: Mutex::new(Some(BridgeThread {
                shutdown_tx,
                thread,
            })),
        })
    }

    /// Handle to the bridge runtime, for spawning background loops.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `fut` on the bridge and wait for it from async code.
    pub async fn run<F, T>(&self, name: &str, timeout: Duration, fut: F) -> Result<T, ChannelError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let label = name.to_string();
        self.handle
            .spawn(async move { isolate(&label, timeout, fut).await })
            .await
            .map_err(|e| ChannelError::Panicked {
                name: name.to_string(),
                reason: e.to_string(),
            })?
    }

    /// Run `fut` on the bridge and block the calling thread until it finishes.
    ///
    /// Safe to call from any thread, including a tokio worker of another
    /// runtime; only the calling thread blocks.
    pub fn run_blocking<F, T>(&self, name: &str, timeout: Duration, fut: F) -> Result<T, ChannelError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let label = name.to_string();
        self.handle.spawn(async move {
            let result = isolate(&label, timeout, fut).await;
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout.saturating_add(BLOCKING_GRACE)) {
            Ok(result) => result,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(ChannelError::Timeout {
                name: name.to_string(),
                timeout,
            }),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(
                ChannelError::BridgeUnavailable("bridge runtime dropped the task".into()),
            ),
        }
    }

    /// Stop the runtime thread. Idempotent.
    pub fn shutdown(&self) {
        let taken = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(BridgeThread {
            shutdown_tx,
            thread,
        }) = taken
        {
            let _ = shutdown_tx.send(());
            // The runtime thread joins its own workers; detach if called from
            // inside the bridge to avoid joining ourselves.
            if std::thread::current().id() != thread.thread().id() && Handle::try_current().is_err() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_blocking_returns_result() {
        let bridge = Bridge::start(1).unwrap();
        let value = bridge
            .run_blocking("test", Duration::from_secs(1), async { 41 + 1 })
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn run_blocking_times_out() {
        let bridge = Bridge::start(1).unwrap();
        let result = bridge.run_blocking("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        assert!(matches!(result, Err(ChannelError::Timeout { .. })));
    }

    #[test]
    fn run_blocking_works_from_many_threads() {
        let bridge = std::sync::Arc::new(Bridge::start(2).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bridge = std::sync::Arc::clone(&bridge);
                std::thread::spawn(move || {
                    bridge
                        .run_blocking("test", Duration::from_secs(1), async move { i * 2 })
                        .unwrap()
                })
            })
            .collect();
        let total: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, (0..8).map(|i| i * 2).sum::<i32>());
    }

    #[test]
    fn run_blocking_accepts_unbounded_timeout() {
        let bridge = Bridge::start(1).unwrap();
        let value = bridge
            .run_blocking("test", Duration::MAX, async { 7_i32 })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn run_from_async_context() {
        let bridge = Bridge::start(1).unwrap();
        let value = bridge
            .run("test", Duration::from_secs(1), async { "ok" })
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[test]
    fn shutdown_is_idempotent() {
        let bridge = Bridge::start(1).unwrap();
        bridge.shutdown();
        bridge.shutdown();
    }
}
