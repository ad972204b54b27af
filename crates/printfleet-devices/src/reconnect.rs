//! Reconnection manager.
//!
//! Bounds each handshake with a timeout and, after a failure or a lost
//! session, retries on a fixed interval until one attempt succeeds. At most
//! one retry loop runs per manager: scheduling while a loop is active is a
//! no-op, so repeated loss reports never restart the timer.

use crate::adapter::{AdapterError, AdapterResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Race `fut` against `timeout`.
pub async fn handshake<T, F>(timeout: Duration, fut: F) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::HandshakeTimeout(timeout.as_millis() as u64)),
    }
}

/// Fixed-interval retry loop.
pub struct ReconnectionManager {
    device_id: String,
    /// Generation of the running loop, 0 when idle
    active: Arc<AtomicU64>,
    generation: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectionManager {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            active: Arc::new(AtomicU64::new(0)),
            generation: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    /// Whether a retry loop is active.
    pub fn is_retrying(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }

    /// Start retrying unless a loop is already active.
    ///
    /// `interval` is consulted before every attempt so settings changes apply
    /// to the running loop. `attempt` returns `true` once connected, which
    /// ends the loop. Returns whether a new loop was started.
    pub fn schedule<I, A, Fut>(&self, interval: I, attempt: A) -> bool
    where
        I: Fn() -> Duration + Send + 'static,
        A: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let mut task = self.task.lock();
        if self.is_retrying() {
            debug!(device_id = %self.device_id, "Retry loop already running");
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.store(generation, Ordering::SeqCst);

        let active = self.active.clone();
        let device_id = self.device_id.clone();
        let handle = tokio::spawn(async move {
            let mut attempts: u64 = 0;
            loop {
                tokio::time::sleep(interval()).await;
                attempts += 1;
                debug!(device_id = %device_id, attempts, "Reconnect attempt");
                if attempt().await {
                    info!(device_id = %device_id, attempts, "Retry loop finished");
                    break;
                }
            }
            let _ = active.compare_exchange(generation, 0, Ordering::SeqCst, Ordering::SeqCst);
        });

        // Any previous loop is done or winding down after `finish`
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        true
    }

    /// Mark the loop done from inside its successful attempt.
    ///
    /// A session lost right after reconnecting can then schedule a fresh
    /// loop before the old task has wound down.
    pub fn finish(&self) {
        self.active.store(0, Ordering::SeqCst);
    }

    /// Cancel the retry loop. Idempotent.
    pub fn clear(&self) {
        self.active.store(0, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let manager = ReconnectionManager::new("p1");
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        manager.schedule(
            || Duration::from_millis(100),
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 }
            },
        );
        assert!(manager.is_retrying());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!manager.is_retrying());
    }

    fn counting(counter: Arc<AtomicU32>) -> impl Fn() -> std::future::Ready<bool> + Send {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_loop() {
        let manager = ReconnectionManager::new("p1");
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        assert!(manager.schedule(|| Duration::from_millis(100), counting(first.clone())));
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(!manager.schedule(|| Duration::from_millis(100), counting(second.clone())));

        // The first loop keeps its timer
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(first.load(Ordering::SeqCst), 2);
        manager.clear();
        assert!(!manager.is_retrying());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_clear_starts_fresh() {
        let manager = ReconnectionManager::new("p1");
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        manager.schedule(|| Duration::from_millis(100), counting(first.clone()));
        manager.clear();
        assert!(manager.schedule(|| Duration::from_millis(100), counting(second.clone())));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        manager.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_allows_new_loop() {
        let manager = ReconnectionManager::new("p1");
        let attempts = Arc::new(AtomicU32::new(0));

        manager.schedule(|| Duration::from_millis(100), counting(attempts.clone()));
        manager.finish();
        assert!(!manager.is_retrying());
        assert!(manager.schedule(|| Duration::from_millis(100), counting(attempts.clone())));
        assert!(manager.is_retrying());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        manager.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let result: AdapterResult<()> =
            handshake(Duration::from_millis(50), std::future::pending()).await;
        assert!(matches!(result, Err(AdapterError::HandshakeTimeout(50))));
    }
}
