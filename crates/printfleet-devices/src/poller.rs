//! Fixed-interval poll loop for protocols without a push channel.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs one poll per interval until stopped.
pub struct StatusPoller {
    device_id: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusPoller {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start polling, replacing any loop already running.
    ///
    /// The first poll runs one interval after start. `interval` is read
    /// before every sleep.
    pub fn start<I, P, Fut>(&self, interval: I, poll: P)
    where
        I: Fn() -> Duration + Send + 'static,
        P: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let device_id = self.device_id.clone();
        let handle = tokio::spawn(async move {
            debug!(device_id = %device_id, "Poller started");
            loop {
                tokio::time::sleep(interval()).await;
                poll().await;
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop polling and wait until the loop is gone. Idempotent.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            debug!(device_id = %self.device_id, "Poller stopped");
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
