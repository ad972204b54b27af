//! Heartbeat monitor.
//!
//! Sends a numbered probe every interval and expects the matching pong
//! within the timeout. A missed pong fires the failure callback exactly once
//! and stops the monitor.

use crate::adapter::{AdapterError, AdapterResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Sequence numbers wrap back to zero here.
pub const SEQUENCE_WRAP: u64 = 1_000_000;

/// Next probe sequence after `seq`.
pub fn next_sequence(seq: u64) -> u64 {
    (seq + 1) % SEQUENCE_WRAP
}

/// Liveness monitor for one session.
pub struct HeartbeatMonitor {
    device_id: String,
    running: Arc<AtomicBool>,
    pong_tx: Mutex<Option<mpsc::UnboundedSender<u64>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            running: Arc::new(AtomicBool::new(false)),
            pong_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start probing.
    ///
    /// `probe` is called with each new sequence number and must send it to
    /// the device. `on_failure` runs at most once, with the reason, when a
    /// probe goes unanswered.
    pub fn start<P, F>(
        &self,
        interval: Duration,
        timeout: Duration,
        probe: P,
        on_failure: F,
    ) -> AdapterResult<()>
    where
        P: Fn(u64) + Send + 'static,
        F: FnOnce(String) + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::Protocol(format!(
                "heartbeat already running for {}",
                self.device_id
            )));
        }

        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<u64>();
        let running = self.running.clone();
        let device_id = self.device_id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            let mut seq: u64 = 0;
            let mut pending: Option<(u64, Instant)> = None;

            loop {
                let deadline = pending.map(|(_, at)| at);
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some((outstanding, _)) = pending {
                            debug!(device_id = %device_id, outstanding, "Probe still outstanding");
                            continue;
                        }
                        seq = next_sequence(seq);
                        pending = Some((seq, Instant::now() + timeout));
                        probe(seq);
                    }
                    pong = pong_rx.recv() => match pong {
                        Some(ack) => match pending {
                            Some((expected, _)) if expected == ack => pending = None,
                            Some((expected, _)) => {
                                warn!(device_id = %device_id, expected, got = ack, "Heartbeat sequence mismatch");
                            }
                            None => debug!(device_id = %device_id, ack, "Unsolicited pong"),
                        },
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        running.store(false, Ordering::SeqCst);
                        let reason = format!(
                            "no pong for probe {} within {}ms",
                            seq,
                            timeout.as_millis()
                        );
                        warn!(device_id = %device_id, "Heartbeat failed: {}", reason);
                        on_failure(reason);
                        return;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        *self.pong_tx.lock() = Some(pong_tx);
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Feed a pong received from the device.
    pub fn on_pong(&self, seq: u64) {
        if let Some(tx) = self.pong_tx.lock().as_ref() {
            let _ = tx.send(seq);
        }
    }

    /// Stop probing and cancel the pending timeout. Idempotent.
    pub fn stop(&self) {
        self.pong_tx.lock().take();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
