//! JSON-RPC 2.0 request/response correlation.
//!
//! Each outgoing request gets the next id from a counter and a pending slot;
//! the matching response resolves it. Unanswered requests reject after
//! `min(timeout, REQUEST_TIMEOUT_CEILING_MS)`.

use crate::adapter::{AdapterError, AdapterResult};
use parking_lot::Mutex;
use printfleet_core::config::REQUEST_TIMEOUT_CEILING_MS;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Pending = oneshot::Sender<AdapterResult<Value>>;

/// Correlates JSON-RPC responses with their requests.
pub struct RequestCorrelator {
    device_id: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl RequestCorrelator {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `method` with `params` and wait for the result.
    ///
    /// `write` receives the serialized request and must hand it to the
    /// transport. The pending slot is registered before writing so a fast
    /// answer can never be missed.
    pub async fn send_request<W, Fut>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        write: W,
    ) -> AdapterResult<Value>
    where
        W: FnOnce(String) -> Fut,
        Fut: Future<Output = AdapterResult<()>>,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "id": id,
        });
        if let Some(params) = params {
            request["params"] = params;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = write(request.to_string()).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let limit = timeout.min(Duration::from_millis(REQUEST_TIMEOUT_CEILING_MS));
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::Closed("request dropped".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                debug!(device_id = %self.device_id, id, method, "Request timed out");
                Err(AdapterError::RequestTimeout(limit.as_millis() as u64))
            }
        }
    }

    /// Route an inbound message.
    ///
    /// Responses resolve their pending request and return `None`. Anything
    /// without an id (notifications) is handed back to the caller.
    pub fn handle_message(&self, message: Value) -> Option<Value> {
        let id = match message.get("id") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            Some(Value::Null) | None => None,
            Some(_) => None,
        };
        let Some(id) = id else {
            if message.get("method").is_some() {
                return Some(message);
            }
            debug!(device_id = %self.device_id, "Dropping message without id or method");
            return None;
        };

        let Some(tx) = self.pending.lock().remove(&id) else {
            warn!(device_id = %self.device_id, id, "Response for unknown request id");
            return None;
        };

        let result = if let Some(error) = message.get("error") {
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            Err(AdapterError::Protocol(text))
        } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        };
        // The caller may have timed out in the meantime
        let _ = tx.send(result);
        None
    }

    /// Reject every pending request with `Closed`.
    pub fn reject_all(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(device_id = %self.device_id, count = drained.len(), "Rejecting pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(AdapterError::Closed(reason.to_string())));
        }
    }
}
