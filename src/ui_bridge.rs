//! Extension UI bridge.
//!
//! Extensions talk to whatever host UI is attached (interactive TUI, or a
//! headless controller on the event plane) through request/response round
//! trips correlated by id. Requests go out as `extension_ui_request` events;
//! responses come back through the control plane
//! (`extension_ui_response`). Fire-and-forget methods (notify, status,
//! widgets) emit the same event shape with no pending entry.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// An outbound UI request, broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiRequest {
    /// Correlation id; absent for fire-and-forget methods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    pub payload: Value,
}

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Value>>>;

/// Bidirectional bridge between extension handlers and the host UI.
pub struct UiBridge {
    emit: Box<dyn Fn(UiRequest) + Send + Sync>,
    pending: Arc<PendingMap>,
    shutdown: std::sync::atomic::AtomicBool,
}

impl UiBridge {
    /// Create a bridge that publishes requests through `emit`.
    pub fn new(emit: impl Fn(UiRequest) + Send + Sync + 'static) -> Self {
        Self {
            emit: Box::new(emit),
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Issue a dialog request and wait for the host response.
    ///
    /// Resolves with `Value::Null` when the timeout or abort fires first.
    /// After shutdown every call resolves immediately with `Value::Null`.
    pub async fn request(
        &self,
        method: &str,
        payload: Value,
        timeout: Option<Duration>,
        abort: Option<&crate::agent::AbortSignal>,
    ) -> Value {
        if self.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            return Value::Null;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("ui bridge pending lock")
            .insert(id.clone(), tx);

        (self.emit)(UiRequest {
            id: Some(id.clone()),
            method: method.to_string(),
            payload,
        });

        let response = async {
            match rx.await {
                Ok(value) => value,
                Err(_) => Value::Null, // shutdown rejected the pending entry
            }
        };

        let value = match (timeout, abort) {
            (Some(timeout), Some(abort)) => {
                tokio::select! {
                    value = response => value,
                    () = tokio::time::sleep(timeout) => Value::Null,
                    () = abort.wait() => Value::Null,
                }
            }
            (Some(timeout), None) => {
                tokio::select! {
                    value = response => value,
                    () = tokio::time::sleep(timeout) => Value::Null,
                }
            }
            (None, Some(abort)) => {
                tokio::select! {
                    value = response => value,
                    () = abort.wait() => Value::Null,
                }
            }
            (None, None) => response.await,
        };

        // Timeout/abort leave the pending entry behind; clean it up.
        self.pending
            .lock()
            .expect("ui bridge pending lock")
            .remove(&id);
        value
    }

    /// Resolve a pending request by correlation id.
    ///
    /// Unknown ids are ignored (the request already timed out).
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("ui bridge pending lock")
            .remove(id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Emit a fire-and-forget UI request (notify, status, widgets, title).
    pub fn notify(&self, method: &str, payload: Value) {
        if self.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        (self.emit)(UiRequest {
            id: None,
            method: method.to_string(),
            payload,
        });
    }

    /// Reject every pending round trip; subsequent requests resolve null.
    pub fn shutdown(&self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mut pending = self.pending.lock().expect("ui bridge pending lock");
        pending.clear(); // dropping senders wakes every waiter with Null
    }

    /// Number of in-flight round trips.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("ui bridge pending lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn capture_bridge() -> (Arc<UiBridge>, Arc<StdMutex<Vec<UiRequest>>>) {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let bridge = Arc::new(UiBridge::new(move |request| {
            sink.lock().unwrap().push(request);
        }));
        (bridge, captured)
    }

    #[tokio::test]
    async fn round_trip_resolves() {
        let (bridge, captured) = capture_bridge();

        let waiter = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .request("confirm", json!({ "title": "sure?" }), None, None)
                    .await
            })
        };

        // Wait for the request to be emitted, then answer it.
        let id = loop {
            let requests = captured.lock().unwrap();
            if let Some(request) = requests.first() {
                break request.id.clone().unwrap();
            }
            drop(requests);
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(bridge.resolve(&id, json!(true)));

        assert_eq!(waiter.await.unwrap(), json!(true));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_resolves_null_and_cleans_up() {
        let (bridge, _captured) = capture_bridge();
        let value = bridge
            .request(
                "select",
                json!({ "options": ["a", "b"] }),
                Some(Duration::from_millis(20)),
                None,
            )
            .await;
        assert_eq!(value, Value::Null);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_ignored() {
        let (bridge, _captured) = capture_bridge();
        assert!(!bridge.resolve("nope", json!(1)));
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_and_future() {
        let (bridge, captured) = capture_bridge();

        let waiter = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.request("input", json!({}), None, None).await })
        };
        while captured.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bridge.shutdown();
        assert_eq!(waiter.await.unwrap(), Value::Null);
        assert_eq!(
            bridge.request("confirm", json!({}), None, None).await,
            Value::Null
        );
    }

    #[tokio::test]
    async fn notify_has_no_correlation_id() {
        let (bridge, captured) = capture_bridge();
        bridge.notify("notify", json!({ "message": "hi" }));
        let requests = captured.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].id.is_none());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn abort_resolves_null() {
        let (bridge, captured) = capture_bridge();
        let (handle, signal) = crate::agent::AbortHandle::new();

        let waiter = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .request("editor", json!({}), None, Some(&signal))
                    .await
            })
        };
        while captured.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        assert_eq!(waiter.await.unwrap(), Value::Null);
    }
}
