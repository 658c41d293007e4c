//! DevTools-protocol connection over WebSocket.
//!
//! One connection per target (browser or page): commands are correlated to
//! responses by id, events fan out to subscribers by method name. Reader
//! and writer run as background tasks that die with the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::EngineError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const OUTGOING_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

pub(crate) struct CdpConnection {
    outgoing: mpsc::Sender<String>,
    pending: PendingMap,
    listeners: ListenerMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpConnection {
    pub(crate) async fn connect(ws_url: &str) -> Result<Self, EngineError> {
        let (stream, _) = connect_async(ws_url).await.map_err(|err| {
            EngineError::Connection(format!("websocket connect to `{ws_url}` failed: {err}"))
        })?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(message)).await {
                    warn!(
                        target = "specchio::engine::cdp",
                        error = %err,
                        "devtools write failed; closing connection"
                    );
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_listeners = listeners.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        dispatch(&reader_pending, &reader_listeners, &text).await;
                    }
                    Ok(Message::Close(_)) => {
                        debug!(
                            target = "specchio::engine::cdp",
                            "devtools connection closed by peer"
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target = "specchio::engine::cdp",
                            error = %err,
                            "devtools read failed; closing connection"
                        );
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            outgoing,
            pending,
            listeners,
            next_id: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    /// Send one command and wait for its response's `result`.
    pub(crate) async fn command(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({ "id": id, "method": method, "params": params }).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing.send(payload).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(EngineError::Connection(
                "devtools connection is closed".to_string(),
            ));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    return Err(EngineError::Protocol(format!("`{method}` failed: {error}")));
                }
                Ok(response.get("result").cloned().unwrap_or(Value::Null))
            }
            Ok(Err(_)) => Err(EngineError::Connection(
                "devtools connection dropped while awaiting response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(EngineError::Protocol(format!(
                    "`{method}` timed out after {}s",
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Subscribe to an event stream by method name (`Network.responseReceived`,
    /// `Page.loadEventFired`, ...). Each event's `params` object is delivered.
    pub(crate) async fn subscribe(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub(crate) async fn enable(&self, domain: &str) -> Result<(), EngineError> {
        self.command(&format!("{domain}.enable"), json!({})).await?;
        Ok(())
    }
}

async fn dispatch(pending: &PendingMap, listeners: &ListenerMap, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some(tx) = pending.lock().await.remove(&id) {
            let _ = tx.send(value);
        }
        return;
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let mut guard = listeners.lock().await;
        if let Some(senders) = guard.get_mut(method) {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            senders.retain(|tx| match tx.try_send(params.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        target = "specchio::engine::cdp",
                        method, "event queue full; dropping event"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
