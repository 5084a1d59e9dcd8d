//! Chrome devtools protocol transport.
//!
//! One WebSocket connection per browser. Commands are correlated to their
//! responses by id; everything else on the wire is an event, routed to the
//! attached session it belongs to. A dropped connection fails all pending
//! commands with the close reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::{Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type CommandOutcome = std::result::Result<Value, String>;

/// A protocol event, delivered in arrival order to its session channel.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<CommandOutcome>>>,
    sessions: DashMap<String, mpsc::Sender<CdpEvent>>,
    closed: Mutex<Option<String>>,
}

impl Shared {
    /// Record the close reason once and fail everything waiting on the wire.
    fn shutdown(&self, reason: &str) {
        {
            let mut closed = self.closed.lock();
            if closed.is_none() {
                debug!(reason, "Devtools connection closed");
                *closed = Some(reason.to_string());
            }
        }
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(reason.to_string()));
        }
        // dropping the senders ends every per-session event stream
        self.sessions.clear();
    }
}

/// Connection to a browser's devtools endpoint.
pub struct CdpConnection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WsSink>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Browser(format!("devtools connect to {ws_url} failed: {e}")))?;
        debug!(url = ws_url, "Devtools connected");

        let (writer, reader) = stream.split();
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(read_loop(reader, shared.clone()));

        Ok(Self {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            next_id: AtomicU64::new(0),
            reader: task,
        })
    }

    /// Send a command, optionally scoped to a session, and wait for its
    /// response.
    pub async fn send(
        &self,
        method: &str,
        session_id: Option<&str>,
        params: Value,
    ) -> Result<Value> {
        if let Some(reason) = self.closed_reason() {
            return Err(Error::Protocol(format!("{method}: {reason}")));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let mut message = serde_json::json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session_id {
            message["sessionId"] = Value::String(session.to_string());
        }
        let text = serde_json::to_string(&message)?;
        trace!(method, id, "Devtools command");

        if let Err(err) = self.writer.lock().await.send(Message::Text(text)).await {
            self.shared.pending.lock().remove(&id);
            self.shared.shutdown(&format!("send failed: {err}"));
            return Err(Error::Protocol(format!("{method}: {err}")));
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(Error::Protocol(format!("{method}: {message}"))),
            Err(_) => {
                let reason = self
                    .closed_reason()
                    .unwrap_or_else(|| "connection closed".to_string());
                Err(Error::Protocol(format!("{method}: {reason}")))
            }
        }
    }

    /// Subscribe to events for a session id. Events arriving for sessions
    /// nobody attached are dropped.
    pub fn attach(&self, session_id: &str) -> mpsc::Receiver<CdpEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.shared.sessions.insert(session_id.to_string(), tx);
        rx
    }

    pub fn detach(&self, session_id: &str) {
        self.shared.sessions.remove(session_id);
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.shared.closed.lock().clone()
    }

    /// Close the socket. Pending commands fail with the given reason.
    pub async fn close(&self, reason: &str) {
        self.shared.shutdown(reason);
        let _ = self.writer.lock().await.send(Message::Close(None)).await;
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Deserialize)]
struct Incoming {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<IncomingError>,
    method: Option<String>,
    params: Option<Value>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct IncomingError {
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl IncomingError {
    fn describe(&self) -> String {
        match &self.data {
            Some(Value::String(data)) => format!("{} {data}", self.message),
            Some(data) => format!("{} {data}", self.message),
            None => self.message.clone(),
        }
    }
}

async fn read_loop(mut reader: WsSource, shared: Arc<Shared>) {
    while let Some(next) = reader.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                shared.shutdown("connection closed");
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                shared.shutdown(&format!("connection error: {err}"));
                return;
            }
        };

        let incoming: Incoming = match serde_json::from_str(&text) {
            Ok(incoming) => incoming,
            Err(err) => {
                debug!("Unparseable devtools message: {err}");
                continue;
            }
        };

        if let Some(id) = incoming.id {
            let outcome = match incoming.error {
                Some(error) => Err(error.describe()),
                None => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            if let Some(tx) = shared.pending.lock().remove(&id) {
                let _ = tx.send(outcome);
            }
            continue;
        }

        let Some(method) = incoming.method else {
            continue;
        };
        let event = CdpEvent {
            method,
            params: incoming.params.unwrap_or(Value::Null),
        };

        match incoming.session_id {
            Some(session) => {
                // clone out of the map so delivery never blocks other shards
                let sender = shared.sessions.get(&session).map(|e| e.value().clone());
                if let Some(tx) = sender {
                    if tx.send(event).await.is_err() {
                        shared.sessions.remove(&session);
                    }
                }
            }
            None => trace!(method = %event.method, "Unrouted browser event"),
        }
    }
    shared.shutdown("connection closed");
}
