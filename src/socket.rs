//! Typed façade over the control plane's bidirectional socket.
//!
//! The wire framing (engine.io over WebSocket) is delegated to the
//! socket.io client crate; this module only exposes the four RPCs the
//! cluster lifecycle needs, as request/ack pairs, plus connection events.
//! The cluster secret rides in the dial URL, so the URL is redacted before
//! it ever reaches a log line.

use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload, TransportType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Connection events forwarded to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Connected,
    Disconnected,
    Error,
}

pub type EventSender = mpsc::UnboundedSender<SocketEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SocketEvent>;

/// Dial parameters for the control plane socket.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Control-plane URL carrying the auth query string.
    pub url: String,
    /// `Origin` header value.
    pub origin: String,
    /// `User-Agent` header value.
    pub user_agent: String,
}

/// Build the socket URL for a control plane origin and credentials.
pub fn socket_url(prefix: &str, cluster_id: &str, cluster_secret: &str) -> String {
    format!(
        "{}/?clusterId={}&clusterSecret={}&EIO=4&transport=websocket",
        prefix.trim_end_matches('/'),
        cluster_id,
        cluster_secret
    )
}

/// Websocket rendition of a control-plane URL (scheme swap). The
/// transport performs the actual upgrade; this form is for log lines.
pub fn ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

/// Redact a secret wherever it appears in a URL destined for a log line.
pub fn redact(url: &str, secret: &str) -> String {
    if secret.is_empty() {
        url.to_string()
    } else {
        url.replace(secret, "<******>")
    }
}

/// An established control-plane connection.
#[async_trait]
pub trait ControlSocket: Send + Sync {
    /// Emit `event` and await its ack values.
    ///
    /// The reply convention is `[error | null, result]`: a non-null first
    /// element is a remote error.
    async fn emit_ack(
        &self,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>>;

    /// Tear the connection down.
    async fn close(&self);
}

/// Opens control-plane connections; the lifecycle holds one of these so
/// reconnects mint fresh sockets.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(
        &self,
        opts: &DialOptions,
        events: EventSender,
    ) -> Result<Arc<dyn ControlSocket>>;
}

/// Production connector backed by the socket.io client.
pub struct SocketIoConnector;

#[async_trait]
impl SocketConnector for SocketIoConnector {
    async fn connect(
        &self,
        opts: &DialOptions,
        events: EventSender,
    ) -> Result<Arc<dyn ControlSocket>> {
        let connect_tx = events.clone();
        let close_tx = events.clone();
        let error_tx = events;

        let client = ClientBuilder::new(opts.url.clone())
            .transport_type(TransportType::Websocket)
            .opening_header("Origin", opts.origin.clone())
            .opening_header("User-Agent", opts.user_agent.clone())
            .on(Event::Connect, move |_payload, _client| {
                let tx = connect_tx.clone();
                async move {
                    let _ = tx.send(SocketEvent::Connected);
                }
                .boxed()
            })
            .on(Event::Close, move |_payload, _client| {
                let tx = close_tx.clone();
                async move {
                    let _ = tx.send(SocketEvent::Disconnected);
                }
                .boxed()
            })
            .on(Event::Error, move |payload, _client| {
                let tx = error_tx.clone();
                async move {
                    debug!(?payload, "socket error event");
                    let _ = tx.send(SocketEvent::Error);
                }
                .boxed()
            })
            .connect()
            .await
            .map_err(|e| EdgeError::Transport(e.to_string()))?;

        Ok(Arc::new(SocketIoSocket {
            client: tokio::sync::Mutex::new(Some(client)),
        }))
    }
}

struct SocketIoSocket {
    client: tokio::sync::Mutex<Option<Client>>,
}

#[async_trait]
impl ControlSocket for SocketIoSocket {
    async fn emit_ack(
        &self,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let client = {
            let guard = self.client.lock().await;
            guard.clone().ok_or(EdgeError::NotConnected)?
        };

        let (tx, rx) = oneshot::channel::<Vec<Value>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let callback = move |payload: Payload, _client: Client| {
            let tx = Arc::clone(&tx);
            async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(payload_values(payload));
                }
            }
            .boxed()
        };

        let data = Payload::Text(payload.into_iter().collect());
        client
            .emit_with_ack(event, data, timeout, callback)
            .await
            .map_err(|e| EdgeError::Transport(e.to_string()))?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(EdgeError::Timeout(timeout.as_millis() as u64)),
            Ok(Err(_)) => Err(EdgeError::Transport("ack channel closed".to_string())),
            Ok(Ok(values)) => Ok(values),
        }
    }

    async fn close(&self) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
    }
}

fn payload_values(payload: Payload) -> Vec<Value> {
    match payload {
        Payload::Text(values) => values,
        #[allow(deprecated)]
        Payload::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(values)) => values,
            Ok(v) => vec![v],
            Err(_) => vec![Value::String(s)],
        },
        Payload::Binary(_) => Vec::new(),
    }
}

/// Interpret an `[error | null, result]` ack.
///
/// Returns the result slot, or `ProtocolNack` when the error slot is
/// non-null or the reply is too short.
pub fn ack_result(values: &[Value]) -> Result<&Value> {
    match values.first() {
        None => Err(EdgeError::ProtocolNack("empty ack".to_string())),
        Some(Value::Null) => values
            .get(1)
            .ok_or_else(|| EdgeError::ProtocolNack("ack carries no result".to_string())),
        Some(err) => Err(EdgeError::ProtocolNack(err.to_string())),
    }
}
