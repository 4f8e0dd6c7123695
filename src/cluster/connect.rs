//! `Cluster::connect` spawns a task that, on a socket error, calls
//! `reconnect_or_exit`, which in turn awaits `connect` again. That
//! recursion through `tokio::spawn`'s `Send` bound is cyclic for an
//! `async fn` (whose return type is an opaque, auto-trait-inferred
//! future); returning an explicit `Pin<Box<dyn Future + Send>>` here
//! breaks the cycle by giving the future a concrete type up front.

use super::Cluster;
use crate::socket::{redact, socket_url, ws_url, DialOptions, SocketEvent};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

impl Cluster {
    /// Open the control socket. A repeated connect while one exists is a
    /// no-op success.
    pub fn connect<'a>(self: &'a Arc<Self>) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.socket.is_some() {
                debug!("extra connect");
                return true;
            }

            let url = socket_url(
                &self.config.prefix,
                &self.config.cluster_id,
                &self.config.cluster_secret,
            );
            let opts = DialOptions {
                url: url.clone(),
                origin: self.config.prefix.clone(),
                user_agent: self.user_agent.clone(),
            };
            info!(url = %redact(&ws_url(&url), &self.config.cluster_secret), "dialing control plane");

            let (tx, mut rx) = mpsc::unbounded_channel();
            let socket = match self.connector.connect(&opts, tx).await {
                Ok(socket) => socket,
                Err(e) => {
                    error!(error = %e, "websocket connect error");
                    return false;
                }
            };

            let weak = Arc::downgrade(self);
            let event_task = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let Some(cluster) = weak.upgrade() else { return };
                    match event {
                        SocketEvent::Connected => debug!("control socket connected"),
                        SocketEvent::Disconnected => {
                            tokio::spawn(async move {
                                cluster.disable().await;
                            });
                        }
                        SocketEvent::Error => {
                            tokio::spawn(async move {
                                cluster.reconnect_or_exit().await;
                            });
                        }
                    }
                }
            });

            state.socket = Some(socket);
            state.event_task = Some(event_task);
            true
        })
    }
}
