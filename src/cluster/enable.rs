//! `Cluster::enable` spawns a keep-alive task that, on failure, calls
//! `reconnect_or_exit`, which in turn awaits `enable` again. As with
//! [`super::connect`], that recursion through `tokio::spawn`'s `Send`
//! bound is cyclic for an `async fn`; returning an explicit
//! `Pin<Box<dyn Future + Send>>` breaks the cycle.

use super::Cluster;
use crate::error::{EdgeError, Result};
use crate::socket::ack_result;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use super::ENABLE_ACK_TIMEOUT;
use tracing::{debug, info};

impl Cluster {
    /// Register with the control plane and start the keep-alive ticker.
    pub fn enable<'a>(self: &'a Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if self.is_enabled() {
                debug!("extra enable");
                return Ok(());
            }
            let socket = state.socket.clone().ok_or(EdgeError::NotConnected)?;

            info!("sending enable packet");
            let payload = json!({
                "host": self.config.host,
                "port": self.config.public_port,
                "version": env!("CARGO_PKG_VERSION"),
                "byoc": self.config.byoc,
            });
            let values = socket
                .emit_ack("enable", Some(payload), ENABLE_ACK_TIMEOUT)
                .await?;
            debug!(ack = ?values, "enable ack");
            match ack_result(&values)? {
                Value::Bool(true) => {}
                other => {
                    return Err(EdgeError::ProtocolNack(format!(
                        "enable ack carried non-true value: {}",
                        other
                    )))
                }
            }

            self.disabled_tx.send_replace(false);
            self.enabled_tx.send_replace(true);

            let weak = Arc::downgrade(self);
            let interval = self.config.keep_alive_interval;
            state.keepalive = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(cluster) = weak.upgrade() else { return };
                    if !cluster.keep_alive_tick().await {
                        info!("reconnecting due to keep-alive failure");
                        tokio::spawn(async move {
                            cluster.reconnect_or_exit().await;
                        });
                        return;
                    }
                }
            }));
            info!("cluster enabled");
            Ok(())
        })
    }
}
