//! Cluster lifecycle: the state machine binding the control socket, the
//! stats ledger and the keep-alive ticker.
//!
//! ```text
//!     ┌──────────┐  connect  ┌───────────┐ enable ack ┌─────────┐
//!     │ OFFLINE  │──────────▶│ CONNECTED │──────────▶ │ ENABLED │
//!     └────┬─────┘           └─────┬─────┘            └────┬────┘
//!          ▲                       │ socket error/close    │
//!          │                       ▼                       │
//!          │                 ┌───────────┐     disable     │
//!          └─────────────────│  FAILING  │ ◀───────────────┘
//!                            └─────┬─────┘
//!                                  │ reconnect succeeds
//!                                  └──▶ CONNECTED
//! ```
//!
//! Hit counters are two atomics incremented by the HTTP frontend and
//! swapped to zero by every keep-alive tick; the swapped pair lands in the
//! [`StatsLedger`] before transmission, so local durability survives a
//! failed delivery.

pub mod cert;
mod connect;
mod enable;

pub use cert::CertKeyPair;

use crate::config::ClusterConfig;
use crate::error::{EdgeError, Result};
use crate::socket::{ack_result, ControlSocket, DialOptions, SocketConnector, SocketEvent};
use crate::stats::StatsLedger;
use crate::util::bytes_to_unit;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ack budget for enable and request-cert, which the control plane may
/// take a while to answer.
const ENABLE_ACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Ack budget for the disable RPC.
const DISABLE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on the final counter-flushing keep-alive inside disable.
const FINAL_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Served-hit counters shared with the HTTP frontend.
pub struct Counters {
    hits: AtomicI32,
    hbytes: Arc<AtomicI64>,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: AtomicI32::new(0),
            hbytes: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Record one served request.
    pub fn add_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Shared byte counter handed to storage serve paths.
    pub fn byte_counter(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.hbytes)
    }

    /// Atomically take and reset both counters.
    fn swap(&self) -> (i32, i64) {
        (
            self.hits.swap(0, Ordering::AcqRel),
            self.hbytes.swap(0, Ordering::AcqRel),
        )
    }
}

struct LifecycleState {
    socket: Option<Arc<dyn ControlSocket>>,
    keepalive: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
}

/// One edge node's registration with the control plane.
pub struct Cluster {
    config: ClusterConfig,
    user_agent: String,
    data_dir: PathBuf,
    connector: Arc<dyn SocketConnector>,
    stats: Arc<StatsLedger>,
    counters: Counters,
    state: RwLock<LifecycleState>,
    enabled_tx: watch::Sender<bool>,
    disabled_tx: watch::Sender<bool>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        stats: Arc<StatsLedger>,
        connector: Arc<dyn SocketConnector>,
    ) -> Arc<Self> {
        let data_dir = config.data_dir();
        let (enabled_tx, _) = watch::channel(false);
        // The node starts disabled; the latch opens on enable.
        let (disabled_tx, _) = watch::channel(true);
        Arc::new(Self {
            config,
            user_agent: format!("openbmclapi-cluster/{}", env!("CARGO_PKG_VERSION")),
            data_dir,
            connector,
            stats,
            counters: Counters::new(),
            state: RwLock::new(LifecycleState {
                socket: None,
                keepalive: None,
                event_task: None,
            }),
            enabled_tx,
            disabled_tx,
        })
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn stats(&self) -> &Arc<StatsLedger> {
        &self.stats
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled_tx.borrow()
    }

    /// Resolve once the control plane has accepted this node.
    pub async fn wait_for_enable(&self) {
        let mut rx = self.enabled_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolve once the node has been disabled (the `disabled` latch).
    pub async fn wait_disabled(&self) {
        let mut rx = self.disabled_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// One keep-alive exchange with a half-interval budget.
    pub async fn keep_alive_tick(&self) -> bool {
        let socket = {
            let state = self.state.read().await;
            match state.socket.clone() {
                Some(socket) => socket,
                None => return false,
            }
        };
        self.keep_alive_inner(socket, self.config.keep_alive_interval / 2)
            .await
    }

    /// Swap the counters, fold them into the ledger, transmit, persist.
    async fn keep_alive_inner(&self, socket: Arc<dyn ControlSocket>, timeout: Duration) -> bool {
        let (hits, hbytes) = self.counters.swap();
        self.stats.add_hits(hits as i64, hbytes);

        let payload = json!({
            "time": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "hits": hits,
            "bytes": hbytes,
        });
        let result = socket.emit_ack("keep-alive", Some(payload), timeout).await;

        if let Err(e) = self.stats.save(&self.data_dir) {
            error!(error = %e, "error saving stats");
        }

        let values = match result {
            Ok(values) => values,
            Err(e) => {
                if !e.is_cancelled() {
                    error!(error = %e, "error during keep-alive");
                }
                return false;
            }
        };
        match ack_result(&values) {
            // A null server timestamp means the control plane lost track of
            // this node; treat it as a failed keep-alive.
            Ok(Value::Null) => {
                error!("keep-alive failed: server reported no state");
                false
            }
            Ok(server_time) => {
                info!(
                    hits,
                    bytes = %bytes_to_unit(hbytes as f64),
                    server = %server_time,
                    "keep-alive success"
                );
                true
            }
            Err(e) => {
                error!(error = %e, "keep-alive failed");
                false
            }
        }
    }

    /// Deregister, flush counters one last time and close the socket.
    /// A repeated disable is a no-op success.
    pub async fn disable(&self) -> bool {
        let mut state = self.state.write().await;
        if !self.is_enabled() {
            debug!("extra disable");
            return true;
        }
        info!("disabling cluster");

        if let Some(handle) = state.keepalive.take() {
            handle.abort();
        }
        let Some(socket) = state.socket.take() else {
            self.enabled_tx.send_replace(false);
            self.disabled_tx.send_replace(true);
            return true;
        };
        if let Some(handle) = state.event_task.take() {
            handle.abort();
        }

        // Flush whatever the frontend counted since the last tick.
        self.keep_alive_inner(Arc::clone(&socket), FINAL_KEEPALIVE_TIMEOUT)
            .await;

        let ack = socket.emit_ack("disable", None, DISABLE_ACK_TIMEOUT).await;
        self.enabled_tx.send_replace(false);
        socket.close().await;
        self.disabled_tx.send_replace(true);

        match ack {
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(error = %e, "disable ack failed");
                }
                false
            }
            Ok(values) => {
                debug!(ack = ?values, "disable ack");
                match ack_result(&values) {
                    Ok(Value::Bool(true)) => true,
                    Ok(other) => {
                        error!(ack = %other, "disable failed: ack non true value");
                        false
                    }
                    Err(e) => {
                        error!(error = %e, "disable failed");
                        false
                    }
                }
            }
        }
    }

    /// Request TLS material over the socket.
    pub async fn request_cert(&self) -> Result<CertKeyPair> {
        let socket = {
            let state = self.state.read().await;
            state.socket.clone().ok_or(EdgeError::NotConnected)?
        };
        info!("requesting certificates, please wait ...");
        let values = socket
            .emit_ack("request-cert", None, ENABLE_ACK_TIMEOUT)
            .await?;
        let pair = ack_result(&values)?;
        let pair: CertKeyPair = serde_json::from_value(pair.clone())?;
        info!("certificate requested");
        Ok(pair)
    }

    /// Recovery path after a socket error or keep-alive failure. Failing
    /// to reconnect or re-enable aborts the process with exit code 1.
    pub async fn reconnect_or_exit(self: Arc<Self>) {
        warn!("recovering control plane session");
        self.disable().await;
        if !self.connect().await {
            error!("cannot reconnect to server, exiting");
            std::process::exit(1);
        }
        if let Err(e) = self.enable().await {
            error!(error = %e, "cannot enable cluster, exiting");
            std::process::exit(1);
        }
    }
}
