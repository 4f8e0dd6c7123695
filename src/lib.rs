//! bmcl-edge - An edge cache node for the OpenBMCLAPI content delivery
//! cluster.
//!
//! The node registers with a central control plane, mirrors an
//! authoritative manifest of content-addressed files and serves them to
//! end users over HTTP, reporting hit counters back through a periodic
//! keep-alive.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        bmcl-edge                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serving: HTTP frontend | hit accounting | measurements     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Lifecycle: control socket | keep-alive | reconnect         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Sync: manifest diff | bounded downloads | integrity | GC   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage: local cache | WebDAV proxy | rate limits          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use bmcl_edge::config::EdgeConfig;
//!
//! #[tokio::main]
//! async fn main() -> bmcl_edge::Result<()> {
//!     let config = EdgeConfig::development("/var/lib/bmcl-edge");
//!     bmcl_edge::run(config).await
//! }
//! ```

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hashpath;
pub mod manifest;
pub mod observability;
pub mod ratelimit;
pub mod serve;
pub mod socket;
pub mod stats;
pub mod storage;
pub mod sync;
pub mod util;

// Re-exports
pub use error::{EdgeError, Result};

use crate::cache::{Cache, MemoryCache};
use crate::cluster::Cluster;
use crate::config::EdgeConfig;
use crate::serve::{run_frontend, AppState};
use crate::socket::SocketIoConnector;
use crate::stats::StatsLedger;
use crate::storage::StorageContext;
use crate::sync::SyncEngine;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Directory holding TLS material requested from the control plane.
const PEM_DIR: &str = "pems";

/// Run the edge node with the given configuration.
pub async fn run(config: EdgeConfig) -> Result<()> {
    config.validate()?;
    info!(cluster_id = %config.cluster.cluster_id, "starting edge node");

    std::fs::create_dir_all(config.cluster.cache_dir())?;
    std::fs::create_dir_all(config.cluster.data_dir())?;
    // Anything under cache/.tmp belongs to downloads that no longer exist.
    sync::purge_tmp_dir(&config.cluster)?;

    let stats = Arc::new(StatsLedger::load(&config.cluster.data_dir()));

    storage::register_builtin();
    let redirect_cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let storage = storage::create_storage(&StorageContext {
        config: &config,
        redirect_cache,
    })?;
    info!(storage = %storage.describe(), "storage ready");
    storage.init().await?;

    let cluster = Cluster::new(
        config.cluster.clone(),
        Arc::clone(&stats),
        Arc::new(SocketIoConnector),
    );
    let engine = SyncEngine::new(config.cluster.clone(), Arc::clone(&storage))?;

    // The first connect has no retry budget: failing here is fatal.
    if !cluster.connect().await {
        return Err(EdgeError::Transport(
            "cannot open the control socket".to_string(),
        ));
    }

    if !config.cluster.byoc {
        let pair = cluster.request_cert().await?;
        let (cert, key) = pair.save_as_files(Path::new(PEM_DIR))?;
        info!(cert = %cert.display(), key = %key.display(), "certificate saved");
    }

    let state = AppState::new(Arc::clone(&cluster), Arc::clone(&engine), &config);
    let bind_addr = config.serve.bind_addr;
    let mut frontend = tokio::spawn(run_frontend(state, bind_addr));

    cluster.enable().await?;

    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            match engine.fetch_manifest().await {
                Ok(manifest) => {
                    if let Err(e) = engine.sync(manifest).await {
                        if !e.is_cancelled() {
                            error!(error = %e, "sync failed");
                        }
                    }
                }
                Err(e) => error!(error = %e, "cannot fetch the file manifest"),
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        res = &mut frontend => {
            match res {
                Ok(Ok(())) => info!("frontend stopped"),
                Ok(Err(e)) => error!(error = %e, "frontend failed"),
                Err(e) => error!(error = %e, "frontend task failed"),
            }
        }
    }

    cluster.disable().await;
    frontend.abort();
    info!("edge node shutdown complete");
    Ok(())
}
