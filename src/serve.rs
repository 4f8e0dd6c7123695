//! HTTP frontend serving content to end users.
//!
//! Routes are deliberately narrow: `/download/<hash>` and `/measure/<n>`,
//! GET only; everything else is a 404. Hit accounting happens here (one
//! hit per served download) while byte accounting rides inside the storage
//! serve paths, which see the actual bytes.

use crate::cluster::Cluster;
use crate::config::EdgeConfig;
use crate::error::EdgeError;
use crate::hashpath::looks_like_hash;
use crate::sync::SyncEngine;
use crate::util::join_url;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::request::Parts;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Header carrying the measurement secret.
const MEASURE_SECRET_HEADER: &str = "x-openbmclapi-secret";

/// Shared state for the frontend handlers.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub engine: Arc<SyncEngine>,
    pub secret: String,
    pub redirect_base: Option<String>,
}

impl AppState {
    pub fn new(cluster: Arc<Cluster>, engine: Arc<SyncEngine>, config: &EdgeConfig) -> Self {
        Self {
            cluster,
            engine,
            secret: config.cluster.cluster_secret.clone(),
            redirect_base: config.cluster.redirect_base.clone(),
        }
    }
}

/// Build the serving router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download/:hash", any(download))
        .route("/measure/:n", any(measure))
        .fallback(not_found)
        .with_state(state)
}

/// Bind and run the frontend until the process exits.
pub async fn run_frontend(state: AppState, bind_addr: std::net::SocketAddr) -> crate::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "frontend listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| EdgeError::Transport(e.to_string()))?;
    Ok(())
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 Status Not Found").into_response()
}

async fn download(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    parts: Parts,
) -> Response {
    if parts.method != Method::GET {
        return not_found().await;
    }
    if !looks_like_hash(&hash) {
        return not_found().await;
    }

    let storage = state.engine.storage();
    let size = match storage.size(&hash).await {
        Ok(size) => size,
        Err(e) if e.is_not_found() => {
            // Not cached yet: try a foreground fetch before giving up.
            debug!(hash = %hash, "cache miss, fetching in foreground");
            if let Err(e) = state.engine.download_file(&hash).await {
                if !e.is_cancelled() {
                    debug!(hash = %hash, error = %e, "foreground download failed");
                }
                return not_found().await;
            }
            match storage.size(&hash).await {
                Ok(size) => size,
                Err(_) => return not_found().await,
            }
        }
        Err(e) => {
            warn!(hash = %hash, error = %e, "storage probe failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match storage
        .serve_download(&parts, &hash, size, state.cluster.counters().byte_counter())
        .await
    {
        Ok(resp) => {
            state.cluster.counters().add_hit();
            resp
        }
        Err(e) if e.is_not_found() => not_found().await,
        Err(EdgeError::HttpStatus(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
        Err(e) => {
            if !e.is_cancelled() {
                warn!(hash = %hash, error = %e, "serve failed");
            }
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn measure(State(state): State<AppState>, Path(n): Path<String>, parts: Parts) -> Response {
    if parts.method != Method::GET {
        return not_found().await;
    }
    let authorized = parts
        .headers
        .get(MEASURE_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == state.secret)
        .unwrap_or(false);
    if !authorized {
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(base) = &state.redirect_base {
        return match join_url(base, &format!("/measure/{}", n)) {
            Ok(target) => Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, target)
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        };
    }

    let size_mb: u32 = match n.parse() {
        Ok(n) if n <= 200 => n,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    match state.engine.storage().serve_measure(&parts, size_mb).await {
        Ok(resp) => resp,
        Err(EdgeError::HttpStatus(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
        Err(e) => {
            warn!(n = size_mb, error = %e, "measure failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::socket::{ControlSocket, DialOptions, EventSender, SocketConnector};
    use crate::stats::StatsLedger;
    use async_trait::async_trait;
    use axum::http::Request;
    use std::sync::atomic::Ordering;

    const HASH: &str = "aa000000000000000000000000000001";

    struct OfflineConnector;

    #[async_trait]
    impl SocketConnector for OfflineConnector {
        async fn connect(
            &self,
            _opts: &DialOptions,
            _events: EventSender,
        ) -> Result<Arc<dyn ControlSocket>> {
            Err(EdgeError::Transport("offline".to_string()))
        }
    }

    fn test_state(dir: &std::path::Path, redirect_base: Option<String>) -> AppState {
        let mut config = EdgeConfig::development(dir);
        config.cluster.redirect_base = redirect_base;
        crate::sync::purge_tmp_dir(&config.cluster).unwrap();
        let storage = Arc::new(crate::storage::LocalStorage::new(
            config.cluster.cache_dir(),
            config.cluster.redirect_base.clone(),
        ));
        let engine = SyncEngine::new(config.cluster.clone(), storage).unwrap();
        let cluster = Cluster::new(
            config.cluster.clone(),
            Arc::new(StatsLedger::new()),
            Arc::new(OfflineConnector),
        );
        AppState::new(cluster, engine, &config)
    }

    fn place(dir: &std::path::Path, hash: &str, data: &[u8]) {
        let path = crate::hashpath::cached_hash_path(&dir.join("cache"), hash);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn parts(method: Method, uri: &str) -> Parts {
        let (parts, ()) = Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn parts_with_secret(uri: &str, secret: &str) -> Parts {
        let (parts, ()) = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(MEASURE_SECRET_HEADER, secret)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[tokio::test]
    async fn test_download_serves_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None);
        place(dir.path(), HASH, &vec![3u8; 128]);

        let resp = download(
            State(state.clone()),
            Path(HASH.to_string()),
            parts(Method::GET, &format!("/download/{}", HASH)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 128);
        assert_eq!(
            state
                .cluster
                .counters()
                .byte_counter()
                .load(Ordering::Relaxed),
            128
        );
    }

    #[tokio::test]
    async fn test_download_rejects_junk_hash() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None);
        let resp = download(
            State(state),
            Path("not-a-hash".to_string()),
            parts(Method::GET, "/download/not-a-hash"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_non_get_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None);
        place(dir.path(), HASH, b"data");
        let resp = download(
            State(state),
            Path(HASH.to_string()),
            parts(Method::POST, &format!("/download/{}", HASH)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_redirect_base_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some("https://cdn.example/foo".to_string()));
        place(dir.path(), HASH, &vec![0u8; 1024]);

        let resp = download(
            State(state.clone()),
            Path(HASH.to_string()),
            parts(Method::GET, &format!("/download/{}?name=hello", HASH)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap().to_str().unwrap(),
            format!("https://cdn.example/foo/download/{}", HASH)
        );
        assert_eq!(
            state
                .cluster
                .counters()
                .byte_counter()
                .load(Ordering::Relaxed),
            1024
        );
    }

    #[tokio::test]
    async fn test_measure_requires_secret() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None);

        let resp = measure(
            State(state.clone()),
            Path("4".to_string()),
            parts(Method::GET, "/measure/4"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = measure(
            State(state),
            Path("4".to_string()),
            parts_with_secret("/measure/4", "wrong"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_measure_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None);

        let resp = measure(
            State(state.clone()),
            Path("201".to_string()),
            parts_with_secret("/measure/201", "dev-secret"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = measure(
            State(state.clone()),
            Path("abc".to_string()),
            parts_with_secret("/measure/abc", "dev-secret"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = measure(
            State(state),
            Path("0".to_string()),
            parts_with_secret("/measure/0", "dev-secret"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 2);
    }

    #[tokio::test]
    async fn test_measure_redirect_base() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), Some("https://cdn.example".to_string()));
        let resp = measure(
            State(state),
            Path("10".to_string()),
            parts_with_secret("/measure/10", "dev-secret"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://cdn.example/measure/10"
        );
    }
}
