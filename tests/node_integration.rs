//! Integration tests driving the sync engine and the serving frontend
//! against a stub control plane on localhost.

use axum::extract::Path as AxPath;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use bmcl_edge::cluster::Cluster;
use bmcl_edge::config::EdgeConfig;
use bmcl_edge::hashpath::cached_hash_path;
use bmcl_edge::manifest::{encode_manifest, FileEntry};
use bmcl_edge::serve::{router, AppState};
use bmcl_edge::socket::SocketIoConnector;
use bmcl_edge::stats::StatsLedger;
use bmcl_edge::storage::LocalStorage;
use bmcl_edge::sync::{purge_tmp_dir, SyncEngine};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Stub control plane serving a manifest and file bodies.
struct ControlPlane {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

async fn start_control_plane(entries: Vec<FileEntry>, bodies: HashMap<String, Vec<u8>>) -> ControlPlane {
    let manifest = encode_manifest(&entries).unwrap();
    let bodies = Arc::new(bodies);
    let app = Router::new()
        .route(
            "/openbmclapi/files",
            get(move || {
                let manifest = manifest.clone();
                async move { manifest }
            }),
        )
        .route(
            "/openbmclapi/download/:name",
            get(move |AxPath(name): AxPath<String>| {
                let bodies = Arc::clone(&bodies);
                async move {
                    match bodies.get(&name) {
                        Some(body) => (StatusCode::OK, body.clone()),
                        None => (StatusCode::NOT_FOUND, Vec::new()),
                    }
                }
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    ControlPlane { addr, _task: task }
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn node_config(base: &std::path::Path, control: &ControlPlane) -> EdgeConfig {
    let mut config = EdgeConfig::development(base);
    config.cluster.prefix = format!("http://{}", control.addr);
    config
}

fn build_engine(config: &EdgeConfig) -> Arc<SyncEngine> {
    purge_tmp_dir(&config.cluster).unwrap();
    let storage = Arc::new(LocalStorage::new(config.cluster.cache_dir(), None));
    SyncEngine::new(config.cluster.clone(), storage).unwrap()
}

fn entry_for(content: &[u8]) -> (FileEntry, String) {
    let hash = md5_hex(content);
    (
        FileEntry {
            path: format!("/openbmclapi/download/{}", hash),
            hash: hash.clone(),
            size: content.len() as i64,
        },
        hash,
    )
}

#[tokio::test]
async fn test_cold_start_sync_two_files() {
    let content_a = vec![7u8; 1024];
    let content_b = vec![9u8; 2048];
    let (entry_a, hash_a) = entry_for(&content_a);
    let (entry_b, hash_b) = entry_for(&content_b);
    let control = start_control_plane(
        vec![entry_a, entry_b],
        HashMap::from([
            (hash_a.clone(), content_a.clone()),
            (hash_b.clone(), content_b.clone()),
        ]),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let config = node_config(dir.path(), &control);
    let engine = build_engine(&config);

    let manifest = engine.fetch_manifest().await.unwrap();
    assert_eq!(manifest.len(), 2);
    engine.sync(manifest).await.unwrap();

    let cache = config.cluster.cache_dir();
    let file_a = cached_hash_path(&cache, &hash_a);
    let file_b = cached_hash_path(&cache, &hash_b);
    assert_eq!(std::fs::read(&file_a).unwrap(), content_a);
    assert_eq!(std::fs::read(&file_b).unwrap(), content_b);

    // GC ran against the manifest and removed nothing.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(file_a.exists());
    assert!(file_b.exists());
}

#[tokio::test]
async fn test_truncated_file_is_redownloaded() {
    let content = vec![3u8; 1024];
    let (entry, hash) = entry_for(&content);
    let control =
        start_control_plane(vec![entry.clone()], HashMap::from([(hash.clone(), content.clone())]))
            .await;

    let dir = tempfile::tempdir().unwrap();
    let config = node_config(dir.path(), &control);
    let engine = build_engine(&config);

    // Pre-place a file of the declared size: only the size check runs, so
    // nothing is re-downloaded.
    let path = cached_hash_path(&config.cluster.cache_dir(), &hash);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![0u8; 1024]).unwrap();
    let missing = engine.check_files(&[entry.clone()]).await;
    assert!(missing.is_empty());

    // Truncate: the next pass re-downloads and restores the real content.
    std::fs::write(&path, vec![0u8; 500]).unwrap();
    let missing = engine.check_files(&[entry.clone()]).await;
    assert_eq!(missing.len(), 1);

    engine.sync(vec![entry]).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), content);
}

#[tokio::test]
async fn test_integrity_failure_leaves_no_file() {
    // The upstream body does not match the declared hash.
    let content = vec![1u8; 64];
    let bogus_hash = "ff000000000000000000000000000000".to_string();
    let control = start_control_plane(
        Vec::new(),
        HashMap::from([(bogus_hash.clone(), content.clone())]),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let config = node_config(dir.path(), &control);
    let engine = build_engine(&config);

    let entry = FileEntry {
        path: format!("/openbmclapi/download/{}", bogus_hash),
        hash: bogus_hash.clone(),
        size: 64,
    };
    engine.sync(vec![entry]).await.unwrap();

    // The failed file never reached its hash path, and no temp leaked.
    let path = cached_hash_path(&config.cluster.cache_dir(), &bogus_hash);
    assert!(!path.exists());
    let leftovers: Vec<_> = std::fs::read_dir(config.cluster.tmp_dir())
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_serve_download_end_to_end() {
    let content = vec![5u8; 4096];
    let (entry, hash) = entry_for(&content);
    let control =
        start_control_plane(vec![entry], HashMap::from([(hash.clone(), content.clone())])).await;

    let dir = tempfile::tempdir().unwrap();
    let config = node_config(dir.path(), &control);
    let engine = build_engine(&config);
    let cluster = Cluster::new(
        config.cluster.clone(),
        Arc::new(StatsLedger::new()),
        Arc::new(SocketIoConnector),
    );
    let state = AppState::new(Arc::clone(&cluster), Arc::clone(&engine), &config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });

    let client = reqwest::Client::new();

    // Cache miss triggers a foreground fetch from the control plane.
    let resp = client
        .get(format!("http://{}/download/{}", addr, hash))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers()["x-bmclapi-hash"], hash.as_str());
    assert_eq!(resp.bytes().await.unwrap().as_ref(), content.as_slice());

    // First-byte range serves exactly one byte.
    let resp = client
        .get(format!("http://{}/download/{}", addr, hash))
        .header("Range", "bytes=0-0")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.bytes().await.unwrap().len(), 1);

    // Unknown content is a 404 once the foreground fetch fails.
    let resp = client
        .get(format!(
            "http://{}/download/dd000000000000000000000000000004",
            addr
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // Measurements demand the cluster secret.
    let resp = client
        .get(format!("http://{}/measure/1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    let resp = client
        .get(format!("http://{}/measure/1", addr))
        .header("x-openbmclapi-secret", "dev-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 1024 * 1024);
    assert!(body.iter().all(|&b| b == 0));

    // Everything else is a 404.
    let resp = client
        .get(format!("http://{}/dashboard", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}
