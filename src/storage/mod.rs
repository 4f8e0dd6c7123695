//! Storage backends for content-addressed files.
//!
//! A backend materialises manifest entries and serves them to clients. Two
//! implementations exist: the local filesystem cache and a remote WebDAV
//! endpoint. Backends register themselves in a process-wide factory map
//! keyed by a string tag (`"local"`, `"webdav"`), mirroring how the config
//! file selects them.

pub mod local;
pub mod webdav;

pub use local::LocalStorage;
pub use webdav::WebDavStorage;

use crate::cache::Cache;
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::request::Parts;
use axum::response::Response;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, OnceLock, RwLock};
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;

/// A fully-downloaded, verified file sitting in the temp directory,
/// ready to move into a backend.
///
/// The underlying temp file is deleted on drop, so abandoning a
/// `SourceFile` on any error path cleans up after itself.
pub struct SourceFile {
    temp: NamedTempFile,
    size: i64,
}

impl SourceFile {
    pub fn new(temp: NamedTempFile, size: i64) -> Self {
        Self { temp, size }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Reopen the file for another sequential read.
    pub fn reopen(&self) -> Result<tokio::fs::File> {
        let std_file = self.temp.reopen()?;
        Ok(tokio::fs::File::from_std(std_file))
    }

    /// Move the file to `dest` atomically and mark it world-readable.
    pub fn persist_to(self, dest: &Path) -> Result<()> {
        self.temp
            .persist(dest)
            .map_err(|e| EdgeError::Storage(format!("persist {:?}: {}", dest, e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }
}

/// Capability set every backend exposes.
#[async_trait]
pub trait Storage: Send + Sync {
    /// One-time setup with side effects (directory creation, measurement
    /// pre-generation).
    async fn init(&self) -> Result<()>;

    /// Size of the stored file, or `NotFound`.
    async fn size(&self, hash: &str) -> Result<i64>;

    /// Open the stored file for reading.
    async fn open(&self, hash: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Materialise a verified download under its hash path.
    async fn create(&self, hash: &str, source: SourceFile) -> Result<()>;

    /// Remove the stored file.
    async fn remove(&self, hash: &str) -> Result<()>;

    /// Enumerate stored files as `(hash, size)` pairs.
    async fn walk(&self, cb: &mut (dyn for<'a> FnMut(&'a str, i64) -> Result<()> + Send)) -> Result<()>;

    /// Serve a download request for `hash`, accounting served bytes into
    /// `hbytes` (immediately for redirects, per streamed chunk otherwise).
    async fn serve_download(
        &self,
        parts: &Parts,
        hash: &str,
        size: i64,
        hbytes: Arc<AtomicI64>,
    ) -> Result<Response>;

    /// Serve a measurement probe of `size_mb` MiB of zeros.
    async fn serve_measure(&self, parts: &Parts, size_mb: u32) -> Result<Response>;

    /// Human-readable description for log lines.
    fn describe(&self) -> String;
}

/// Everything a backend constructor may need.
pub struct StorageContext<'a> {
    pub config: &'a EdgeConfig,
    /// Shared redirect cache, namespaced per backend inside the constructor.
    pub redirect_cache: Arc<dyn Cache>,
}

type Constructor = fn(&StorageContext<'_>) -> Result<Arc<dyn Storage>>;

fn registry() -> &'static RwLock<HashMap<&'static str, Constructor>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Constructor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a backend constructor under its tag.
pub fn register_storage_factory(tag: &'static str, ctor: Constructor) {
    registry()
        .write()
        .expect("storage registry poisoned")
        .insert(tag, ctor);
}

/// Register the built-in backends. Idempotent; called once at startup.
pub fn register_builtin() {
    register_storage_factory("local", local::construct);
    register_storage_factory("webdav", webdav::construct);
}

/// Construct the backend selected by the configuration.
pub fn create_storage(ctx: &StorageContext<'_>) -> Result<Arc<dyn Storage>> {
    let tag = ctx.config.storage.tag();
    let ctor = {
        let reg = registry().read().expect("storage registry poisoned");
        reg.get(tag).copied()
    };
    match ctor {
        Some(ctor) => ctor(ctx),
        None => Err(EdgeError::config(
            "storage.type",
            format!("unknown storage backend {:?}", tag),
        )),
    }
}

/// Body wrapper adding each streamed chunk's length to a shared counter.
pub(crate) fn counting_body<S, E>(stream: S, counter: Arc<AtomicI64>) -> Body
where
    S: futures::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: Into<axum::BoxError> + 'static,
{
    use futures::StreamExt;
    let counted = stream.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            counter.fetch_add(bytes.len() as i64, std::sync::atomic::Ordering::Relaxed);
        }
        chunk
    });
    Body::from_stream(counted)
}

/// Copy a header from an upstream response into an outgoing response, if
/// present.
pub(crate) fn copy_header(
    key: &'static str,
    dst: &mut axum::http::HeaderMap,
    src: &axum::http::HeaderMap,
) {
    if let Some(v) = src.get(key) {
        dst.insert(key, v.clone());
    }
}
