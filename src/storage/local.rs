//! Local filesystem backend.
//!
//! Files live under `cache/<hash[0:2]>/<hash>` with mode 0644. Creation
//! goes through the shared temp directory and a rename, so a file at its
//! hash path is always complete. Downloads either stream from disk with
//! range and conditional support, or redirect to a configured base URL.

use super::{counting_body, SourceFile, Storage, StorageContext};
use crate::config::StorageEntryConfig;
use crate::error::{EdgeError, Result};
use crate::hashpath::{cached_hash_path, hex_prefixes};
use crate::util::{self, file_stream, join_url, parse_range, zero_chunk};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeekExt};

/// Thirty days, the client-side cache lifetime of immutable content.
const DOWNLOAD_CACHE_CONTROL: &str = "max-age=2592000";

pub struct LocalStorage {
    cache_dir: PathBuf,
    redirect_base: Option<String>,
}

pub(super) fn construct(ctx: &StorageContext<'_>) -> Result<Arc<dyn Storage>> {
    match &ctx.config.storage {
        StorageEntryConfig::Local(_) => Ok(Arc::new(LocalStorage::new(
            ctx.config.cluster.cache_dir(),
            ctx.config.cluster.redirect_base.clone(),
        ))),
        other => Err(EdgeError::config(
            "storage.type",
            format!("local constructor invoked for {:?} entry", other.tag()),
        )),
    }
}

impl LocalStorage {
    pub fn new(cache_dir: PathBuf, redirect_base: Option<String>) -> Self {
        Self {
            cache_dir,
            redirect_base,
        }
    }

    fn hash_path(&self, hash: &str) -> PathBuf {
        cached_hash_path(&self.cache_dir, hash)
    }
}

fn not_found(hash: &str, e: std::io::Error) -> EdgeError {
    if e.kind() == std::io::ErrorKind::NotFound {
        EdgeError::NotFound(hash.to_string())
    } else {
        EdgeError::Io(e)
    }
}

fn response_builder(status: StatusCode) -> axum::http::response::Builder {
    Response::builder().status(status)
}

fn finish(builder: axum::http::response::Builder, body: Body) -> Result<Response> {
    builder
        .body(body)
        .map_err(|e| EdgeError::Internal(e.to_string()))
}

/// Extract the `name` query parameter used as the serving filename.
fn name_param(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "name")
        .map(|(_, v)| v.into_owned())
}

#[async_trait]
impl Storage for LocalStorage {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        Ok(())
    }

    async fn size(&self, hash: &str) -> Result<i64> {
        let path = self.hash_path(hash);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found(hash, e))?;
        if !meta.is_file() {
            return Err(EdgeError::NotFound(hash.to_string()));
        }
        Ok(meta.len() as i64)
    }

    async fn open(&self, hash: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(self.hash_path(hash))
            .await
            .map_err(|e| not_found(hash, e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, hash: &str, source: SourceFile) -> Result<()> {
        let dest = self.hash_path(hash);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Drop any stale copy before the rename lands the new one.
        match tokio::fs::remove_file(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        source.persist_to(&dest)
    }

    async fn remove(&self, hash: &str) -> Result<()> {
        tokio::fs::remove_file(self.hash_path(hash))
            .await
            .map_err(|e| not_found(hash, e))
    }

    async fn walk(&self, cb: &mut (dyn for<'a> FnMut(&'a str, i64) -> Result<()> + Send)) -> Result<()> {
        for prefix in hex_prefixes() {
            let dir = self.cache_dir.join(&prefix);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = match entry.metadata().await {
                    Ok(meta) if meta.is_file() => meta,
                    _ => continue,
                };
                let file_name_os = entry.file_name();
                let Some(name) = file_name_os.to_str() else { continue };
                if name.len() >= 2 && name.starts_with(prefix.as_str()) {
                    cb(name, meta.len() as i64)?;
                }
            }
        }
        Ok(())
    }

    async fn serve_download(
        &self,
        parts: &Parts,
        hash: &str,
        size: i64,
        hbytes: Arc<AtomicI64>,
    ) -> Result<Response> {
        if let Some(base) = &self.redirect_base {
            let target = join_url(base, &format!("/download/{}", hash))?;
            hbytes.fetch_add(size, Ordering::Relaxed);
            return finish(
                response_builder(StatusCode::FOUND).header(header::LOCATION, target),
                Body::empty(),
            );
        }

        let path = self.hash_path(hash);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found(hash, e))?;
        let file_size = meta.len() as i64;
        let etag = format!("\"{}\"", hash);

        let mut builder = response_builder(StatusCode::OK)
            .header(header::CACHE_CONTROL, DOWNLOAD_CACHE_CONTROL)
            .header("x-bmclapi-hash", hash)
            .header(header::ETAG, etag.clone())
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if let Some(name) = name_param(parts) {
            let disposition = format!("inline; filename=\"{}\"", name.replace('"', ""));
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                builder = builder.header(header::CONTENT_DISPOSITION, value);
            }
        }

        // Content is immutable per hash, so the ETag alone decides.
        if let Some(inm) = parts.headers.get(header::IF_NONE_MATCH) {
            if inm.to_str().map(|v| v.contains(&etag)).unwrap_or(false) {
                return finish(
                    builder.status(StatusCode::NOT_MODIFIED),
                    Body::empty(),
                );
            }
        }

        let range = parts
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, file_size));

        match range {
            Some(ranges) if ranges.len() == 1 => {
                let (start, len) = ranges[0];
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| not_found(hash, e))?;
                file.seek(SeekFrom::Start(start as u64)).await?;
                finish(
                    builder
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(
                            header::CONTENT_RANGE,
                            format!("bytes {}-{}/{}", start, start + len - 1, file_size),
                        )
                        .header(header::CONTENT_LENGTH, len),
                    counting_body(file_stream(file, len), hbytes),
                )
            }
            Some(ranges) if ranges.is_empty() => finish(
                builder
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", file_size)),
                Body::empty(),
            ),
            // Multiple ranges and malformed headers fall back to the whole
            // entity.
            _ => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| not_found(hash, e))?;
                finish(
                    builder.header(header::CONTENT_LENGTH, file_size),
                    counting_body(file_stream(file, file_size), hbytes),
                )
            }
        }
    }

    async fn serve_measure(&self, parts: &Parts, size_mb: u32) -> Result<Response> {
        let total: i64 = if size_mb == 0 {
            2
        } else {
            size_mb as i64 * util::MB as i64
        };
        let builder = response_builder(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if parts.method == Method::HEAD {
            return finish(builder, Body::empty());
        }
        let body = if size_mb == 0 {
            Body::from(Bytes::from_static(&[0u8, 0u8]))
        } else {
            let chunks =
                (0..size_mb).map(|_| Ok::<_, std::convert::Infallible>(zero_chunk()));
            Body::from_stream(futures::stream::iter(chunks))
        };
        finish(builder, body)
    }

    fn describe(&self) -> String {
        format!("<LocalStorage dir={:?}>", self.cache_dir)
    }
}

impl LocalStorage {
    /// Root directory, exposed for the sync engine's consistency checks.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tokio::io::AsyncReadExt;
    use std::io::Write;

    fn storage(dir: &Path) -> LocalStorage {
        LocalStorage::new(dir.join("cache"), None)
    }

    fn source(dir: &Path, data: &[u8]) -> SourceFile {
        let tmp_dir = dir.join("cache").join(".tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        let mut temp = tempfile::Builder::new()
            .suffix(".downloading")
            .tempfile_in(&tmp_dir)
            .unwrap();
        temp.write_all(data).unwrap();
        SourceFile::new(temp, data.len() as i64)
    }

    fn get_request(uri: &str) -> Parts {
        let (parts, ()) = Request::builder().uri(uri).body(()).unwrap().into_parts();
        parts
    }

    const HASH: &str = "aa000000000000000000000000000001";

    #[tokio::test]
    async fn test_create_size_open_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage.init().await.unwrap();

        assert!(storage.size(HASH).await.unwrap_err().is_not_found());

        storage
            .create(HASH, source(dir.path(), b"hello world"))
            .await
            .unwrap();
        assert_eq!(storage.size(HASH).await.unwrap(), 11);

        let mut reader = storage.open(HASH).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello world");

        storage.remove(HASH).await.unwrap();
        assert!(storage.size(HASH).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage.init().await.unwrap();
        storage
            .create(HASH, source(dir.path(), b"old old old"))
            .await
            .unwrap();
        storage
            .create(HASH, source(dir.path(), b"new"))
            .await
            .unwrap();
        assert_eq!(storage.size(HASH).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_walk_reports_prefixed_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage.init().await.unwrap();
        storage
            .create(HASH, source(dir.path(), b"data"))
            .await
            .unwrap();
        // A file whose name does not carry its directory prefix is skipped.
        std::fs::write(dir.path().join("cache").join("aa").join("zz-stray"), b"x").unwrap();

        let mut seen = Vec::new();
        storage
            .walk(&mut |hash, size| {
                seen.push((hash.to_string(), size));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![(HASH.to_string(), 4)]);
    }

    #[tokio::test]
    async fn test_serve_download_full() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage.init().await.unwrap();
        storage
            .create(HASH, source(dir.path(), &vec![5u8; 1000]))
            .await
            .unwrap();

        let hbytes = Arc::new(AtomicI64::new(0));
        let parts = get_request(&format!("/download/{}", HASH));
        let resp = storage
            .serve_download(&parts, HASH, 1000, Arc::clone(&hbytes))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-bmclapi-hash").unwrap(),
            &HeaderValue::from_static(HASH)
        );
        assert_eq!(
            resp.headers().get(header::CACHE_CONTROL).unwrap(),
            "max-age=2592000"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 1000);
        assert_eq!(hbytes.load(Ordering::Relaxed), 1000);
    }

    #[tokio::test]
    async fn test_serve_download_first_byte_range() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage.init().await.unwrap();
        storage
            .create(HASH, source(dir.path(), &vec![9u8; 4096]))
            .await
            .unwrap();

        let hbytes = Arc::new(AtomicI64::new(0));
        let (mut parts, ()) = Request::builder()
            .uri(format!("/download/{}", HASH))
            .body(())
            .unwrap()
            .into_parts();
        parts
            .headers
            .insert(header::RANGE, HeaderValue::from_static("bytes=0-0"));
        let resp = storage
            .serve_download(&parts, HASH, 4096, Arc::clone(&hbytes))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            resp.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 0-0/4096"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(hbytes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_serve_download_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage.init().await.unwrap();
        storage
            .create(HASH, source(dir.path(), b"body"))
            .await
            .unwrap();

        let (mut parts, ()) = Request::builder()
            .uri(format!("/download/{}", HASH))
            .body(())
            .unwrap()
            .into_parts();
        parts.headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_str(&format!("\"{}\"", HASH)).unwrap(),
        );
        let hbytes = Arc::new(AtomicI64::new(0));
        let resp = storage
            .serve_download(&parts, HASH, 4, Arc::clone(&hbytes))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(hbytes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_serve_download_redirect_base() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(
            dir.path().join("cache"),
            Some("https://cdn.example/foo".to_string()),
        );
        let hbytes = Arc::new(AtomicI64::new(0));
        let parts = get_request(&format!("/download/{}?name=hello", HASH));
        let resp = storage
            .serve_download(&parts, HASH, 1024, Arc::clone(&hbytes))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            &HeaderValue::from_str(&format!("https://cdn.example/foo/download/{}", HASH)).unwrap()
        );
        // The declared size is accounted even though nothing streamed.
        assert_eq!(hbytes.load(Ordering::Relaxed), 1024);
    }

    #[tokio::test]
    async fn test_serve_measure_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let parts = get_request("/measure/0");
        let resp = storage.serve_measure(&parts, 0).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 2);

        let parts = get_request("/measure/4");
        let resp = storage.serve_measure(&parts, 4).await.unwrap();
        assert_eq!(
            resp.headers().get(header::CONTENT_LENGTH).unwrap(),
            &HeaderValue::from(4 * util::MB as i64)
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 4 * util::MB);
        assert!(body.iter().all(|&b| b == 0));
    }
}
