//! Remote WebDAV backend.
//!
//! Files are proxied from (or redirected to) an upstream WebDAV endpoint
//! under `download/<hash[0:2]>/<hash>`. Upstream redirects can be cached
//! per hash with a TTL so repeated downloads short-circuit to a `302`
//! without another upstream round-trip. All upstream traffic flows through
//! the backend's own connection and rate limits.

use super::{copy_header, counting_body, SourceFile, Storage, StorageContext};
use crate::cache::{Cache, NoCache, WithNamespace};
use crate::config::{StorageEntryConfig, WebDavStorageOption};
use crate::error::{EdgeError, Result};
use crate::ratelimit::{throttle_read_stream, throttle_write_stream, LimitedReader, RateLimiter};
use crate::util::{self, file_stream, join_url, ranged_size, zero_stream, StreamReader};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

/// Conditional headers forwarded verbatim to the upstream.
const FORWARDED_CONDITIONALS: [&str; 5] = [
    "if-modified-since",
    "if-unmodified-since",
    "if-none-match",
    "if-match",
    "if-range",
];

pub struct WebDavStorage {
    endpoint: String,
    username: String,
    password: String,
    opt: WebDavStorageOption,
    cache: Box<dyn Cache>,
    limiter: RateLimiter,
    /// Follows upstream redirects.
    client: reqwest::Client,
    /// Hands redirects back to the caller.
    no_redirect: reqwest::Client,
}

pub(super) fn construct(ctx: &StorageContext<'_>) -> Result<Arc<dyn Storage>> {
    let opt = match &ctx.config.storage {
        StorageEntryConfig::Webdav(opt) => opt.clone(),
        other => {
            return Err(EdgeError::config(
                "storage.type",
                format!("webdav constructor invoked for {:?} entry", other.tag()),
            ))
        }
    };
    WebDavStorage::new(opt, ctx).map(|s| Arc::new(s) as Arc<dyn Storage>)
}

impl WebDavStorage {
    pub fn new(opt: WebDavStorageOption, ctx: &StorageContext<'_>) -> Result<Self> {
        let (endpoint, username, password) = resolve_credentials(&opt, ctx)?;

        let cache: Box<dyn Cache> = if opt.redirect_link_cache.is_zero() {
            Box::new(NoCache)
        } else {
            Box::new(WithNamespace::new(
                Arc::clone(&ctx.redirect_cache),
                WithNamespace::redirect_namespace(&username, &endpoint),
            ))
        };

        let limiter = RateLimiter::new(
            opt.max_conn,
            opt.max_download_rate * 1024,
            opt.max_upload_rate * 1024,
        );

        let user_agent = format!("openbmclapi-cluster/{}", env!("CARGO_PKG_VERSION"));
        let client = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .build()
            .map_err(|e| EdgeError::Internal(e.to_string()))?;
        let no_redirect = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| EdgeError::Internal(e.to_string()))?;

        Ok(Self {
            endpoint,
            username,
            password,
            opt,
            cache,
            limiter,
            client,
            no_redirect,
        })
    }

    fn remote_path(hash: &str) -> String {
        format!("download/{}/{}", &hash[..2], hash)
    }

    fn url_for(&self, path: &str) -> Result<String> {
        join_url(&self.endpoint, path)
    }

    fn request(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        url: &str,
    ) -> reqwest::RequestBuilder {
        client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Upload a body of known size with the write-rate limit applied.
    async fn put_file<S, E>(&self, path: &str, size: i64, stream: S) -> Result<()>
    where
        S: futures::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + Unpin + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let url = self.url_for(path)?;
        debug!(url = %url, size, "putting file");
        let throttled = throttle_write_stream(self.limiter.controller(), stream);
        let resp = self
            .request(&self.client, reqwest::Method::PUT, &url)
            .header(header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(throttled))
            .send()
            .await?;
        match resp.status().as_u16() {
            200 | 201 | 204 => Ok(()),
            code => Err(EdgeError::HttpStatus(code)),
        }
    }

    /// Size of a remote file via HEAD, following redirects.
    async fn stat_size(&self, path: &str) -> Result<i64> {
        let url = self.url_for(path)?;
        let resp = self
            .request(&self.client, reqwest::Method::HEAD, &url)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => resp
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(|| {
                    EdgeError::Storage(format!("no content-length in HEAD of {}", url))
                }),
            StatusCode::NOT_FOUND => Err(EdgeError::NotFound(path.to_string())),
            s => Err(EdgeError::HttpStatus(s.as_u16())),
        }
    }

    /// Ensure `measure/<n>` exists upstream with the exact expected size.
    async fn create_measure_file(&self, size_mb: u32) -> Result<()> {
        let path = format!("measure/{}", size_mb);
        let expect = measure_file_size(size_mb);
        match self.stat_size(&path).await {
            Ok(size) if size == expect => return Ok(()),
            Ok(size) => {
                debug!(path = %path, size, expect, "measure file size mismatch, recreating");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => warn!(path = %path, error = %e, "cannot stat measure file"),
        }
        info!(path = %path, "creating measure file");
        self.put_file(&path, expect, Box::pin(zero_stream(expect))).await
    }
}

fn resolve_credentials(
    opt: &WebDavStorageOption,
    ctx: &StorageContext<'_>,
) -> Result<(String, String, String)> {
    if let Some(alias) = &opt.alias {
        let user = ctx.config.webdav_users.get(alias).ok_or_else(|| {
            EdgeError::config(
                "storage.alias",
                format!("webdav user {:?} does not exist", alias),
            )
        })?;
        // The entry's own endpoint resolves relative to the alias endpoint.
        let endpoint = match &opt.endpoint {
            Some(own) => url::Url::parse(&user.endpoint)?.join(own)?.to_string(),
            None => user.endpoint.clone(),
        };
        Ok((
            endpoint,
            opt.username.clone().unwrap_or_else(|| user.username.clone()),
            opt.password.clone().unwrap_or_else(|| user.password.clone()),
        ))
    } else {
        let endpoint = opt
            .endpoint
            .clone()
            .ok_or_else(|| EdgeError::config("storage.endpoint", "missing endpoint"))?;
        Ok((
            endpoint,
            opt.username.clone().unwrap_or_default(),
            opt.password.clone().unwrap_or_default(),
        ))
    }
}

/// The exact upstream size of `measure/<n>`: `n` MiB, except 2 bytes for
/// the zero probe.
fn measure_file_size(size_mb: u32) -> i64 {
    if size_mb == 0 {
        2
    } else {
        size_mb as i64 * util::MB as i64
    }
}

/// Pull `(name, size)` pairs for one prefix directory out of a PROPFIND
/// multistatus body. Tolerant of namespace prefixes and formatting.
fn parse_multistatus(body: &str, prefix: &str) -> Vec<(String, i64)> {
    let lower = body.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(start) = find_open_tag(&lower, pos, "href") {
        let Some(end) = lower[start..].find('<').map(|i| start + i) else {
            break;
        };
        let href = body[start..end].trim();
        // Props for this member run until the next href element.
        let window_end = find_open_tag(&lower, end, "href").unwrap_or(lower.len());
        let window = &lower[end..window_end];
        pos = end;

        let name = href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string();
        if name.len() < 2 || !name.starts_with(prefix) || name == prefix {
            continue;
        }
        let size = extract_tag(window, "getcontentlength").and_then(|v| v.parse::<i64>().ok());
        if let Some(size) = size {
            out.push((name, size));
        }
    }
    out
}

/// Content start of the next opening `<[ns:]tag ...>` element at or after
/// `from`; closing and foreign tags are skipped.
fn find_open_tag(lower: &str, from: usize, tag: &str) -> Option<usize> {
    let mut pos = from;
    while let Some(i) = lower[pos..].find('<') {
        let tag_start = pos + i + 1;
        pos = tag_start;
        let rest = &lower[tag_start..];
        if rest.starts_with('/') {
            continue;
        }
        let gt = rest.find('>')?;
        let raw = rest[..gt].split_whitespace().next().unwrap_or("");
        let name = raw.rsplit(':').next().unwrap_or(raw);
        if name == tag {
            return Some(tag_start + gt + 1);
        }
    }
    None
}

fn extract_tag<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let start = find_open_tag(block, 0, tag)?;
    let end = block[start..].find('<')? + start;
    Some(block[start..end].trim())
}

#[async_trait]
impl Storage for WebDavStorage {
    async fn init(&self) -> Result<()> {
        let url = self.url_for("measure")?;
        let mkcol = reqwest::Method::from_bytes(b"MKCOL").expect("MKCOL is a valid method");
        match self.request(&self.client, mkcol, &url).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                // 405 and 409 mean the collection already exists.
                if !(resp.status().is_success() || code == 405 || code == 409) {
                    warn!(storage = %self.describe(), code, "could not create measure folder");
                }
            }
            Err(e) => warn!(storage = %self.describe(), error = %e, "could not create measure folder"),
        }

        if self.opt.pre_gen_measures {
            info!(storage = %self.describe(), "creating measure files");
            for i in 1..=200 {
                if let Err(e) = self.create_measure_file(i).await {
                    error!(size_mb = i, error = %e, "cannot pre-generate measure file");
                    std::process::exit(2);
                }
            }
            info!("measure files created");
        }
        Ok(())
    }

    async fn size(&self, hash: &str) -> Result<i64> {
        let _permit = self.limiter.conns().acquire().await?;
        self.stat_size(&Self::remote_path(hash)).await
    }

    async fn open(&self, hash: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let _permit = self.limiter.conns().acquire().await?;
        let url = self.url_for(&Self::remote_path(hash))?;
        let resp = self
            .request(&self.client, reqwest::Method::GET, &url)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => {
                let reader = StreamReader::new(Box::pin(resp.bytes_stream()));
                Ok(Box::new(LimitedReader::new(reader, self.limiter.controller())))
            }
            StatusCode::NOT_FOUND => Err(EdgeError::NotFound(hash.to_string())),
            s => Err(EdgeError::HttpStatus(s.as_u16())),
        }
    }

    async fn create(&self, hash: &str, source: SourceFile) -> Result<()> {
        let _permit = self.limiter.conns().acquire().await?;
        let size = source.size();
        let file = source.reopen()?;
        self.put_file(
            &Self::remote_path(hash),
            size,
            Box::pin(file_stream(file, size)),
        )
        .await
    }

    async fn remove(&self, hash: &str) -> Result<()> {
        let _permit = self.limiter.conns().acquire().await?;
        let url = self.url_for(&Self::remote_path(hash))?;
        let resp = self
            .request(&self.client, reqwest::Method::DELETE, &url)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(EdgeError::NotFound(hash.to_string())),
            s => Err(EdgeError::HttpStatus(s.as_u16())),
        }
    }

    async fn walk(&self, cb: &mut (dyn for<'a> FnMut(&'a str, i64) -> Result<()> + Send)) -> Result<()> {
        let _permit = self.limiter.conns().acquire().await?;
        let propfind = reqwest::Method::from_bytes(b"PROPFIND").expect("valid method");
        for prefix in crate::hashpath::hex_prefixes() {
            let url = self.url_for(&format!("download/{}", prefix))?;
            let resp = match self
                .request(&self.client, propfind.clone(), &url)
                .header("Depth", "1")
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(_) => continue,
            };
            if !resp.status().is_success() {
                continue;
            }
            let body = match resp.text().await {
                Ok(body) => body,
                Err(_) => continue,
            };
            for (name, size) in parse_multistatus(&body, &prefix) {
                cb(&name, size)?;
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
        let range_header = parts
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok());

        if !self.opt.follow_redirect && !self.opt.redirect_link_cache.is_zero() {
            if let Some(location) = self.cache.get(hash) {
                let accounted = ranged_size(range_header, size);
                hbytes.fetch_add(accounted, Ordering::Relaxed);
                return Response::builder()
                    .status(StatusCode::FOUND)
                    .header(header::LOCATION, location)
                    .header(
                        header::CACHE_CONTROL,
                        format!("public,max-age={}", self.opt.redirect_link_cache.as_secs()),
                    )
                    .body(Body::empty())
                    .map_err(|e| EdgeError::Internal(e.to_string()));
            }
        }

        let url = self.url_for(&Self::remote_path(hash))?;
        let client = if self.opt.follow_redirect {
            &self.client
        } else {
            &self.no_redirect
        };
        let mut req = self.request(client, reqwest::Method::GET, &url);
        if let Some(range) = range_header {
            req = req.header(header::RANGE, range);
        }
        for key in FORWARDED_CONDITIONALS {
            if let Some(v) = parts.headers.get(key) {
                req = req.header(key, v.clone());
            }
        }

        let permit = self.limiter.conns().acquire().await?;
        let resp = req.send().await?;
        debug!(url = %url, status = %resp.status(), "requested upstream");

        let status = resp.status();
        match status.as_u16() / 100 {
            3 => {
                let accounted = ranged_size(range_header, size);
                let mut builder = Response::builder().status(status);
                if let Some(headers) = builder.headers_mut() {
                    copy_header("location", headers, resp.headers());
                    copy_header("etag", headers, resp.headers());
                    copy_header("last-modified", headers, resp.headers());
                }
                if !self.opt.redirect_link_cache.is_zero() {
                    if let Some(location) =
                        resp.headers().get(header::LOCATION).and_then(|v| v.to_str().ok())
                    {
                        self.cache.set(
                            hash,
                            location.to_string(),
                            self.opt.redirect_link_cache,
                        );
                    }
                    builder = builder.header(
                        header::CACHE_CONTROL,
                        format!("public,max-age={}", self.opt.redirect_link_cache.as_secs()),
                    );
                }
                hbytes.fetch_add(accounted, Ordering::Relaxed);
                builder
                    .body(Body::empty())
                    .map_err(|e| EdgeError::Internal(e.to_string()))
            }
            2 => {
                let mut builder = Response::builder().status(status);
                if let Some(headers) = builder.headers_mut() {
                    copy_header("etag", headers, resp.headers());
                    copy_header("last-modified", headers, resp.headers());
                    copy_header("content-length", headers, resp.headers());
                    copy_header("content-range", headers, resp.headers());
                    copy_header("content-type", headers, resp.headers());
                }
                let throttled =
                    throttle_read_stream(self.limiter.controller(), Box::pin(resp.bytes_stream()));
                // Hold the connection slot until the body finishes streaming.
                let guarded = futures::stream::unfold(
                    (Box::pin(throttled), Some(permit)),
                    |(mut stream, permit)| async move {
                        match stream.next().await {
                            Some(item) => Some((item, (stream, permit))),
                            None => None,
                        }
                    },
                );
                builder
                    .body(counting_body(guarded, hbytes))
                    .map_err(|e| EdgeError::Internal(e.to_string()))
            }
            _ => Err(EdgeError::HttpStatus(status.as_u16())),
        }
    }

    async fn serve_measure(&self, parts: &Parts, size_mb: u32) -> Result<Response> {
        self.create_measure_file(size_mb).await?;

        let url = self.url_for(&format!("measure/{}", size_mb))?;
        let mut req = self.request(&self.no_redirect, reqwest::Method::HEAD, &url);
        if let Some(range) = parts.headers.get(header::RANGE) {
            req = req.header(header::RANGE, range.clone());
        }
        for key in FORWARDED_CONDITIONALS {
            if let Some(v) = parts.headers.get(key) {
                req = req.header(key, v.clone());
            }
        }
        let _permit = self.limiter.conns().acquire().await?;
        let resp = req.send().await?;
        debug!(url = %url, status = %resp.status(), "requested upstream");

        if resp.status().as_u16() / 100 == 3 {
            let mut builder = Response::builder().status(resp.status());
            if let Some(headers) = builder.headers_mut() {
                copy_header("location", headers, resp.headers());
                copy_header("etag", headers, resp.headers());
                copy_header("last-modified", headers, resp.headers());
            }
            return builder
                .body(Body::empty())
                .map_err(|e| EdgeError::Internal(e.to_string()));
        }

        // On 2xx (or anything else) synthesise the zero payload locally;
        // streaming it off WebDAV would only burn upstream bandwidth.
        let total = measure_file_size(size_mb);
        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .header(header::CONTENT_TYPE, "application/octet-stream");
        let body = if parts.method == Method::HEAD {
            Body::empty()
        } else {
            Body::from_stream(zero_stream(total))
        };
        builder
            .body(body)
            .map_err(|e| EdgeError::Internal(e.to_string()))
    }

    fn describe(&self) -> String {
        format!(
            "<WebDavStorage endpoint={:?} user={}>",
            self.endpoint, self.username
        )
    }
}
