//! Manifest synchronisation: diff, bounded parallel download, integrity
//! verification, drift re-checks and garbage collection.
//!
//! A sync pass never fails as a whole for a single file: each download
//! gets three attempts and persistent failures are counted and logged
//! while the pass moves on. When a pass outlives the configured interval
//! the manifest is fetched again and the whole pass restarts if anything
//! drifted. Garbage collection runs after a completed pass and backs off
//! as soon as a new sync starts.

use crate::config::ClusterConfig;
use crate::error::{EdgeError, Result};
use crate::hashpath::HashAlgo;
use crate::manifest::{decode_manifest, dedupe_by_hash, FileEntry};
use crate::storage::{SourceFile, Storage};
use crate::util::bytes_to_unit;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Attempts per file before a download counts as a persistent failure.
const DOWNLOAD_ATTEMPTS: u32 = 3;

/// Drives local content toward the authoritative manifest.
pub struct SyncEngine {
    config: ClusterConfig,
    storage: Arc<dyn Storage>,
    client: reqwest::Client,
    is_syncing: AtomicBool,
    /// In-flight foreground downloads keyed by hash; concurrent requests
    /// for one hash wait on the same completion channel.
    downloading: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

struct SyncProgress {
    total_size: f64,
    total_count: usize,
    downloaded: AtomicI64,
    done: AtomicI32,
    failed: AtomicI32,
}

/// Clears the syncing flag when a pass unwinds on any path.
struct SyncFlagGuard<'a>(&'a AtomicBool);

impl Drop for SyncFlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(config: ClusterConfig, storage: Arc<dyn Storage>) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .user_agent(format!("openbmclapi-cluster/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EdgeError::Internal(e.to_string()))?;
        Ok(Arc::new(Self {
            config,
            storage,
            client,
            is_syncing: AtomicBool::new(false),
            downloading: Mutex::new(HashMap::new()),
        }))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    fn control_get(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.prefix.trim_end_matches('/'), path);
        self.client
            .get(url)
            .basic_auth(&self.config.cluster_id, Some(&self.config.cluster_secret))
    }

    /// Fetch and decode the authoritative manifest.
    pub async fn fetch_manifest(&self) -> Result<Vec<FileEntry>> {
        let resp = self.control_get("/openbmclapi/files").send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            let code = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(code, body = %body, "unexpected manifest response");
            return Err(EdgeError::HttpStatus(code));
        }
        debug!("parsing manifest body");
        let body = resp.bytes().await?;
        Ok(dedupe_by_hash(decode_manifest(&body)?))
    }

    /// Probe storage for every entry; returns the entries that must be
    /// downloaded (missing or wrong size).
    pub async fn check_files(&self, entries: &[FileEntry]) -> Vec<FileEntry> {
        info!("start checking files");
        let mut missing = Vec::new();
        for entry in entries {
            match self.storage.size(&entry.hash).await {
                Ok(size) if size == entry.size => {}
                Ok(size) => {
                    info!(
                        hash = %entry.hash,
                        got = %bytes_to_unit(size as f64),
                        expect = %bytes_to_unit(entry.size as f64),
                        "found modified file"
                    );
                    missing.push(entry.clone());
                }
                Err(e) if e.is_not_found() => missing.push(entry.clone()),
                Err(e) => {
                    // The stored copy is unreadable; drop it and re-fetch.
                    warn!(hash = %entry.hash, error = %e, "removing unreadable file");
                    let _ = self.storage.remove(&entry.hash).await;
                    missing.push(entry.clone());
                }
            }
        }
        info!("file check finished");
        missing
    }

    /// Reconcile storage against `entries`, then garbage-collect.
    ///
    /// A second concurrent sync is rejected with a warning.
    pub async fn sync(self: &Arc<Self>, entries: Vec<FileEntry>) -> Result<()> {
        info!("preparing to sync files");
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("another sync task is running");
            return Ok(());
        }
        let guard = SyncFlagGuard(&self.is_syncing);

        let mut manifest = entries;
        loop {
            let mut missing = self.check_files(&manifest).await;
            if missing.is_empty() {
                info!("all files synchronized");
                break;
            }

            // Largest first: start the long poles early.
            missing.sort_by(|a, b| b.size.cmp(&a.size));

            let progress = Arc::new(SyncProgress {
                total_size: missing.iter().map(|e| e.size as f64).sum(),
                total_count: missing.len(),
                downloaded: AtomicI64::new(0),
                done: AtomicI32::new(0),
                failed: AtomicI32::new(0),
            });
            info!(
                count = progress.total_count,
                total = %bytes_to_unit(progress.total_size),
                "starting file sync"
            );
            let start = Instant::now();

            let semaphore = Arc::new(Semaphore::new(self.config.max_conn));
            let mut tasks = JoinSet::new();
            for entry in missing {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| EdgeError::Cancelled)?;
                let engine = Arc::clone(self);
                let progress = Arc::clone(&progress);
                tasks.spawn(async move {
                    let _permit = permit;
                    engine.sync_one(entry, &progress).await;
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_cancelled() {
                        return Err(EdgeError::Cancelled);
                    }
                    error!(error = %e, "download task panicked");
                }
            }

            let elapsed = start.elapsed();
            info!(
                elapsed = ?elapsed,
                rate = %format!(
                    "{}/s",
                    bytes_to_unit(progress.total_size / elapsed.as_secs_f64().max(0.001))
                ),
                failed = progress.failed.load(Ordering::Relaxed),
                "sync pass finished"
            );

            // A long pass may have raced the control plane; re-check.
            if elapsed > self.config.sync_file_interval {
                warn!("synchronization exceeded the interval, re-checking the manifest");
                let fresh = match self.fetch_manifest().await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        error!(error = %e, "cannot query file list");
                        return Ok(());
                    }
                };
                if self.manifest_drifted(&manifest, &fresh).await {
                    warn!("manifest changed during synchronization, resyncing");
                    manifest = fresh;
                    continue;
                }
            }
            break;
        }

        // The pass is complete; release the flag before GC starts so the
        // walk does not mistake this pass for a fresh one.
        drop(guard);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.gc(&manifest).await;
        });
        Ok(())
    }

    async fn manifest_drifted(&self, old: &[FileEntry], fresh: &[FileEntry]) -> bool {
        if fresh.len() != old.len() {
            return true;
        }
        for entry in fresh {
            match self.storage.size(&entry.hash).await {
                Ok(size) if size == entry.size => {}
                _ => return true,
            }
        }
        false
    }

    /// Download one manifest entry with the per-file retry budget; errors
    /// are consumed here and only counted.
    async fn sync_one(&self, entry: FileEntry, progress: &SyncProgress) {
        match self.download_with_retries(&entry).await {
            Ok(()) => {
                let downloaded = progress
                    .downloaded
                    .fetch_add(entry.size, Ordering::Relaxed)
                    + entry.size;
                let done = progress.done.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    path = %entry.path,
                    progress = %format!(
                        "{}/{} ; {}/{} ; {:.2}%",
                        bytes_to_unit(downloaded as f64),
                        bytes_to_unit(progress.total_size),
                        done,
                        progress.total_count,
                        downloaded as f64 / progress.total_size.max(1.0) * 100.0
                    ),
                    "downloaded"
                );
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                progress.failed.fetch_add(1, Ordering::Relaxed);
                progress.done.fetch_add(1, Ordering::Relaxed);
                error!(path = %entry.path, hash = %entry.hash, error = %e, "download file error");
            }
        }
    }

    async fn download_with_retries(&self, entry: &FileEntry) -> Result<()> {
        let algo = HashAlgo::for_hash(&entry.hash)?;
        let mut attempt = 1;
        loop {
            match self.download_once(entry, algo).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_retryable() && attempt < DOWNLOAD_ATTEMPTS => {
                    warn!(
                        path = %entry.path,
                        attempt,
                        error = %e,
                        "retrying download"
                    );
                    // Jittered pause so a flapping upstream is not hammered
                    // by every slot at once.
                    let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 100..=1000u64);
                    tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One download attempt: stream to a fresh temp file while hashing,
    /// verify, then hand the verified file to storage.
    async fn download_once(&self, entry: &FileEntry, algo: HashAlgo) -> Result<()> {
        debug!(path = %entry.path, size = %bytes_to_unit(entry.size as f64), "downloading");
        let resp = self.control_get(&entry.path).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(EdgeError::HttpStatus(resp.status().as_u16()));
        }

        let tmp_dir = self.config.tmp_dir();
        let temp = tempfile::Builder::new()
            .suffix(".downloading")
            .tempfile_in(&tmp_dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);

        let mut hasher = algo.hasher();
        let mut written: i64 = 0;
        let mut stream = Box::pin(resp.bytes_stream());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as i64;
        }
        file.flush().await?;
        drop(file);

        if entry.size >= 0 && written != entry.size {
            return Err(EdgeError::SizeMismatch {
                expected: entry.size,
                got: written,
            });
        }
        let digest = hasher.finish_hex();
        if digest != entry.hash {
            return Err(EdgeError::HashMismatch {
                expected: entry.hash.clone(),
                got: digest,
            });
        }

        self.storage
            .create(&entry.hash, SourceFile::new(temp, written))
            .await
    }

    /// Foreground single-file fetch used by the serve path on cache miss.
    ///
    /// At most one download per hash is in flight; latecomers wait for the
    /// first and then re-check storage.
    pub async fn download_file(&self, hash: &str) -> Result<()> {
        let algo = HashAlgo::for_hash(hash)?;

        let mut rx = {
            let mut downloading = self.downloading.lock();
            match downloading.get(hash) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    downloading.insert(hash.to_string(), tx);
                    None
                }
            }
        };
        if let Some(rx) = rx.as_mut() {
            let _ = rx.recv().await;
            return match self.storage.size(hash).await {
                Ok(_) => Ok(()),
                Err(_) => Err(EdgeError::NotFound(hash.to_string())),
            };
        }

        let _notify = DownloadingGuard { engine: self, hash };
        let entry = FileEntry {
            path: format!("/openbmclapi/download/{}?noopen=1", hash),
            hash: hash.to_string(),
            // Unknown ahead of time; only the digest is checked.
            size: -1,
        };
        let mut attempt = 1;
        loop {
            match self.download_once(&entry, algo).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_retryable() && attempt < DOWNLOAD_ATTEMPTS => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove every stored file that is not in `entries`. Aborts as soon
    /// as a new sync pass begins.
    pub async fn gc(&self, entries: &[FileEntry]) {
        info!("starting garbage collector");
        let valid: HashSet<&str> = entries.iter().map(|e| e.hash.as_str()).collect();

        let mut orphans = Vec::new();
        let interrupted = {
            let is_syncing = &self.is_syncing;
            self.storage
                .walk(&mut |hash, _size| {
                    if is_syncing.load(Ordering::SeqCst) {
                        return Err(EdgeError::Cancelled);
                    }
                    if !valid.contains(hash) {
                        orphans.push(hash.to_string());
                    }
                    Ok(())
                })
                .await
        };
        if let Err(e) = interrupted {
            if e.is_cancelled() {
                warn!("garbage collection interrupted by a new sync");
            } else {
                error!(error = %e, "garbage collection walk failed");
            }
            return;
        }

        for hash in orphans {
            if self.is_syncing.load(Ordering::SeqCst) {
                warn!("garbage collection interrupted by a new sync");
                return;
            }
            info!(hash = %hash, "found outdated file");
            if let Err(e) = self.storage.remove(&hash).await {
                warn!(hash = %hash, error = %e, "cannot remove outdated file");
            }
        }
        info!("garbage collector finished");
    }
}

struct DownloadingGuard<'a> {
    engine: &'a SyncEngine,
    hash: &'a str,
}

impl Drop for DownloadingGuard<'_> {
    fn drop(&mut self) {
        let sender = self.engine.downloading.lock().remove(self.hash);
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

/// Purge the in-progress download directory; every file inside belongs to
/// a download that no longer exists.
pub fn purge_tmp_dir(config: &ClusterConfig) -> Result<()> {
    let tmp = config.tmp_dir();
    match std::fs::remove_dir_all(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(&tmp)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
