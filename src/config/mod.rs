//! Configuration module for the edge node.

use crate::error::{EdgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default connection budget for the whole cluster sync engine.
pub const DEFAULT_MAX_CONN: usize = 128;

/// Default connection budget for a single storage backend.
pub const DEFAULT_STORAGE_MAX_CONN: usize = 24;

/// Main configuration for an edge node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Cluster registration and control-plane settings.
    pub cluster: ClusterConfig,
    /// Local HTTP frontend settings.
    pub serve: ServeConfig,
    /// Storage backend settings.
    pub storage: StorageEntryConfig,
    /// Named WebDAV credential blocks referenced by `storage.alias`.
    #[serde(default)]
    pub webdav_users: HashMap<String, WebDavUser>,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl EdgeConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EdgeError::config("file", format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EdgeError::config("file", format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.cluster_id.is_empty() {
            return Err(EdgeError::config("cluster.cluster_id", "must not be empty"));
        }
        if self.cluster.cluster_secret.is_empty() {
            return Err(EdgeError::config(
                "cluster.cluster_secret",
                "must not be empty",
            ));
        }
        if self.cluster.max_conn == 0 {
            return Err(EdgeError::config("cluster.max_conn", "must be non-zero"));
        }
        if let Some(base) = &self.cluster.redirect_base {
            url::Url::parse(base)
                .map_err(|e| EdgeError::config("cluster.redirect_base", e.to_string()))?;
        }
        url::Url::parse(&self.cluster.prefix)
            .map_err(|e| EdgeError::config("cluster.prefix", e.to_string()))?;

        if let StorageEntryConfig::Webdav(opt) = &self.storage {
            if let Some(alias) = &opt.alias {
                if !self.webdav_users.contains_key(alias) {
                    return Err(EdgeError::config(
                        "storage.alias",
                        format!("webdav user {:?} does not exist", alias),
                    ));
                }
            } else if opt.endpoint.is_none() {
                return Err(EdgeError::config(
                    "storage.endpoint",
                    "either an endpoint or an alias is required",
                ));
            }
        }
        Ok(())
    }

    /// Create a minimal development configuration rooted at `base_dir`.
    pub fn development(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster: ClusterConfig {
                base_dir: base_dir.into(),
                host: "127.0.0.1".to_string(),
                public_port: 4000,
                cluster_id: "dev-cluster".to_string(),
                cluster_secret: "dev-secret".to_string(),
                byoc: false,
                prefix: "https://openbmclapi.bangbang93.com".to_string(),
                redirect_base: None,
                max_conn: 16,
                keep_alive_interval: Duration::from_secs(60),
                sync_file_interval: Duration::from_secs(600),
            },
            serve: ServeConfig {
                bind_addr: "127.0.0.1:4000".parse().expect("valid socket address"),
            },
            storage: StorageEntryConfig::Local(LocalStorageOption::default()),
            webdav_users: HashMap::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Cluster registration and control-plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Base directory holding `cache/` and `data/`.
    pub base_dir: PathBuf,
    /// Public hostname the control plane routes traffic to.
    pub host: String,
    /// Public port the control plane routes traffic to.
    pub public_port: u16,
    /// Cluster id used for authentication (Basic auth username).
    pub cluster_id: String,
    /// Cluster secret used for authentication (Basic auth password).
    pub cluster_secret: String,
    /// Bring-your-own-cert: skip requesting TLS material over the socket.
    #[serde(default)]
    pub byoc: bool,
    /// Control plane origin.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Optional base URL; when set, downloads redirect there instead of
    /// streaming from this node.
    #[serde(default)]
    pub redirect_base: Option<String>,
    /// Bound on concurrent sync downloads.
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    /// Period of the keep-alive ticker.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Wall-time budget for one sync pass before re-checking the manifest.
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_file_interval: Duration,
}

fn default_prefix() -> String {
    "https://openbmclapi.bangbang93.com".to_string()
}

fn default_max_conn() -> usize {
    DEFAULT_MAX_CONN
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(600)
}

impl ClusterConfig {
    /// Directory of content-addressed files.
    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    /// Directory of in-progress downloads, purged on startup.
    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join("cache").join(".tmp")
    }

    /// Directory of persisted node state.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }
}

/// Local HTTP frontend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Address to bind the serving frontend.
    pub bind_addr: SocketAddr,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".parse().expect("valid socket address"),
        }
    }
}

/// Storage backend selection, tagged by backend type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageEntryConfig {
    Local(LocalStorageOption),
    Webdav(WebDavStorageOption),
}

impl StorageEntryConfig {
    /// The factory tag this entry constructs.
    pub fn tag(&self) -> &'static str {
        match self {
            StorageEntryConfig::Local(_) => "local",
            StorageEntryConfig::Webdav(_) => "webdav",
        }
    }
}

/// Options for the local filesystem backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalStorageOption {}

/// Options for the WebDAV backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavStorageOption {
    /// Bound on concurrent upstream connections.
    #[serde(default = "default_storage_max_conn")]
    pub max_conn: usize,
    /// Upload ceiling in KiB/s; 0 disables the limit.
    #[serde(default)]
    pub max_upload_rate: usize,
    /// Download ceiling in KiB/s; 0 disables the limit.
    #[serde(default)]
    pub max_download_rate: usize,
    /// Pre-create all measurement files during init.
    #[serde(default)]
    pub pre_gen_measures: bool,
    /// Follow upstream redirects instead of passing them to clients.
    #[serde(default)]
    pub follow_redirect: bool,
    /// TTL for cached upstream redirect targets; zero disables the cache.
    #[serde(default, with = "humantime_serde")]
    pub redirect_link_cache: Duration,
    /// Name of a `webdav_users` entry providing endpoint and credentials.
    #[serde(default)]
    pub alias: Option<String>,
    /// Endpoint URL; overrides (or resolves against) the alias endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Username; overrides the alias username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password; overrides the alias password.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for WebDavStorageOption {
    fn default() -> Self {
        Self {
            max_conn: DEFAULT_STORAGE_MAX_CONN,
            max_upload_rate: 0,
            max_download_rate: 0,
            pre_gen_measures: false,
            follow_redirect: false,
            redirect_link_cache: Duration::ZERO,
            alias: None,
            endpoint: None,
            username: None,
            password: None,
        }
    }
}

fn default_storage_max_conn() -> usize {
    DEFAULT_STORAGE_MAX_CONN
}

/// A named WebDAV credential block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavUser {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else if let Some(h) = s.strip_suffix('h') {
            h.parse::<u64>()
                .map(|v| Duration::from_secs(v * 3600))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config() {
        let config = EdgeConfig::development("/tmp/edge");
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.cache_dir(), PathBuf::from("/tmp/edge/cache"));
        assert_eq!(
            config.cluster.tmp_dir(),
            PathBuf::from("/tmp/edge/cache/.tmp")
        );
        assert_eq!(config.cluster.keep_alive_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_empty_credentials() {
        let mut config = EdgeConfig::development("/tmp/edge");
        config.cluster.cluster_id.clear();
        assert!(matches!(
            config.validate(),
            Err(EdgeError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_validate_webdav_alias() {
        let mut config = EdgeConfig::development("/tmp/edge");
        config.storage = StorageEntryConfig::Webdav(WebDavStorageOption {
            alias: Some("mirror".to_string()),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.webdav_users.insert(
            "mirror".to_string(),
            WebDavUser {
                endpoint: "https://dav.example.com/".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_webdav_needs_endpoint_or_alias() {
        let mut config = EdgeConfig::development("/tmp/edge");
        config.storage = StorageEntryConfig::Webdav(WebDavStorageOption::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_parsing() {
        let json = r#"{
            "base_dir": "/tmp/edge",
            "host": "example.com",
            "public_port": 443,
            "cluster_id": "id",
            "cluster_secret": "secret",
            "keep_alive_interval": "60s",
            "sync_file_interval": "10m"
        }"#;
        let cluster: ClusterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cluster.keep_alive_interval, Duration::from_secs(60));
        assert_eq!(cluster.sync_file_interval, Duration::from_secs(600));
        assert_eq!(cluster.max_conn, DEFAULT_MAX_CONN);
    }

    #[test]
    fn test_storage_tag() {
        let json = r#"{"type": "webdav", "max_conn": 8}"#;
        let entry: StorageEntryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(entry.tag(), "webdav");
        match entry {
            StorageEntryConfig::Webdav(opt) => assert_eq!(opt.max_conn, 8),
            _ => panic!("expected webdav entry"),
        }
    }
}
