//! Configuration module for FileDock.

use serde::Deserialize;
use std::path::Path;

use crate::{ConnectorError, Result};

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origins.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/filedock.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Connector configuration: request registry, named locks and temp files.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Directory for chunked upload parts and staged ZIP downloads.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Lifetime of a cancellation registration in seconds.
    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: u64,
    /// Idle lifetime of a named lock in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Lifetime of staged temp files in seconds.
    #[serde(default = "default_temp_ttl")]
    pub temp_ttl_secs: u64,
    /// Interval between background sweeps in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Maximum number of registered requests.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// Maximum number of cached named locks.
    #[serde(default = "default_max_locks")]
    pub max_locks: usize,
    /// Commands rejected with `errCmdNoSupport`.
    #[serde(default)]
    pub disabled_commands: Vec<String>,
}

fn default_temp_dir() -> String {
    "data/tmp".to_string()
}

fn default_request_ttl() -> u64 {
    3600
}

fn default_lock_ttl() -> u64 {
    600
}

fn default_temp_ttl() -> u64 {
    24 * 3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_requests() -> usize {
    10_000
}

fn default_max_locks() -> usize {
    10_000
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            request_ttl_secs: default_request_ttl(),
            lock_ttl_secs: default_lock_ttl(),
            temp_ttl_secs: default_temp_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            max_requests: default_max_requests(),
            max_locks: default_max_locks(),
            disabled_commands: Vec::new(),
        }
    }
}

/// Storage accounting cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Idle lifetime of a cached volume total in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Interval between eviction sweeps in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum number of cached volume totals.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_cache_ttl() -> u64 {
    30 * 60
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_entries() -> usize {
    1000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            poll_interval_secs: default_poll_interval(),
            max_entries: default_max_entries(),
        }
    }
}

/// Thumbnail generation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    /// Thumbnail edge size in pixels.
    #[serde(default = "default_thumbnail_size")]
    pub size: u32,
    /// Capacity of each media type's work queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_thumbnail_size() -> u32 {
    48
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            size: default_thumbnail_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Attribute overrides shared by the default attribute and ACL rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttributeConfig {
    /// Read permission.
    pub read: Option<bool>,
    /// Write permission.
    pub write: Option<bool>,
    /// Locked (cannot be renamed, moved or removed).
    pub locked: Option<bool>,
    /// Visible in listings.
    pub visible: Option<bool>,
    /// Listed but content cannot be opened.
    pub show_only: Option<bool>,
    /// Accessible at all.
    pub access: Option<bool>,
}

/// One ACL rule from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// Regular expression matched against the relative path (e.g. `^/private`).
    pub pattern: String,
    /// Restrict the rule to `file` or `directory` entries.
    #[serde(default)]
    pub kind: Option<String>,
    /// Attribute overrides applied when the rule matches.
    #[serde(flatten)]
    pub attributes: AttributeConfig,
}

/// Volume configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    /// Volume id prefix (defaults to `v{n}_`).
    #[serde(default)]
    pub id: Option<String>,
    /// Backing root directory.
    pub root: String,
    /// Display name of the root (defaults to the directory name).
    #[serde(default)]
    pub name: Option<String>,
    /// Public URL of the root.
    #[serde(default)]
    pub url: Option<String>,
    /// Public URL of the thumbnail directory.
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Thumbnail directory (defaults to `<root>/.tmb`).
    #[serde(default)]
    pub thumbnail_dir: Option<String>,
    /// Relative path separator used on the wire.
    #[serde(default = "default_separator")]
    pub separator: char,
    /// Whole volume is read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Whole volume is locked.
    #[serde(default)]
    pub locked: bool,
    /// Whole volume is show-only.
    #[serde(default)]
    pub show_only: bool,
    /// Maximum upload size in bytes.
    #[serde(default)]
    pub max_upload_size: Option<u64>,
    /// Maximum storage quota in bytes.
    #[serde(default)]
    pub max_storage: Option<u64>,
    /// Uploads may overwrite existing files.
    #[serde(default = "default_true")]
    pub upload_overwrite: bool,
    /// Paste may overwrite existing entries.
    #[serde(default = "default_true")]
    pub copy_overwrite: bool,
    /// Allowed upload mime types or prefixes (empty = all).
    #[serde(default)]
    pub upload_allow: Vec<String>,
    /// Denied upload mime types or prefixes.
    #[serde(default)]
    pub upload_deny: Vec<String>,
    /// Default attribute for every entry.
    #[serde(default)]
    pub default_attribute: AttributeConfig,
    /// Ordered ACL rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_separator() -> char {
    '/'
}

fn default_true() -> bool {
    true
}

impl VolumeConfig {
    /// Create a volume configuration for a root with defaults for everything else.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            id: None,
            root: root.into(),
            name: None,
            url: None,
            thumbnail_url: None,
            thumbnail_dir: None,
            separator: default_separator(),
            read_only: false,
            locked: false,
            show_only: false,
            max_upload_size: None,
            max_storage: None,
            upload_overwrite: true,
            copy_overwrite: true,
            upload_allow: Vec::new(),
            upload_deny: Vec::new(),
            default_attribute: AttributeConfig::default(),
            rules: Vec::new(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Connector configuration.
    #[serde(default)]
    pub connector: ConnectorConfig,
    /// Storage accounting configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Thumbnail configuration.
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    /// Volumes exposed by the connector.
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ConnectorError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ConnectorError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `FILEDOCK_HOST`: Override the bind host
    /// - `FILEDOCK_PORT`: Override the bind port
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FILEDOCK_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("FILEDOCK_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - No volume is configured
    /// - Two volumes share an id
    /// - An id contains characters outside `[A-Za-z0-9_]`
    /// - A rule pattern is not a valid regular expression
    pub fn validate(&self) -> Result<()> {
        if self.volumes.is_empty() {
            return Err(ConnectorError::Config(
                "at least one [[volumes]] entry is required".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (index, volume) in self.volumes.iter().enumerate() {
            let id = volume_id(volume, index);
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ConnectorError::Config(format!("invalid volume id: {id}")));
            }
            if !seen.insert(id.clone()) {
                return Err(ConnectorError::Config(format!("duplicate volume id: {id}")));
            }
            for rule in &volume.rules {
                regex::Regex::new(&rule.pattern).map_err(|e| {
                    ConnectorError::Config(format!("invalid rule pattern {}: {e}", rule.pattern))
                })?;
            }
        }
        Ok(())
    }
}

/// Resolve the id of the volume at `index`.
pub fn volume_id(volume: &VolumeConfig, index: usize) -> String {
    volume
        .id
        .clone()
        .unwrap_or_else(|| format!("v{}_", index + 1))
}
