//! Configuration system for the `StudyChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/studychat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.
//!
//! Every timing constant the chat core uses lives here, grouped into the
//! same sections as the TOML file.

use std::path::PathBuf;
use std::time::Duration;

use studychat_proto::attachment::DEFAULT_MAX_FILE_SIZE;
use url::Url;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The server URL is missing.
    #[error("no server URL configured (use --server-url or [network] server_url)")]
    MissingServerUrl,

    /// The server URL could not be parsed or has an unsupported scheme.
    #[error("invalid server URL {url}: {reason}")]
    InvalidServerUrl {
        /// The URL as configured.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    rooms: RoomsFileConfig,
    presence: PresenceFileConfig,
    reads: ReadsFileConfig,
    upload: UploadFileConfig,
    cache: CacheFileConfig,
    history: HistoryFileConfig,
    ui: UiFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    auth_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    send_attempts: Option<u32>,
    send_retry_delay_ms: Option<u64>,
    channel_capacity: Option<usize>,
    event_buffer: Option<usize>,
    tick_interval_ms: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    max_attempts: Option<u32>,
}

/// `[rooms]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RoomsFileConfig {
    join_timeout_secs: Option<u64>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    typing_expiry_ms: Option<u64>,
    typing_throttle_ms: Option<u64>,
    typing_idle_ms: Option<u64>,
}

/// `[reads]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReadsFileConfig {
    coalesce_ms: Option<u64>,
}

/// `[upload]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UploadFileConfig {
    max_file_size: Option<usize>,
    chunk_size: Option<usize>,
    chunk_timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    enabled: Option<bool>,
    dir: Option<PathBuf>,
    ttl_secs: Option<u64>,
}

/// `[history]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HistoryFileConfig {
    page_size: Option<usize>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Connection, request and channel settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the `auth` → `auth:ok` handshake.
    pub auth_timeout: Duration,
    /// Timeout for a single REST request.
    pub request_timeout: Duration,
    /// Attempts for an optimistic send while connected before it is marked failed.
    pub send_attempts: u32,
    /// Delay before re-posting a failed send (multiplied by the attempt number).
    pub send_retry_delay: Duration,
    /// Capacity of command and internal result channels.
    pub channel_capacity: usize,
    /// Capacity of the broadcast channel feeding [`crate::chat::ChatHandle::subscribe`].
    pub event_buffer: usize,
    /// Timer tick driving expiry, throttling and read coalescing.
    pub tick_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            send_attempts: 3,
            send_retry_delay: Duration::from_millis(500),
            channel_capacity: 256,
            event_buffer: 256,
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Reconnection backoff for the transport session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Maximum extra delay as a fraction of the computed delay (0.25 = up to 25%).
    pub jitter: f64,
    /// Attempts before giving up; 0 means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before reconnect attempt `attempt`, with random jitter added.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=jitter);
        base.mul_f64(1.0 + extra)
    }

    /// Whether `attempt` exceeds the configured attempt limit.
    #[must_use]
    pub const fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }
}

/// Room registry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomsConfig {
    /// How long a `chat:join` waits for its acknowledgement.
    pub join_timeout: Duration,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Typing-indicator windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    /// How long a remote typing indicator lives without refresh.
    pub typing_expiry: Duration,
    /// Minimum spacing of outbound `chat:typing` events per room.
    pub typing_throttle: Duration,
    /// Input idle time after which a trailing `chat:stopTyping` is sent.
    pub typing_idle: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_expiry: Duration::from_secs(3),
            typing_throttle: Duration::from_secs(1),
            typing_idle: Duration::from_secs(2),
        }
    }
}

/// Read-receipt coalescing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadsConfig {
    /// Window over which consecutive reads collapse into one receipt.
    pub coalesce: Duration,
}

impl Default for ReadsConfig {
    fn default() -> Self {
        Self {
            coalesce: Duration::from_millis(500),
        }
    }
}

/// Attachment upload settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Largest file accepted for upload, in bytes.
    pub max_file_size: usize,
    /// Bytes per uploaded chunk.
    pub chunk_size: usize,
    /// Timeout for one chunk request.
    pub chunk_timeout: Duration,
    /// Attempts per chunk before the upload fails.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per further attempt.
    pub backoff_base: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            chunk_size: 256 * 1024,
            chunk_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(300),
        }
    }
}

/// Local message-page cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Whether pages are cached on disk at all.
    pub enabled: bool,
    /// Directory of the cache file; `None` uses the platform cache dir.
    pub dir: Option<PathBuf>,
    /// How long a cached entry stays valid.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl CacheConfig {
    /// Resolves the cache directory, falling back to `<cache_dir>/studychat`.
    #[must_use]
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("studychat")))
    }
}

/// History paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Messages requested per history page.
    pub page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { page_size: 30 }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the chat server (`http://host:port`).
    pub server_url: Option<String>,
    /// Bearer token issued at login.
    pub token: Option<String>,
    /// Room the CLI joins at startup.
    pub room: Option<String>,
    /// Connection, request and channel settings.
    pub network: NetworkConfig,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
    /// Room registry settings.
    pub rooms: RoomsConfig,
    /// Typing-indicator windows.
    pub presence: PresenceConfig,
    /// Read-receipt coalescing.
    pub reads: ReadsConfig,
    /// Attachment upload settings.
    pub upload: UploadConfig,
    /// Local message-page cache.
    pub cache: CacheConfig,
    /// History paging.
    pub history: HistoryConfig,
    /// Timestamp display format (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            room: None,
            network: NetworkConfig::default(),
            reconnect: ReconnectConfig::default(),
            rooms: RoomsConfig::default(),
            presence: PresenceConfig::default(),
            reads: ReadsConfig::default(),
            upload: UploadConfig::default(),
            cache: CacheConfig::default(),
            history: HistoryConfig::default(),
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/studychat/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or if any config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let d = Self::default();
        let net = &file.network;
        let rc = &file.reconnect;
        let up = &file.upload;

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| net.server_url.clone()),
            token: cli.token.clone(),
            room: cli.room.clone(),
            network: NetworkConfig {
                connect_timeout: net
                    .connect_timeout_secs
                    .map_or(d.network.connect_timeout, Duration::from_secs),
                auth_timeout: net
                    .auth_timeout_secs
                    .map_or(d.network.auth_timeout, Duration::from_secs),
                request_timeout: net
                    .request_timeout_secs
                    .map_or(d.network.request_timeout, Duration::from_secs),
                send_attempts: net.send_attempts.unwrap_or(d.network.send_attempts).max(1),
                send_retry_delay: net
                    .send_retry_delay_ms
                    .map_or(d.network.send_retry_delay, Duration::from_millis),
                channel_capacity: net
                    .channel_capacity
                    .unwrap_or(d.network.channel_capacity)
                    .max(1),
                event_buffer: net.event_buffer.unwrap_or(d.network.event_buffer).max(1),
                tick_interval: net
                    .tick_interval_ms
                    .map_or(d.network.tick_interval, Duration::from_millis),
            },
            reconnect: ReconnectConfig {
                initial_delay: rc
                    .initial_delay_ms
                    .map_or(d.reconnect.initial_delay, Duration::from_millis),
                max_delay: rc
                    .max_delay_secs
                    .map_or(d.reconnect.max_delay, Duration::from_secs),
                multiplier: rc.multiplier.unwrap_or(d.reconnect.multiplier),
                jitter: rc.jitter.unwrap_or(d.reconnect.jitter),
                max_attempts: rc.max_attempts.unwrap_or(d.reconnect.max_attempts),
            },
            rooms: RoomsConfig {
                join_timeout: file
                    .rooms
                    .join_timeout_secs
                    .map_or(d.rooms.join_timeout, Duration::from_secs),
            },
            presence: PresenceConfig {
                typing_expiry: file
                    .presence
                    .typing_expiry_ms
                    .map_or(d.presence.typing_expiry, Duration::from_millis),
                typing_throttle: file
                    .presence
                    .typing_throttle_ms
                    .map_or(d.presence.typing_throttle, Duration::from_millis),
                typing_idle: file
                    .presence
                    .typing_idle_ms
                    .map_or(d.presence.typing_idle, Duration::from_millis),
            },
            reads: ReadsConfig {
                coalesce: file
                    .reads
                    .coalesce_ms
                    .map_or(d.reads.coalesce, Duration::from_millis),
            },
            upload: UploadConfig {
                max_file_size: up.max_file_size.unwrap_or(d.upload.max_file_size),
                chunk_size: up.chunk_size.unwrap_or(d.upload.chunk_size).max(1),
                chunk_timeout: up
                    .chunk_timeout_secs
                    .map_or(d.upload.chunk_timeout, Duration::from_secs),
                max_attempts: up.max_attempts.unwrap_or(d.upload.max_attempts).max(1),
                backoff_base: up
                    .backoff_base_ms
                    .map_or(d.upload.backoff_base, Duration::from_millis),
            },
            cache: CacheConfig {
                enabled: !cli.no_cache && file.cache.enabled.unwrap_or(d.cache.enabled),
                dir: file.cache.dir.clone(),
                ttl: file
                    .cache
                    .ttl_secs
                    .map_or(d.cache.ttl, Duration::from_secs),
            },
            history: HistoryConfig {
                page_size: file
                    .history
                    .page_size
                    .unwrap_or(d.history.page_size)
                    .max(1),
            },
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(d.timestamp_format),
        }
    }

    /// The REST base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingServerUrl`] or
    /// [`ConfigError::InvalidServerUrl`].
    pub fn api_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .server_url
            .as_deref()
            .ok_or(ConfigError::MissingServerUrl)?;
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidServerUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::InvalidServerUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    /// The socket URL derived from the server URL (`ws(s)://host/ws`).
    ///
    /// # Errors
    ///
    /// Same as [`ClientConfig::api_url`].
    pub fn socket_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.api_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        let raw = self.server_url.clone().unwrap_or_default();
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::InvalidServerUrl {
                url: raw,
                reason: "cannot derive socket scheme".to_string(),
            })?;
        url.set_path("/ws");
        url.set_query(None);
        Ok(url)
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "StudyChat line-oriented chat client")]
pub struct CliArgs {
    /// Base URL of the chat server (e.g. `http://127.0.0.1:9000`).
    #[arg(long, env = "STUDYCHAT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Bearer token issued at login.
    #[arg(long, env = "STUDYCHAT_TOKEN")]
    pub token: Option<String>,

    /// Room to join at startup.
    #[arg(long, env = "STUDYCHAT_ROOM")]
    pub room: Option<String>,

    /// Path to config file (default: `~/.config/studychat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Disable the on-disk message cache.
    #[arg(long)]
    pub no_cache: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "STUDYCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/studychat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("studychat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
