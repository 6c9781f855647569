//! Configuration for the `StudyChat` hub.
//!
//! Priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/studychat-hub/config.toml`)
//! 4. Compiled defaults

use std::collections::HashMap;
use std::path::PathBuf;

use studychat_proto::attachment::DEFAULT_MAX_FILE_SIZE;
use studychat_proto::ids::{RoomId, UserId};

/// Errors that can occur when loading hub configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the hub.
///
/// ```toml
/// [server]
/// bind_addr = "127.0.0.1:9000"
/// max_file_size = 10485760
/// rooms = ["math", "physics"]
///
/// [tokens]
/// alice-token = "alice"
/// ```
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HubConfigFile {
    server: ServerFileConfig,
    tokens: HashMap<String, String>,
}

/// `[server]` section of the hub config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_file_size: Option<usize>,
    rooms: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the hub.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "StudyChat reference hub")]
pub struct HubCliArgs {
    /// Address to bind the hub to.
    #[arg(short, long, env = "STUDYCHAT_HUB_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/studychat-hub/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Accepted bearer token as `TOKEN=USER`. Repeatable.
    #[arg(long = "token", value_parser = parse_token)]
    pub tokens: Vec<(String, String)>,

    /// Restrict joins to these rooms. Repeatable; any room is allowed when
    /// none is given.
    #[arg(long = "room")]
    pub rooms: Vec<String>,

    /// Upload size cap in bytes.
    #[arg(long)]
    pub max_file_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "STUDYCHAT_HUB_LOG")]
    pub log_level: String,
}

fn parse_token(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((token, user)) if !token.is_empty() && !user.is_empty() => {
            Ok((token.to_string(), user.to_string()))
        }
        _ => Err(format!("expected TOKEN=USER, got {raw:?}")),
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to (e.g. `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Accepted bearer tokens and the user each one authenticates.
    pub tokens: HashMap<String, UserId>,
    /// Joinable rooms; empty means any room.
    pub rooms: Vec<RoomId>,
    /// Upload size cap in bytes.
    pub max_file_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            tokens: HashMap::new(),
            rooms: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl HubConfig {
    /// Load configuration by merging CLI args, env vars and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &HubCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Add an accepted token.
    #[must_use]
    pub fn with_token(mut self, token: &str, user: &str) -> Self {
        self.tokens.insert(token.to_string(), UserId::new(user));
        self
    }

    /// Priority: CLI > file > default. Tokens from both sources are merged,
    /// the CLI winning on conflicts.
    fn resolve(cli: &HubCliArgs, file: &HubConfigFile) -> Self {
        let defaults = Self::default();

        let mut tokens: HashMap<String, UserId> = file
            .tokens
            .iter()
            .map(|(token, user)| (token.clone(), UserId::new(user.as_str())))
            .collect();
        for (token, user) in &cli.tokens {
            tokens.insert(token.clone(), UserId::new(user.as_str()));
        }

        let rooms = if cli.rooms.is_empty() {
            file.server.rooms.clone().unwrap_or_default()
        } else {
            cli.rooms.clone()
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            tokens,
            rooms: rooms.into_iter().map(RoomId::new).collect(),
            max_file_size: cli
                .max_file_size
                .or(file.server.max_file_size)
                .unwrap_or(defaults.max_file_size),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<HubConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(HubConfigFile::default());
        };
        config_dir.join("studychat-hub").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HubConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
