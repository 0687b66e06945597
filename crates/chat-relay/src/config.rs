//! Relay configuration: TOML file + CLI overrides.

use chat_core::{ChatError, ChatResult, HistoryMode, DEFAULT_HISTORY_LEN, DEFAULT_ROOM_KEY};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub persist: PersistSection,
    #[serde(default)]
    pub query: QuerySection,
    #[serde(default)]
    pub store: StoreSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-connection delivery queue depth before the consumer is shed.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            outbound_capacity: default_outbound_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// `[history]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HistorySection {
    #[serde(default)]
    pub mode: HistoryMode,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_room")]
    pub room: String,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            mode: HistoryMode::default(),
            max_len: default_max_len(),
            room: default_room(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

/// `[bus]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_topic")]
    pub topic: String,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            topic: default_topic(),
        }
    }
}

/// `[persist]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PersistSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_upstream_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// `[query]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct QuerySection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_len")]
    pub replay_limit: usize,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_upstream_timeout_ms(),
            replay_limit: default_max_len(),
        }
    }
}

/// `[store]` section of the config TOML.
///
/// Without a URL the node keeps history and the bus in process, which only
/// reaches nodes inside the same process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Shared backing store, e.g. `redis://127.0.0.1:6379`.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_outbound_capacity() -> usize {
    64
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_max_frame_bytes() -> usize {
    1_048_576
}
fn default_max_len() -> usize {
    DEFAULT_HISTORY_LEN
}
fn default_room() -> String {
    DEFAULT_ROOM_KEY.to_string()
}
fn default_store_timeout_ms() -> u64 {
    2000
}
fn default_topic() -> String {
    "chat_room".to_string()
}
fn default_upstream_timeout_ms() -> u64 {
    3000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    200
}
fn default_queue_capacity() -> usize {
    1024
}

/// Remote persistence service settings (present only when a URL is configured).
#[derive(Debug, Clone)]
pub struct PersistSettings {
    pub url: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub queue_capacity: usize,
}

/// Remote query service settings (present only when a URL is configured).
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub url: String,
    pub timeout: Duration,
}

/// Resolved relay configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub outbound_capacity: usize,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub history_mode: HistoryMode,
    pub history_max_len: usize,
    pub room_key: String,
    pub store_timeout: Duration,
    pub bus_topic: String,
    pub persist: Option<PersistSettings>,
    pub query: Option<QuerySettings>,
    pub replay_limit: usize,
    /// Shared backing store URL; `None` means in-process.
    pub store_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), None, None, None, None, None, None)
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_mode: Option<HistoryMode>,
        cli_persist_url: Option<&str>,
        cli_query_url: Option<&str>,
        cli_store_url: Option<&str>,
    ) -> ChatResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::resolve(
            file_config,
            cli_port,
            cli_bind,
            cli_mode,
            cli_persist_url,
            cli_query_url,
            cli_store_url,
        ))
    }

    fn resolve(
        file: ConfigFile,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_mode: Option<HistoryMode>,
        cli_persist_url: Option<&str>,
        cli_query_url: Option<&str>,
        cli_store_url: Option<&str>,
    ) -> Self {
        let persist_url = cli_persist_url
            .map(|s| s.to_string())
            .or(file.persist.url)
            .filter(|u| !u.is_empty());
        let query_url = cli_query_url
            .map(|s| s.to_string())
            .or(file.query.url)
            .filter(|u| !u.is_empty());
        let store_url = cli_store_url
            .map(|s| s.to_string())
            .or(file.store.url)
            .filter(|u| !u.is_empty());

        Self {
            bind: cli_bind.map(|s| s.to_string()).unwrap_or(file.server.bind),
            port: cli_port.unwrap_or(file.server.port),
            outbound_capacity: file.server.outbound_capacity.max(1),
            write_timeout: Duration::from_millis(file.server.write_timeout_ms),
            max_frame_bytes: file.server.max_frame_bytes,
            history_mode: cli_mode.unwrap_or(file.history.mode),
            history_max_len: file.history.max_len.max(1),
            room_key: file.history.room,
            store_timeout: Duration::from_millis(file.history.store_timeout_ms),
            bus_topic: file.bus.topic,
            persist: persist_url.map(|url| PersistSettings {
                url,
                timeout: Duration::from_millis(file.persist.timeout_ms),
                max_attempts: file.persist.max_attempts.max(1),
                backoff: Duration::from_millis(file.persist.backoff_ms),
                queue_capacity: file.persist.queue_capacity.max(1),
            }),
            query: query_url.map(|url| QuerySettings {
                url,
                timeout: Duration::from_millis(file.query.timeout_ms),
            }),
            replay_limit: file.query.replay_limit,
            store_url,
        }
    }
}

fn parse_config(content: &str) -> ChatResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| ChatError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
