//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vxproto_hub::HubConfig;
use vxproto_policy::{ConnectionPolicy, EndpointPolicy};

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Policy of every served API version.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointPolicy>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity the server token is issued for.
    #[serde(default = "default_server_id")]
    pub server_id: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "vxproto_hub=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Token key material.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
    /// 12-byte secret, hex encoded. A random secret is generated per
    /// process when unset, which invalidates tokens on restart.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Hub tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_deferred_ttl_ms")]
    pub deferred_ttl_ms: u64,

    #[serde(default = "default_deferred_tick_ms")]
    pub deferred_tick_ms: u64,

    #[serde(default = "default_deferred_capacity")]
    pub deferred_capacity: usize,

    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Where chunked file transfers are reassembled.
    #[serde(default)]
    pub files_dir: Option<PathBuf>,
}

/// Agent channel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Liveness ping interval; 0 disables pinging.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Encrypt packets beneath the framing with a key derived from the
    /// token secret. Requires `token.secret`.
    #[serde(default)]
    pub tunnel_encryption: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8443
}

fn default_server_id() -> String {
    "vxserver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_deferred_ttl_ms() -> u64 {
    60_000
}

fn default_deferred_tick_ms() -> u64 {
    100
}

fn default_deferred_capacity() -> usize {
    vxproto_hub::config::DEFAULT_DEFERRED_CAPACITY
}

fn default_mailbox_capacity() -> usize {
    vxproto_hub::config::DEFAULT_MAILBOX_CAPACITY
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_endpoints() -> Vec<EndpointPolicy> {
    vec![EndpointPolicy {
        version: "v1".to_string(),
        policy: ConnectionPolicy::Allow,
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            token: TokenConfig::default(),
            hub: HubSection::default(),
            transport: TransportConfig::default(),
            endpoints: default_endpoints(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_id: default_server_id(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            deferred_ttl_ms: default_deferred_ttl_ms(),
            deferred_tick_ms: default_deferred_tick_ms(),
            deferred_capacity: default_deferred_capacity(),
            mailbox_capacity: default_mailbox_capacity(),
            files_dir: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            tunnel_encryption: false,
        }
    }
}

impl HubSection {
    pub fn to_hub_config(&self) -> HubConfig {
        let defaults = HubConfig::default();
        HubConfig {
            deferred_ttl: Duration::from_millis(self.deferred_ttl_ms),
            deferred_tick: Duration::from_millis(self.deferred_tick_ms.max(1)),
            deferred_capacity: self.deferred_capacity,
            mailbox_capacity: self.mailbox_capacity,
            files_dir: self.files_dir.clone().unwrap_or(defaults.files_dir),
        }
    }
}

impl TransportConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VXPROTO_HOST` overrides `server.host`
/// - `VXPROTO_PORT` overrides `server.port`
/// - `VXPROTO_LOG_LEVEL` overrides `logging.level`
/// - `VXPROTO_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VXPROTO_TOKEN_SECRET` overrides `token.secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("VXPROTO_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("VXPROTO_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(level) = std::env::var("VXPROTO_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("VXPROTO_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(secret) = std::env::var("VXPROTO_TOKEN_SECRET") {
        if !secret.trim().is_empty() {
            config.token.secret = Some(secret);
        }
    }

    Ok(config)
}
