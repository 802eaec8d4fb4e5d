//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RELAYLINK_SERVER_URL`,
//!    `RELAYLINK_LICENSE_KEY`, `RELAYLINK_LOCAL_TOKEN`,
//!    `RELAYLINK_CONTROL_LISTEN`
//! 2. **Config file**: path via `--config <path>`, or `relaylink.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! enabled = true
//! server_url = "relay.example.com/api/v1/tunnel"  # scheme optional, wss:// assumed
//! license_key = "XXXX-XXXX"
//! client_name = "relaylink-office"                # default relaylink-<hostname>
//! auto_reconnect = true
//! reconnect_interval_secs = 5                     # initial backoff
//! reconnect_max_delay_secs = 30                   # backoff cap
//! heartbeat_interval_secs = 25
//! handshake_timeout_secs = 10
//!
//! [local]
//! base_url = "http://127.0.0.1:8730"
//! token = ""                                      # bearer injected on forwarded calls
//! request_timeout_secs = 35
//! allowed_prefixes = ["/api/v1/", "/static/"]
//! allowed_paths = ["/", "/docs", "/redoc", "/openapi.json", "/favicon.ico"]
//! blocked_prefixes = ["/api/v1/relay/"]
//!
//! [control]
//! listen = "127.0.0.1:8731"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Failure to produce a usable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid relay server url {0:?}")]
    InvalidServerUrl(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Start the tunnel at launch (default false).
    #[serde(default)]
    pub enabled: bool,
    /// Relay endpoint. Bare hosts get `wss://`, `http(s)` is mapped to `ws(s)`.
    #[serde(default)]
    pub server_url: String,
    /// Pairing / license identifier presented during the handshake.
    #[serde(default)]
    pub license_key: String,
    /// Display name shown to remote parties (default `relaylink-<hostname>`).
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Reconnect after transient failures (default true).
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    /// Initial reconnect delay in seconds (default 5).
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Maximum reconnect delay in seconds (default 30).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between heartbeat pings (default 25).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait for the transport to open and `welcome` to arrive (default 10).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Local HTTP collaborator and forwarding policy.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Base URL of the loopback server (default `http://127.0.0.1:8730`).
    #[serde(default = "default_local_base_url")]
    pub base_url: String,
    /// Static bearer token for the local API. Empty disables injection and
    /// leaves the control API unauthenticated.
    #[serde(default)]
    pub token: String,
    /// Timeout for a single forwarded call in seconds (default 35).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Path prefixes the relay may reach.
    #[serde(default = "default_allowed_prefixes")]
    pub allowed_prefixes: Vec<String>,
    /// Exact paths the relay may reach in addition to the prefixes.
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,
    /// Prefixes that are refused even when an allowed prefix matches.
    #[serde(default = "default_blocked_prefixes")]
    pub blocked_prefixes: Vec<String>,
}

/// Local control API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Socket address for the status/control API (default `127.0.0.1:8731`).
    #[serde(default = "default_control_listen")]
    pub listen: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_client_name() -> String {
    format!("relaylink-{}", local_hostname())
}
fn default_auto_reconnect() -> bool {
    true
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    25
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_local_base_url() -> String {
    "http://127.0.0.1:8730".to_string()
}
fn default_request_timeout() -> u64 {
    35
}
fn default_allowed_prefixes() -> Vec<String> {
    vec!["/api/v1/".to_string(), "/static/".to_string()]
}
fn default_allowed_paths() -> Vec<String> {
    ["/", "/docs", "/redoc", "/openapi.json", "/favicon.ico"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_blocked_prefixes() -> Vec<String> {
    vec!["/api/v1/relay/".to_string()]
}
fn default_control_listen() -> String {
    "127.0.0.1:8731".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            license_key: String::new(),
            client_name: default_client_name(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_interval_secs: default_reconnect_interval(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: default_local_base_url(),
            token: String::new(),
            request_timeout_secs: default_request_timeout(),
            allowed_prefixes: default_allowed_prefixes(),
            allowed_paths: default_allowed_paths(),
            blocked_prefixes: default_blocked_prefixes(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `relaylink.toml` in
    /// the current directory is used when present, falling back to defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("relaylink.toml").exists() => Self::from_file("relaylink.toml")?,
            None => Config::default(),
        };

        if let Ok(url) = std::env::var("RELAYLINK_SERVER_URL") {
            config.relay.server_url = url;
        }
        if let Ok(key) = std::env::var("RELAYLINK_LICENSE_KEY") {
            config.relay.license_key = key;
        }
        if let Ok(token) = std::env::var("RELAYLINK_LOCAL_TOKEN") {
            config.local.token = token;
        }
        if let Ok(listen) = std::env::var("RELAYLINK_CONTROL_LISTEN") {
            config.control.listen = listen;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document, filling every omitted field with its default.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Build the immutable tunnel configuration.
    pub fn tunnel_config(&self) -> Result<TunnelConfig, ConfigError> {
        let server_url = normalize_server_url(&self.relay.server_url)?;
        Ok(TunnelConfig {
            enabled: self.relay.enabled,
            server_url,
            license_key: self.relay.license_key.trim().to_string(),
            client_name: self.relay.client_name.trim().to_string(),
            auto_reconnect: self.relay.auto_reconnect,
            reconnect_interval: Duration::from_secs(self.relay.reconnect_interval_secs.max(1)),
            reconnect_max_delay: Duration::from_secs(
                self.relay
                    .reconnect_max_delay_secs
                    .max(self.relay.reconnect_interval_secs),
            ),
            heartbeat_interval: Duration::from_secs(self.relay.heartbeat_interval_secs.max(1)),
            handshake_timeout: Duration::from_secs(self.relay.handshake_timeout_secs.max(1)),
            local: ForwardPolicy {
                base_url: self.local.base_url.trim().trim_end_matches('/').to_string(),
                token: Some(self.local.token.trim().to_string()).filter(|t| !t.is_empty()),
                request_timeout: Duration::from_secs(self.local.request_timeout_secs.max(1)),
                allowed_prefixes: self.local.allowed_prefixes.clone(),
                allowed_paths: self.local.allowed_paths.clone(),
                blocked_prefixes: self.local.blocked_prefixes.clone(),
            },
        })
    }
}

/// Everything the tunnel needs, fixed for the lifetime of one tunnel instance.
///
/// Changing any of it means stopping the tunnel and starting a new one.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// Normalized `ws://` / `wss://` relay endpoint, empty when unset.
    pub server_url: String,
    pub license_key: String,
    pub client_name: String,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub reconnect_max_delay: Duration,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub local: ForwardPolicy,
}

/// Where and how inbound requests are forwarded.
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    /// Local base URL without trailing slash.
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub allowed_prefixes: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub blocked_prefixes: Vec<String>,
}

impl ForwardPolicy {
    /// Whether the relay may reach `path` on the local server.
    ///
    /// Paths containing `.` or `..` segments (plain or percent-encoded) or a
    /// scheme/authority are never allowed.
    pub fn allows(&self, path: &str) -> bool {
        if !path.starts_with('/') || path.starts_with("//") || path.contains('\\') {
            return false;
        }
        if path.split('/').any(is_dot_segment) {
            return false;
        }
        if self.blocked_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return false;
        }
        self.allowed_paths.iter().any(|p| p == path)
            || self
                .allowed_prefixes
                .iter()
                .any(|p| path.starts_with(p.as_str()))
    }
}

/// `.` or `..`, including `%2e` spellings, which URL parsing would collapse.
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

/// Normalize a user-supplied relay address into a WebSocket URL.
///
/// - `""` → `""` (tunnel not configured)
/// - `"relay.example.com/t"` → `"wss://relay.example.com/t"`
/// - `"https://relay.example.com/"` → `"wss://relay.example.com"`
/// - `"http://localhost:9000"` → `"ws://localhost:9000"`
pub fn normalize_server_url(raw: &str) -> Result<String, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(String::new());
    }
    let with_scheme = if let Some(rest) = value.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = value.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if value.starts_with("wss://") || value.starts_with("ws://") {
        value.to_string()
    } else if value.contains("://") {
        return Err(ConfigError::InvalidServerUrl(value.to_string()));
    } else {
        format!("wss://{value}")
    };
    let normalized = with_scheme.trim_end_matches('/').to_string();
    url::Url::parse(&normalized).map_err(|_| ConfigError::InvalidServerUrl(value.to_string()))?;
    Ok(normalized)
}

/// Best-effort hostname for the default display name.
fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "device".to_string())
}
