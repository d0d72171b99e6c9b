//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Event stream settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Cross-origin settings.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Admission control settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Backend automation service settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
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

    /// Upper bound on a request/response exchange, in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Maximum lifetime of an event stream connection, in seconds.
    ///
    /// Absent by default: a long-lived stream must not be cut by a timeout
    /// meant for short exchanges.
    #[serde(default)]
    pub write_timeout_secs: Option<u64>,

    /// How long shutdown waits for bridges to emit their terminal events.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Event stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Idle keep-alive interval, in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Number of events retained for replay.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,

    /// Per-client outbound queue capacity.
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Value of `Access-Control-Allow-Origin` on preflight responses.
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second. Zero or negative disables limiting.
    #[serde(default)]
    pub requests_per_second: f64,

    /// Paths that bypass the limiter.
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

/// Backend automation service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend. Without it, backend operations report unavailable.
    #[serde(default)]
    pub url: Option<String>,

    /// Timeout for unary backend calls and connection setup, in seconds.
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "relay_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_replay_capacity() -> usize {
    relay_hub::DEFAULT_REPLAY_CAPACITY
}

fn default_client_queue_capacity() -> usize {
    relay_hub::DEFAULT_QUEUE_CAPACITY
}

fn default_allowed_origin() -> String {
    "*".to_string()
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/metrics".to_string()]
}

fn default_backend_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            replay_capacity: default_replay_capacity(),
            client_queue_capacity: default_client_queue_capacity(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origin: default_allowed_origin(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 0.0,
            exempt_paths: default_exempt_paths(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_backend_timeout_secs(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
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
/// - `RELAY_HOST` overrides `server.host`
/// - `RELAY_PORT` overrides `server.port`
/// - `RELAY_BACKEND_URL` overrides `backend.url`
/// - `RELAY_RATE_LIMIT_RPS` overrides `rate_limit.requests_per_second`
/// - `RELAY_CORS_ORIGIN` overrides `cors.allowed_origin`
/// - `RELAY_LOG_LEVEL` overrides `logging.level`
/// - `RELAY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
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

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `RELAY_*` overrides using `lookup` to read variables.
fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("RELAY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("RELAY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(url) = lookup("RELAY_BACKEND_URL") {
        config.backend.url = Some(url).filter(|u| !u.trim().is_empty());
    }
    if let Some(rps) = lookup("RELAY_RATE_LIMIT_RPS") {
        if let Ok(parsed) = rps.parse() {
            config.rate_limit.requests_per_second = parsed;
        }
    }
    if let Some(origin) = lookup("RELAY_CORS_ORIGIN") {
        config.cors.allowed_origin = origin;
    }
    if let Some(level) = lookup("RELAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("RELAY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.server.read_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.write_timeout(), None);
        assert_eq!(config.stream.heartbeat(), Duration::from_secs(15));
        assert_eq!(config.cors.allowed_origin, "*");
        assert_eq!(config.rate_limit.requests_per_second, 0.0);
        assert_eq!(config.rate_limit.exempt_paths, vec!["/health", "/metrics"]);
        assert!(config.backend.url.is_none());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9090
write_timeout_secs = 600

[stream]
heartbeat_secs = 5

[rate_limit]
requests_per_second = 2.5
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.write_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.server.read_timeout_secs, 30);
        assert_eq!(config.stream.heartbeat_secs, 5);
        assert_eq!(config.stream.replay_capacity, relay_hub::DEFAULT_REPLAY_CAPACITY);
        assert_eq!(config.rate_limit.requests_per_second, 2.5);
        assert_eq!(config.rate_limit.exempt_paths.len(), 2);
    }

    #[test]
    fn example_file_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config.example.toml");
        let contents = std::fs::read_to_string(path).unwrap();
        let config: Config = toml::from_str(&contents).unwrap();
        let defaults = Config::default();
        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.server.write_timeout(), None);
        assert_eq!(config.stream.heartbeat_secs, defaults.stream.heartbeat_secs);
        assert_eq!(config.stream.replay_capacity, defaults.stream.replay_capacity);
        assert_eq!(config.rate_limit.exempt_paths, defaults.rate_limit.exempt_paths);
        assert!(config.backend.url.is_none());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_PORT", "7000"),
            ("RELAY_BACKEND_URL", "http://backend:9000"),
            ("RELAY_RATE_LIMIT_RPS", "10"),
            ("RELAY_CORS_ORIGIN", "https://app.example"),
            ("RELAY_LOG_JSON", "1"),
            ("RELAY_HOST", "not-an-ip"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.backend.url.as_deref(), Some("http://backend:9000"));
        assert_eq!(config.rate_limit.requests_per_second, 10.0);
        assert_eq!(config.cors.allowed_origin, "https://app.example");
        assert!(config.logging.json);
        // Unparseable values leave the default in place.
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
}
