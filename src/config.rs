use crate::stream_core::ReconnectPolicy;
use crate::telemetry::{Scope, DEFAULT_CAPACITY};
use std::env;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::Uri;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime configuration for an aggregator
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Query endpoint base URL
    pub api_url: String,
    /// Push endpoint WebSocket URL
    pub ws_url: String,
    /// Bearer credential for both endpoints
    pub token: Option<String>,
    pub scope: Scope,
    pub buffer_capacity: usize,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub rust_log: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            ws_url: "ws://localhost:8080/ws/websocket".to_string(),
            token: None,
            scope: Scope::AllDevices,
            buffer_capacity: DEFAULT_CAPACITY,
            http_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::disabled(),
            rust_log: "info".to_string(),
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TELEMETRY_API_URL` (default: http://localhost:8080)
    /// - `TELEMETRY_WS_URL` (default: ws://localhost:8080/ws/websocket)
    /// - `TELEMETRY_TOKEN` (optional bearer token)
    /// - `TELEMETRY_DEVICE_ID` (optional; unset subscribes to all devices)
    /// - `BUFFER_CAPACITY` (default: 50)
    /// - `HTTP_TIMEOUT_SECS` (default: 10)
    /// - `CONNECT_TIMEOUT_SECS` (default: 10)
    /// - `RECONNECT_ENABLED` (default: false)
    /// - `RECONNECT_INITIAL_DELAY_MS` (default: 1000)
    /// - `RECONNECT_MAX_DELAY_MS` (default: 30000)
    /// - `RECONNECT_MAX_RETRIES` (default: 10)
    /// - `RUST_LOG` (default: info)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_url = env::var("TELEMETRY_API_URL").unwrap_or(defaults.api_url);
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "TELEMETRY_API_URL must start with http:// or https://".to_string(),
            ));
        }

        let ws_url = env::var("TELEMETRY_WS_URL").unwrap_or(defaults.ws_url);
        if !ws_url.starts_with("ws://") && !ws_url.starts_with("wss://") {
            return Err(ConfigError::InvalidValue(
                "TELEMETRY_WS_URL must start with ws:// or wss://".to_string(),
            ));
        }

        let token = env::var("TELEMETRY_TOKEN").ok().filter(|t| !t.is_empty());
        let scope = Scope::from_device_id(env::var("TELEMETRY_DEVICE_ID").ok());

        let buffer_capacity = parse_or("BUFFER_CAPACITY", defaults.buffer_capacity);
        if buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "BUFFER_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let reconnect = ReconnectPolicy {
            enabled: parse_or("RECONNECT_ENABLED", defaults.reconnect.enabled),
            initial_delay: Duration::from_millis(parse_or(
                "RECONNECT_INITIAL_DELAY_MS",
                defaults.reconnect.initial_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(parse_or(
                "RECONNECT_MAX_DELAY_MS",
                defaults.reconnect.max_delay.as_millis() as u64,
            )),
            max_retries: parse_or("RECONNECT_MAX_RETRIES", defaults.reconnect.max_retries),
        };

        Ok(Self {
            api_url,
            ws_url,
            token,
            scope,
            buffer_capacity,
            http_timeout: Duration::from_secs(parse_or(
                "HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )),
            connect_timeout: Duration::from_secs(parse_or(
                "CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            reconnect,
            rust_log: env::var("RUST_LOG").unwrap_or(defaults.rust_log),
        })
    }

    /// Host of the push endpoint, sent as the STOMP `host` header
    pub fn ws_host(&self) -> String {
        self.ws_url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn parse_or<T>(var: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => match raw.trim().to_lowercase().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid {} '{}', defaulting to {}", var, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 8] = [
        "TELEMETRY_API_URL",
        "TELEMETRY_WS_URL",
        "TELEMETRY_TOKEN",
        "TELEMETRY_DEVICE_ID",
        "BUFFER_CAPACITY",
        "RECONNECT_ENABLED",
        "RECONNECT_INITIAL_DELAY_MS",
        "CONNECT_TIMEOUT_SECS",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    // Env vars are process-wide, so every case runs in one test
    #[test]
    fn test_config_from_env() {
        clear();
        let config = AggregatorConfig::from_env().unwrap();
        assert_eq!(config.api_url, "http://localhost:8080");
        assert_eq!(config.ws_url, "ws://localhost:8080/ws/websocket");
        assert_eq!(config.scope, Scope::AllDevices);
        assert_eq!(config.buffer_capacity, 50);
        assert!(!config.reconnect.enabled);
        assert_eq!(config.token, None);

        env::set_var("TELEMETRY_API_URL", "https://telemetry.example.com");
        env::set_var("TELEMETRY_WS_URL", "wss://telemetry.example.com/ws/websocket");
        env::set_var("TELEMETRY_TOKEN", "secret");
        env::set_var("TELEMETRY_DEVICE_ID", "test-device");
        env::set_var("BUFFER_CAPACITY", "20");
        env::set_var("RECONNECT_ENABLED", "TRUE");
        env::set_var("RECONNECT_INITIAL_DELAY_MS", "250");
        env::set_var("CONNECT_TIMEOUT_SECS", "soon");

        let config = AggregatorConfig::from_env().unwrap();
        assert_eq!(config.scope, Scope::Device("test-device".to_string()));
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.buffer_capacity, 20);
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.ws_host(), "telemetry.example.com");

        env::set_var("TELEMETRY_WS_URL", "http://wrong-scheme");
        assert!(matches!(
            AggregatorConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));
        env::remove_var("TELEMETRY_WS_URL");

        env::set_var("BUFFER_CAPACITY", "0");
        assert!(matches!(
            AggregatorConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        clear();
    }
}
