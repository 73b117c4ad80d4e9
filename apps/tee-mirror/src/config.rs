use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SERVER: &str = "127.0.0.1:8080";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Server-sent events; input goes over HTTP.
    #[default]
    Sse,
    /// Bidirectional socket; input is written to the live connection.
    #[value(name = "websocket", alias = "ws")]
    WebSocket,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sse" | "events" => Ok(Self::Sse),
            "websocket" | "ws" => Ok(Self::WebSocket),
            other => Err(ConfigError::Invalid {
                key: "TEE_MIRROR_TRANSPORT",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
}

/// Mirror configuration
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Relay address, with or without scheme.
    pub server: String,
    pub transport: TransportKind,
    /// Fixed delay between a transport failure and the next attempt.
    pub reconnect_delay: Duration,
    pub flush_interval: Duration,
    /// Keep ended sessions (status `done`) instead of destroying them.
    pub retain_ended_sessions: bool,
    /// Sqlite file for the persistent log; `None` keeps the log in memory.
    pub db_path: Option<PathBuf>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            transport: TransportKind::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retain_ended_sessions: false,
            db_path: None,
        }
    }
}

impl MirrorConfig {
    /// Load configuration from `TEE_MIRROR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(server) = non_empty_var("TEE_MIRROR_SERVER") {
            config.server = normalize_server(&server);
        }
        if let Some(kind) = non_empty_var("TEE_MIRROR_TRANSPORT") {
            config.transport = kind.parse()?;
        }
        if let Some(ms) = non_empty_var("TEE_MIRROR_RECONNECT_MS") {
            config.reconnect_delay = parse_millis("TEE_MIRROR_RECONNECT_MS", &ms)?;
        }
        if let Some(ms) = non_empty_var("TEE_MIRROR_FLUSH_MS") {
            config.flush_interval = parse_millis("TEE_MIRROR_FLUSH_MS", &ms)?;
        }
        if let Some(flag) = non_empty_var("TEE_MIRROR_RETAIN_ENDED") {
            config.retain_ended_sessions = flag != "0" && !flag.eq_ignore_ascii_case("false");
        }
        config.db_path = non_empty_var("TEE_MIRROR_DB").map(PathBuf::from);
        Ok(config)
    }

    /// HTTP base of the relay, inferring a scheme when none was given.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let server = self.server.trim().trim_end_matches('/');
        if server.is_empty() {
            return Err(ConfigError::Invalid {
                key: "server",
                value: String::new(),
            });
        }
        let base = if server.contains("://") {
            server.to_string()
        } else {
            format!("{}{server}", infer_scheme(server))
        };
        Ok(Url::parse(&format!("{base}/"))?)
    }

    /// Websocket equivalent of [`MirrorConfig::base_url`].
    pub fn ws_base_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.base_url()?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| ConfigError::Invalid {
            key: "server",
            value: self.server.clone(),
        })?;
        Ok(url)
    }
}

/// Rewrites `localhost:` to `127.0.0.1:`.
pub fn normalize_server(server: &str) -> String {
    // Avoid the IPv6 (::1) preference some resolvers apply to localhost
    if server.starts_with("localhost:") {
        server.replacen("localhost", "127.0.0.1", 1)
    } else {
        server.to_string()
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Positive millisecond count; zero is rejected like any other bad value.
fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

/// Private and loopback hosts default to plain http.
fn infer_scheme(base: &str) -> &'static str {
    let host = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base)
        .to_ascii_lowercase();
    if host.starts_with("localhost")
        || host.starts_with("127.")
        || host.starts_with("0.0.0.0")
        || host == "::1"
        || host.starts_with("10.")
        || host.starts_with("192.168.")
    {
        "http://"
    } else {
        "https://"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "TEE_MIRROR_SERVER",
        "TEE_MIRROR_TRANSPORT",
        "TEE_MIRROR_RECONNECT_MS",
        "TEE_MIRROR_FLUSH_MS",
        "TEE_MIRROR_RETAIN_ENDED",
        "TEE_MIRROR_DB",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = MirrorConfig::default();
        assert_eq!(config.server, "127.0.0.1:8080");
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.transport, TransportKind::Sse);
        assert!(!config.retain_ended_sessions);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = MirrorConfig::from_env().unwrap();
        assert_eq!(config.server, DEFAULT_SERVER);
        assert_eq!(config.reconnect_delay, DEFAULT_RECONNECT_DELAY);
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("TEE_MIRROR_SERVER", "localhost:3000");
            env::set_var("TEE_MIRROR_TRANSPORT", "ws");
            env::set_var("TEE_MIRROR_RECONNECT_MS", "250");
            env::set_var("TEE_MIRROR_RETAIN_ENDED", "1");
            env::set_var("TEE_MIRROR_DB", "/tmp/mirror.db");
        }
        let config = MirrorConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.server, "127.0.0.1:3000");
        assert_eq!(config.transport, TransportKind::WebSocket);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert!(config.retain_ended_sessions);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/mirror.db")));
    }

    #[test]
    fn test_config_rejects_bad_numbers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("TEE_MIRROR_FLUSH_MS", "soon");
        }
        let result = MirrorConfig::from_env();
        clear_env();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "TEE_MIRROR_FLUSH_MS",
                ..
            })
        ));
    }

    #[test]
    fn test_config_rejects_zero_intervals() {
        let _lock = ENV_MUTEX.lock().unwrap();
        for key in ["TEE_MIRROR_FLUSH_MS", "TEE_MIRROR_RECONNECT_MS"] {
            clear_env();
            unsafe {
                env::set_var(key, "0");
            }
            let result = MirrorConfig::from_env();
            clear_env();
            match result {
                Err(ConfigError::Invalid { key: rejected, value }) => {
                    assert_eq!(rejected, key);
                    assert_eq!(value, "0");
                }
                other => panic!("expected {key}=0 to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn localhost_is_normalized_to_ipv4() {
        assert_eq!(normalize_server("localhost:3000"), "127.0.0.1:3000");
        assert_eq!(normalize_server("localhost.example.com"), "localhost.example.com");
        assert_eq!(normalize_server("relay.example.com"), "relay.example.com");
    }

    #[test]
    fn base_urls_infer_scheme() {
        let mut config = MirrorConfig::default();
        assert_eq!(config.base_url().unwrap().as_str(), "http://127.0.0.1:8080/");
        assert_eq!(config.ws_base_url().unwrap().as_str(), "ws://127.0.0.1:8080/");

        config.server = "relay.example.com/".into();
        assert_eq!(config.base_url().unwrap().as_str(), "https://relay.example.com/");
        assert_eq!(config.ws_base_url().unwrap().as_str(), "wss://relay.example.com/");
    }
}
