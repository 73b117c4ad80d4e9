use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, MirrorConfig, TransportKind, normalize_server};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "tee-mirror",
    about = "Mirror relayed terminal sessions into this terminal and a local log",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "TEE_MIRROR_SERVER",
        value_name = "URL",
        help = "Relay address (scheme optional)"
    )]
    pub server: Option<String>,

    #[arg(
        long,
        value_enum,
        env = "TEE_MIRROR_TRANSPORT",
        help = "Push channel to subscribe with"
    )]
    pub transport: Option<TransportKind>,

    #[arg(
        long,
        env = "TEE_MIRROR_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Existing token to reuse; a new one is requested when missing or rejected"
    )]
    pub token: Option<String>,

    #[arg(
        long,
        value_name = "SESSION_ID",
        help = "Only print this session and send typed input to it"
    )]
    pub session: Option<String>,

    #[arg(long, help = "Strip escape sequences instead of passing them through")]
    pub plain: bool,

    #[arg(
        long = "db",
        env = "TEE_MIRROR_DB",
        value_name = "PATH",
        help = "Sqlite file for the transcript log (in-memory when omitted)"
    )]
    pub db_path: Option<PathBuf>,

    #[arg(long = "reconnect-ms", value_name = "MS", help = "Delay before reconnecting after a failure")]
    pub reconnect_ms: Option<u64>,

    #[arg(long = "flush-ms", value_name = "MS", help = "Interval between transcript flushes")]
    pub flush_ms: Option<u64>,

    #[arg(long = "retain-ended", help = "Keep ended sessions visible as done")]
    pub retain_ended: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TEE_MIRROR_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TEE_MIRROR_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

impl Cli {
    /// Layers command-line overrides over the environment-derived config.
    pub fn resolve(&self, mut config: MirrorConfig) -> Result<MirrorConfig, CliError> {
        if let Some(server) = &self.server {
            config.server = normalize_server(server);
        }
        if let Some(kind) = self.transport {
            config.transport = kind;
        }
        if let Some(path) = &self.db_path {
            config.db_path = Some(path.clone());
        }
        if let Some(ms) = self.reconnect_ms {
            config.reconnect_delay = non_zero("--reconnect-ms", ms)?;
        }
        if let Some(ms) = self.flush_ms {
            config.flush_interval = non_zero("--flush-ms", ms)?;
        }
        if self.retain_ended {
            config.retain_ended_sessions = true;
        }
        // Validates the address before anything connects.
        config.base_url()?;
        Ok(config)
    }
}

fn non_zero(flag: &'static str, ms: u64) -> Result<Duration, CliError> {
    if ms == 0 {
        return Err(CliError::ZeroInterval(flag));
    }
    Ok(Duration::from_millis(ms))
}
