//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use postage_gateway::config::{GatewayConfig, StampModeKind};
use std::path::PathBuf;

/// Reverse-proxy gateway for a storage node, with automatic postage stamp management.
#[derive(Parser, Debug)]
#[command(name = "postage-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file. Created with defaults if missing.
    #[arg(long, short, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base URL of the node API.
    #[arg(long, env = "BEE_API_URL")]
    pub bee_api_url: Option<String>,

    /// Listening port.
    #[arg(long, short, env = "PORT")]
    pub port: Option<u16>,

    /// Listening hostname.
    #[arg(long, env = "HOSTNAME")]
    pub hostname: Option<String>,

    /// Secret every request must carry in its `Authorization` header.
    #[arg(long, env = "AUTH_SECRET", hide_env_values = true)]
    pub auth_secret: Option<String>,

    /// Log level.
    #[arg(long, value_enum, env = "LOG_LEVEL")]
    pub log_level: Option<CliLogLevel>,

    /// Always attach this stamp to writes (forces hardcoded mode).
    #[arg(long, env = "POSTAGE_STAMP")]
    pub postage_stamp: Option<String>,
}

/// Log level CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum CliLogLevel {
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace messages (verbose).
    Trace,
}

impl Cli {
    /// Convert CLI arguments into a `GatewayConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded or created.
    pub fn into_config(self) -> color_eyre::Result<GatewayConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            GatewayConfig::load_or_init(path)?
        } else {
            GatewayConfig::default()
        };

        // Override with CLI arguments
        if let Some(url) = self.bee_api_url {
            config.bee.api_url = url;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(hostname) = self.hostname {
            config.server.hostname = hostname;
        }
        if let Some(secret) = self.auth_secret {
            config.server.auth_secret = Some(secret);
        }
        if let Some(level) = self.log_level {
            config.server.log_level = level.into();
        }
        if let Some(stamp) = self.postage_stamp {
            config.stamp.mode = StampModeKind::Hardcoded;
            config.stamp.hardcoded.batch_id = stamp;
        }

        Ok(config)
    }
}

impl From<CliLogLevel> for String {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => "error".to_string(),
            CliLogLevel::Warn => "warn".to_string(),
            CliLogLevel::Info => "info".to_string(),
            CliLogLevel::Debug => "debug".to_string(),
            CliLogLevel::Trace => "trace".to_string(),
        }
    }
}
