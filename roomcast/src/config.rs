use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use roomcast_api::http::DEFAULT_MAX_MESSAGE_SIZE;
use roomcast_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "ROOMCAST_CONFIG_PATH";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest inbound WebSocket message, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path));
        }

        // ROOMCAST_SERVER__PORT, ROOMCAST_SFU__MAX_PEERS, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be greater than zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Locate the config file
///
/// Search order:
/// 1. explicit path (command line)
/// 2. `ROOMCAST_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
pub fn find_config_file(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|candidate| Path::new(candidate).exists())
                .map(str::to_string)
        })
}

/// Load and validate configuration, failing fast on any problem
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    let path = find_config_file(explicit);
    match &path {
        Some(path) => eprintln!("Loading config from {path}"),
        None => eprintln!("No config file found, using defaults and environment variables"),
    }

    let config = Config::load(path.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;

    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!("Configuration loaded and validated successfully");
    Ok(config)
}
