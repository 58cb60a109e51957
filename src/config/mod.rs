//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::connection::{ConnectOptions, Credentials};
use crate::protocol::{SessionOptions, DEFAULT_CLI_PORT};

const APP_DIR_NAME: &str = "lms-cli-client";

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Server to connect to; unset means discover one.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_cli_port")]
    pub cli_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_cli_port() -> u16 {
    DEFAULT_CLI_PORT
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.cli_port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Send `listen 1` after the handshake.
    pub subscribe_events: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_timeout_ms: 10_000,
            handshake_timeout_ms: 30_000,
            subscribe_events: true,
        }
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

impl From<&SessionConfig> for ConnectOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            session: SessionOptions::from(config),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            subscribe_events: config.subscribe_events,
        }
    }
}

impl Config {
    /// Credentials of the configured server (none if no server is set).
    pub fn credentials(&self) -> Credentials {
        self.server
            .as_ref()
            .map(ServerConfig::credentials)
            .unwrap_or_default()
    }
}

/// Get config directory (LMSC_CONFIG_DIR or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LMSC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("page_size", default_page_size() as i64)?
        // <config_dir>/config.{toml,json,yaml,...} if present
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // LMSC_SERVER__HOST, LMSC_SESSION__REQUEST_TIMEOUT_MS, ...
        .add_source(
            ::config::Environment::with_prefix("LMSC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Short variables take precedence over the file; bad numbers are ignored.
    if let Ok(host) = std::env::var("LMS_HOST") {
        builder = builder.set_override("server.host", host)?;
    }
    if let Ok(port) = std::env::var("LMS_CLI_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("server.cli_port", port_num as i64)?;
        }
    }
    if let Ok(username) = std::env::var("LMS_USERNAME") {
        builder = builder.set_override("server.username", username)?;
    }
    if let Ok(password) = std::env::var("LMS_PASSWORD") {
        builder = builder.set_override("server.password", password)?;
    }

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}
