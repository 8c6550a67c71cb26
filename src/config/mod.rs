use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Complete gql-fanout configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FanoutConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
}

/// Listening side of the subscription server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket route
    #[serde(default = "default_path")]
    pub path: String,
    /// Capacity of the manager command channel
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// When set, control (publisher) connections must present ?token=
    #[serde(default)]
    pub control_token: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/subscriptions".to_string()
}

fn default_command_buffer() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            command_buffer: default_command_buffer(),
            control_token: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where producers send events
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "ws://localhost".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            port: default_port(),
            path: default_path(),
            token: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PublisherConfig {
    /// Full WebSocket URL of the server, token included.
    pub fn url(&self) -> String {
        let mut url = format!("{}:{}{}", self.endpoint.trim_end_matches('/'), self.port, self.path);
        if let Some(token) = &self.token {
            url.push_str("?token=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = FanoutConfig::default();
        config.apply_env();
        config.publisher
    }
}

/// Schema selection
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionsConfig {
    #[serde(default = "default_schema")]
    pub default_schema: String,
}

fn default_schema() -> String {
    "default".to_string()
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            default_schema: default_schema(),
        }
    }
}

impl FanoutConfig {
    /// Override fields from FANOUT_* environment variables. Unparseable
    /// values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FANOUT_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("FANOUT_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("FANOUT_CONTROL_TOKEN") {
            self.server.control_token = Some(v);
        }
        if let Ok(v) = std::env::var("FANOUT_PUBLISH_ENDPOINT") {
            self.publisher.endpoint = v;
        }
        if let Ok(v) = std::env::var("FANOUT_PUBLISH_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.publisher.port = port;
            }
        }
        if let Ok(v) = std::env::var("FANOUT_PUBLISH_TOKEN") {
            self.publisher.token = Some(v);
        }
        if let Ok(v) = std::env::var("FANOUT_DEFAULT_SCHEMA") {
            self.subscriptions.default_schema = v;
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<FanoutConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: FanoutConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load the file if it exists (defaults otherwise), then apply env overrides.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<FanoutConfig> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        FanoutConfig::default()
    };
    config.apply_env();
    Ok(config)
}
