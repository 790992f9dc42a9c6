//! Configuration module for the IoT telemetry middleware.
//!
//! Supports loading configuration from a TOML file (see §6 of the design
//! for the full list of recognized keys) with `Default` impls for every
//! optional knob, mirroring the teacher's `Config::load`/`Config::from_toml`
//! pair.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// The effective configuration as JSON with password-like fields
    /// replaced by `"***REDACTED***"`, for `GET /api/config`.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(password) = value
            .pointer_mut("/modules/database/connection/password")
        {
            *password = Value::String("***REDACTED***".to_string());
        }
        value
    }
}

// ---------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    pub broker_url: String,
    #[serde(default)]
    pub options: MqttOptions,
    #[serde(default)]
    pub topics: MqttTopics,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttOptions {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout: u64,
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period: u64,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            connect_timeout: default_connect_timeout_ms(),
            reconnect_period: default_reconnect_period_ms(),
        }
    }
}

fn default_client_id() -> String {
    "iot-middleware".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_reconnect_period_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttTopics {
    #[serde(default = "default_v5008_topic")]
    pub v5008: String,
    #[serde(default = "default_v6800_topic")]
    pub v6800: String,
}

impl Default for MqttTopics {
    fn default() -> Self {
        Self {
            v5008: default_v5008_topic(),
            v6800: default_v6800_topic(),
        }
    }
}

fn default_v5008_topic() -> String {
    "V5008Upload/#".to_string()
}
fn default_v6800_topic() -> String {
    "V6800Upload/#".to_string()
}

// ---------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModulesConfig {
    #[serde(default)]
    pub storage: StorageModuleConfig,
    #[serde(default)]
    pub normalizer: NormalizerModuleConfig,
    #[serde(default)]
    pub api_server: ApiServerConfig,
    #[serde(default)]
    pub web_socket_server: WebSocketServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageModuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for StorageModuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval: default_flush_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizerModuleConfig {
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout: u64,
}

impl Default for NormalizerModuleConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout_ms(),
        }
    }
}

fn default_heartbeat_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiServerConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            host: default_host(),
            enabled: true,
        }
    }
}

fn default_api_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketServerConfig {
    #[serde(default = "default_ws_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for WebSocketServerConfig {
    fn default() -> Self {
        Self {
            port: default_ws_port(),
            enabled: true,
        }
    }
}

fn default_ws_port() -> u16 {
    8081
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub connection: DatabaseConnection,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection: DatabaseConnection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConnection {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub database: String,
}

impl Default for DatabaseConnection {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: String::new(),
            database: default_db_name(),
        }
    }
}

impl DatabaseConnection {
    /// Render as a `postgres://` connection string for `sqlx::PgPool`.
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_user() -> String {
    "postgres".to_string()
}
fn default_db_name() -> String {
    "iot_middleware".to_string()
}

fn default_true() -> bool {
    true
}
