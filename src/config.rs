//! # Configuration Management
//!
//! Centralized configuration for a [`crate::network::Network`].
//!
//! Every timing and sizing knob of the transport lives here: handshake timeout
//! and declared features, reliable-stream retry interval and in-flight window,
//! close timeout, chunk sizes, bandwidth sampling, the scheduler pool, QUIC
//! naming and logging.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - Direct instantiation with defaults
//! - `MUX_NETWORK_*` environment overrides via [`NetworkConfig::from_env`]
//!
//! Durations are written as milliseconds.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::core::frame::MAX_DATA_PAYLOAD;
use crate::core::types::HandshakeFeatures;
use crate::error::ConfigError;

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default reliable-stream retry interval
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of unacknowledged reliable messages per stream
pub const DEFAULT_WINDOW: usize = 64;

/// Default wait for the peer's close acknowledgment
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default `Data` chunk size on stream sockets
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024;

/// Default `Data` chunk size on datagram sockets, below common path MTUs
pub const DEFAULT_DATAGRAM_CHUNK_SIZE: usize = 1200;

/// Default cap on one reassembled message, matching the QUIC length prefix limit
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub participant: ParticipantConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub quic: QuicConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut file = File::open(path)
            .map_err(|e| ConfigError::Invalid(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ConfigError::Invalid(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str::<Self>(content)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = env_millis("MUX_NETWORK_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake.timeout = val;
        }
        if let Some(val) = env_millis("MUX_NETWORK_RETRY_INTERVAL_MS")? {
            config.stream.retry_interval = val;
        }
        if let Some(val) = env_millis("MUX_NETWORK_CLOSE_TIMEOUT_MS")? {
            config.stream.close_timeout = val;
        }
        if let Some(val) = env_parse::<usize>("MUX_NETWORK_WINDOW")? {
            config.stream.window = val;
        }
        if let Some(val) = env_parse::<usize>("MUX_NETWORK_SCHEDULER_WORKERS")? {
            config.scheduler.workers = val;
        }
        if let Ok(level) = std::env::var("MUX_NETWORK_LOG_LEVEL") {
            config.logging.log_level = level
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Invalid(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.handshake.validate());
        errors.extend(self.stream.validate());
        errors.extend(self.participant.validate());
        errors.extend(self.scheduler.validate());
        errors.extend(self.quic.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<(), ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key} has an invalid value: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

/// Handshake configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HandshakeConfig {
    /// Upper bound for one complete handshake
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Features declared when `listen`/`connect` is called without explicit ones
    pub features: HandshakeFeatures,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            features: HandshakeFeatures::all(),
        }
    }
}

impl HandshakeConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }
        errors
    }
}

/// Per-stream delivery configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Fixed resend interval for unacknowledged reliable messages
    #[serde(with = "duration_serde")]
    pub retry_interval: Duration,

    /// Maximum number of unacknowledged reliable messages per stream
    pub window: usize,

    /// How long a reliable close waits for the peer's echo
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,

    /// Largest `Data` frame payload on stream sockets
    pub max_chunk_size: usize,

    /// Largest `Data` frame payload on datagram sockets
    pub datagram_chunk_size: usize,

    /// Largest message a stream sends or reassembles
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            window: DEFAULT_WINDOW,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            datagram_chunk_size: DEFAULT_DATAGRAM_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.retry_interval.as_millis() < 10 {
            errors.push("Retry interval too short (minimum: 10ms)".to_string());
        } else if self.retry_interval.as_secs() > 60 {
            errors.push("Retry interval too long (maximum: 60s)".to_string());
        }

        if self.window == 0 {
            errors.push("In-flight window must be greater than 0".to_string());
        } else if self.window > 65_536 {
            errors.push(format!(
                "In-flight window too large: {} (maximum: 65536)",
                self.window
            ));
        }

        if self.close_timeout.is_zero() {
            errors.push("Close timeout must be greater than 0".to_string());
        } else if self.close_timeout.as_secs() > 60 {
            errors.push("Close timeout too long (maximum: 60s)".to_string());
        }

        for (name, size) in [
            ("max_chunk_size", self.max_chunk_size),
            ("datagram_chunk_size", self.datagram_chunk_size),
        ] {
            if size == 0 {
                errors.push(format!("{name} must be greater than 0"));
            } else if size > MAX_DATA_PAYLOAD {
                errors.push(format!(
                    "{name} too large: {size} bytes (maximum: {MAX_DATA_PAYLOAD})"
                ));
            }
        }

        if self.max_message_size == 0 {
            errors.push("max_message_size must be greater than 0".to_string());
        }

        errors
    }
}

/// Participant configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParticipantConfig {
    /// Bandwidth sampling period
    #[serde(with = "duration_serde")]
    pub bandwidth_interval: Duration,

    /// Partially received messages older than this are dropped
    #[serde(with = "duration_serde")]
    pub partial_message_ttl: Duration,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            bandwidth_interval: Duration::from_secs(1),
            partial_message_ttl: Duration::from_secs(10),
        }
    }
}

impl ParticipantConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.bandwidth_interval.as_millis() < 100 {
            errors.push("Bandwidth interval too short (minimum: 100ms)".to_string());
        }
        if self.partial_message_ttl < self.bandwidth_interval {
            errors.push(
                "Partial message TTL must not be shorter than the bandwidth interval".to_string(),
            );
        }
        errors
    }
}

/// Scheduler worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Workers started up front
    pub workers: usize,

    /// Tasks running longer than this are abandoned and counted
    #[serde(default, with = "option_duration_serde")]
    pub task_timeout: Option<Duration>,

    /// Spawn extra workers while the queue is backed up
    pub auto_scale: bool,

    /// Upper bound for auto-scaling
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            task_timeout: None,
            auto_scale: false,
            max_workers: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.workers == 0 {
            errors.push("Scheduler needs at least one worker".to_string());
        }
        if self.max_workers < self.workers {
            errors.push(format!(
                "max_workers ({}) is below workers ({})",
                self.max_workers, self.workers
            ));
        }
        if let Some(timeout) = self.task_timeout {
            if timeout.is_zero() {
                errors.push("Scheduler task timeout must be greater than 0".to_string());
            }
        }
        errors
    }
}

/// QUIC naming
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuicConfig {
    /// Application protocol name announced via ALPN
    pub alpn: String,

    /// Server name used for self-signed certificates and client verification
    pub server_name: String,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            alpn: String::from("veloren"),
            server_name: String::from("localhost"),
        }
    }
}

impl QuicConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.alpn.is_empty() || self.alpn.len() > 255 {
            errors.push("QUIC ALPN must be 1 to 255 bytes".to_string());
        }
        if self.server_name.is_empty() {
            errors.push("QUIC server name cannot be empty".to_string());
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mux-network"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as `duration_serde` for optional durations
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
