//! Relay Configuration System
//!
//! This crate provides TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(rename = "messageRouter")]
    pub message_router: MessageRouterConfig,
    pub queues: Vec<QueueConfig>,
    pub pools: Vec<PoolConfig>,
    pub mediator: MediatorConfig,
    pub outbox: OutboxConfig,
    pub leader: LeaderConfig,

    /// Data directory for local storage (sqlite, dev queue)
    pub data_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            message_router: MessageRouterConfig::default(),
            queues: Vec::new(),
            pools: Vec::new(),
            mediator: MediatorConfig::default(),
            outbox: OutboxConfig::default(),
            leader: LeaderConfig::default(),
            data_dir: "./data".to_string(),
        }
    }
}

/// Top-level toggle for the Message Router subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRouterConfig {
    pub enabled: bool,
}

impl Default for MessageRouterConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// A source queue the router consumes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(rename = "queueUri")]
    pub queue_uri: String,
    #[serde(rename = "queueType")]
    pub queue_type: String,
    #[serde(rename = "batchSize")]
    pub batch_size: Option<u32>,
    #[serde(rename = "visibilityTimeoutSec")]
    pub visibility_timeout_sec: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_uri: String::new(),
            queue_type: "sqs".to_string(),
            batch_size: None,
            visibility_timeout_sec: None,
        }
    }
}

/// A named concurrency domain with per-group FIFO delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    #[serde(rename = "rateLimitPerMinute")]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(rename = "bufferSize")]
    pub buffer_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            code: String::new(),
            concurrency: 1,
            rate_limit_per_minute: None,
            buffer_size: None,
        }
    }
}

/// HTTP mediator (outbound dispatch) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    #[serde(rename = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    #[serde(rename = "requestTimeoutMs")]
    pub request_timeout_ms: u64,
    #[serde(rename = "circuitBreaker")]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Per-target circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    #[serde(rename = "cooldownMs")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// Outbox processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub enabled: bool,
    #[serde(rename = "pollIntervalMs")]
    pub poll_interval_ms: u64,
    #[serde(rename = "pollBatchSize")]
    pub poll_batch_size: u32,
    #[serde(rename = "apiBatchSize")]
    pub api_batch_size: u32,
    #[serde(rename = "maxConcurrentGroups")]
    pub max_concurrent_groups: u32,
    #[serde(rename = "bufferSize")]
    pub buffer_size: usize,
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(rename = "recoveryTimeoutSec")]
    pub recovery_timeout_sec: u64,
    #[serde(rename = "apiBaseUrl")]
    pub api_base_url: String,
    #[serde(rename = "apiToken")]
    pub api_token: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1_000,
            poll_batch_size: 500,
            api_batch_size: 100,
            max_concurrent_groups: 10,
            buffer_size: 1_000,
            max_retries: 3,
            recovery_timeout_sec: 300,
            api_base_url: String::new(),
            api_token: None,
        }
    }
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    #[serde(rename = "ttlMs")]
    pub ttl_ms: u64,
    #[serde(rename = "refreshIntervalMs")]
    pub refresh_interval_ms: u64,
    pub redis_url: String,
    pub lock_key: String,
    pub instance_id: String,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            refresh_interval_ms: 10_000,
            redis_url: "redis://localhost:6379".to_string(),
            lock_key: "relay:outbox:leader".to_string(),
            instance_id: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Relay Configuration
# Environment variables override these settings

[messageRouter]
enabled = true

[[queues]]
queueUri = "https://sqs.us-east-1.amazonaws.com/123456789/events"
queueType = "sqs"
batchSize = 10
visibilityTimeoutSec = 120

[[pools]]
code = "default"
concurrency = 10
rateLimitPerMinute = 600
bufferSize = 500

[mediator]
connectTimeoutMs = 5000
requestTimeoutMs = 30000

[mediator.circuitBreaker]
threshold = 5
cooldownMs = 30000

[outbox]
enabled = true
pollIntervalMs = 1000
pollBatchSize = 500
apiBatchSize = 100
maxConcurrentGroups = 10
bufferSize = 1000
maxRetries = 3
recoveryTimeoutSec = 300
apiBaseUrl = "http://localhost:8080"

[leader]
ttlMs = 30000
refreshIntervalMs = 10000

data_dir = "./data"
"#
        .to_string()
    }
}
