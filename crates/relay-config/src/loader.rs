//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "application.toml",
    "relay.toml",
    "./config/config.toml",
    "./config/application.toml",
    "/etc/relay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("RELAY_MESSAGE_ROUTER_ENABLED") {
            config.message_router.enabled = val.parse().unwrap_or(true);
        }

        // Mediator
        if let Ok(val) = env::var("RELAY_MEDIATOR_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                config.mediator.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = env::var("RELAY_MEDIATOR_REQUEST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                config.mediator.request_timeout_ms = v;
            }
        }
        if let Ok(val) = env::var("RELAY_CIRCUIT_BREAKER_THRESHOLD") {
            if let Ok(v) = val.parse() {
                config.mediator.circuit_breaker.threshold = v;
            }
        }
        if let Ok(val) = env::var("RELAY_CIRCUIT_BREAKER_COOLDOWN_MS") {
            if let Ok(v) = val.parse() {
                config.mediator.circuit_breaker.cooldown_ms = v;
            }
        }

        // Outbox
        if let Ok(val) = env::var("RELAY_OUTBOX_ENABLED") {
            config.outbox.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_POLL_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                config.outbox.poll_interval_ms = v;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_POLL_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                config.outbox.poll_batch_size = v;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_API_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                config.outbox.api_batch_size = v;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_MAX_CONCURRENT_GROUPS") {
            if let Ok(v) = val.parse() {
                config.outbox.max_concurrent_groups = v;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                config.outbox.buffer_size = v;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                config.outbox.max_retries = v;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_RECOVERY_TIMEOUT_SEC") {
            if let Ok(v) = val.parse() {
                config.outbox.recovery_timeout_sec = v;
            }
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_API_BASE_URL") {
            config.outbox.api_base_url = val;
        }
        if let Ok(val) = env::var("RELAY_OUTBOX_API_TOKEN") {
            config.outbox.api_token = Some(val);
        }

        // Leader
        if let Ok(val) = env::var("RELAY_LEADER_TTL_MS") {
            if let Ok(v) = val.parse() {
                config.leader.ttl_ms = v;
            }
        }
        if let Ok(val) = env::var("RELAY_LEADER_REFRESH_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                config.leader.refresh_interval_ms = v;
            }
        }
        if let Ok(val) = env::var("RELAY_LEADER_REDIS_URL") {
            config.leader.redis_url = val;
        }
        if let Ok(val) = env::var("RELAY_LEADER_LOCK_KEY") {
            config.leader.lock_key = val;
        }
        if let Ok(val) = env::var("RELAY_LEADER_INSTANCE_ID") {
            config.leader.instance_id = val;
        }

        // General
        if let Ok(val) = env::var("RELAY_DATA_DIR") {
            config.data_dir = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
