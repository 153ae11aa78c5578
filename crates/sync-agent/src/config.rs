//! Agent configuration

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sync_core::{QueueConfig, RetryConfig, SessionConfig};

/// Agent configuration
///
/// Read from an optional `sync-agent.toml` in the working directory, then
/// overridden by `SYNC_`-prefixed environment variables
/// (e.g. `SYNC_BACKEND_URL`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Stable device identifier; generated and persisted when unset
    #[serde(default)]
    pub device_id: Option<String>,

    /// Loopback address for the local API
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Remote backend base URL
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Directory of the durable store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// Retries per queued operation before it is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long before expiry the session is refreshed
    #[serde(default = "default_refresh_lead")]
    pub refresh_lead_secs: u64,

    /// Period of cache and rate-limiter housekeeping
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    7878
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("sync-data")
}

fn default_drain_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_refresh_lead() -> u64 {
    300
}

fn default_maintenance_interval() -> u64 {
    300
}

impl AgentConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("sync-agent").required(false))
            .add_source(config::Environment::with_prefix("SYNC"))
            .build()
            .context("Failed to read agent configuration")?;

        Self::from_source(config)
    }

    fn from_source(source: config::Config) -> Result<Self> {
        let config: Self = source
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject periods that would spin their timers
    fn validate(&self) -> Result<()> {
        ensure!(self.drain_interval_secs > 0, "drain_interval_secs must be at least 1");
        ensure!(
            self.maintenance_interval_secs > 0,
            "maintenance_interval_secs must be at least 1"
        );
        ensure!(self.request_timeout_secs > 0, "request_timeout_secs must be at least 1");
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retry: RetryConfig {
                max_retries: self.max_retries,
                timeout: Duration::from_secs(self.request_timeout_secs),
                ..RetryConfig::backend()
            },
            drain_interval: Duration::from_secs(self.drain_interval_secs),
            ..Default::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_lead: Duration::from_secs(self.refresh_lead_secs),
            retry: RetryConfig {
                timeout: Duration::from_secs(self.request_timeout_secs),
                ..RetryConfig::api()
            },
            ..Default::default()
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_empty_source() {
        let config: AgentConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.device_id.is_none());
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.api_port, 7878);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.queue_config().drain_interval, Duration::from_secs(30));
        assert_eq!(
            config.session_config().refresh_lead,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_overrides() {
        let config: AgentConfig = config::Config::builder()
            .set_override("max_retries", 5)
            .unwrap()
            .set_override("backend_url", "https://api.example.com")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.backend_url, "https://api.example.com");
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.queue_config().retry.max_retries, 5);
        assert_eq!(
            config.queue_config().retry.base_delay,
            RetryConfig::backend().base_delay
        );
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for key in [
            "drain_interval_secs",
            "maintenance_interval_secs",
            "request_timeout_secs",
        ] {
            let source = config::Config::builder()
                .set_override(key, 0)
                .unwrap()
                .build()
                .unwrap();

            let err = AgentConfig::from_source(source).unwrap_err();
            assert!(err.to_string().contains(key), "{} accepted: {}", key, err);
        }
    }
}
