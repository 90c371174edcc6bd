use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 9527;
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:9527";
pub const DEFAULT_MAX_RETRIES: u32 = 8;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("COLLAB_UPLOAD_CONFIG").ok().map(PathBuf::from)
}

/// On-disk coordinator settings (`toml`). Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorSettings {
    pub task_timeout_ms: u64,
    pub master_grace_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub max_queue_len: Option<usize>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            task_timeout_ms: 5 * 60 * 1000,
            master_grace_ms: 5 * 60 * 1000,
            heartbeat_timeout_ms: 30 * 1000,
            sweep_interval_ms: 1000,
            max_queue_len: None,
        }
    }
}

impl CoordinatorSettings {
    pub fn into_config(self, bind_addr: SocketAddr) -> CoordinatorConfig {
        CoordinatorConfig {
            bind_addr,
            task_timeout: Duration::from_millis(self.task_timeout_ms),
            master_grace: Duration::from_millis(self.master_grace_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            max_queue_len: self.max_queue_len,
        }
    }
}

pub fn load_coordinator_settings(path: Option<&Path>) -> Result<CoordinatorSettings> {
    let Some(path) = path else {
        return Ok(CoordinatorSettings::default());
    };
    let text = std::fs::read_to_string(path)?;
    parse_coordinator_settings(&text)
}

pub fn parse_coordinator_settings(text: &str) -> Result<CoordinatorSettings> {
    toml::from_str(text).map_err(|e| Error::InvalidConfig {
        message: format!("invalid coordinator settings: {e}"),
    })
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: SocketAddr,
    pub task_timeout: Duration,
    pub master_grace: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_queue_len: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorSettings::default().into_config(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            DEFAULT_PORT,
        ))
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "taskTimeoutMs must be > 0".to_string(),
            });
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "heartbeatTimeoutMs must be > 0".to_string(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "sweepIntervalMs must be > 0".to_string(),
            });
        }
        if self.max_queue_len == Some(0) {
            return Err(Error::InvalidConfig {
                message: "maxQueueLen must be > 0 when set".to_string(),
            });
        }
        Ok(())
    }
}

/// Exponential backoff: the delay before retry `n` (1-based) is
/// `retry_delay * 2^(n-1)`, capped at `max_retry_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retry_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
            ..Self::default()
        }
    }

    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self.retry_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_retry_delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_delay > self.max_retry_delay {
            return Err(Error::InvalidConfig {
                message: "retry delay must not exceed the maximum retry delay".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_url: String,
    pub retry: RetryPolicy,
    /// Pause requested from the coordinator when a 429 carries no hint.
    pub default_retry_after: Duration,
    pub heartbeat_interval: Duration,
    /// Pause before reconnecting after the coordinator goes away.
    pub reconnect_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            retry: RetryPolicy::default(),
            default_retry_after: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        validate_server_url(&self.server_url)?;
        self.retry.validate()?;
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "heartbeat interval must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

pub fn validate_server_url(url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(Error::InvalidConfig {
            message: format!("server url must start with ws:// or wss://: {url}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fall_back_to_defaults() {
        let s = parse_coordinator_settings("taskTimeoutMs = 1500\nmaxQueueLen = 64\n").unwrap();
        assert_eq!(s.task_timeout_ms, 1500);
        assert_eq!(s.max_queue_len, Some(64));
        assert_eq!(s.master_grace_ms, CoordinatorSettings::default().master_grace_ms);
    }

    #[test]
    fn unknown_settings_shape_is_invalid_config() {
        let err = parse_coordinator_settings("taskTimeoutMs = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn missing_settings_path_means_defaults() {
        assert_eq!(
            load_coordinator_settings(None).unwrap(),
            CoordinatorSettings::default()
        );
    }

    #[test]
    fn coordinator_config_rejects_zero_timeouts() {
        let mut c = CoordinatorConfig::default();
        assert!(c.validate().is_ok());
        c.task_timeout = Duration::ZERO;
        assert!(c.validate().is_err());

        let mut c = CoordinatorConfig::default();
        c.max_queue_len = Some(0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let p = RetryPolicy::new(8, 1000);
        let mut prev = Duration::ZERO;
        for n in 1..=p.max_retries {
            let d = p.backoff_delay(n);
            assert!(d >= prev, "retry {n}: {d:?} < {prev:?}");
            assert!(d <= Duration::from_millis(1000 * 2u64.pow(n - 1)));
            prev = d;
        }
        assert_eq!(p.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(p.backoff_delay(4), Duration::from_millis(8000));
    }

    #[test]
    fn backoff_saturates_at_cap() {
        let p = RetryPolicy::new(64, 1000);
        assert_eq!(p.backoff_delay(60), MAX_RETRY_DELAY);
    }

    #[test]
    fn server_url_must_be_websocket() {
        assert!(validate_server_url("ws://localhost:9527").is_ok());
        assert!(validate_server_url("http://localhost:9527").is_err());
    }
}
