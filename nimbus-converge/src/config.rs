//! Convergence configuration.
//!
//! One immutable struct carries every tunable. Components copy what they need
//! at construction time; nothing reads ambient or global state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, Result};

/// Timeouts, poll periods and retry counts for the convergence core.
///
/// Every field has a default, so a partial JSON document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfig {
    /// Period between status polls, in seconds.
    pub poll_period_secs: u64,
    /// Budget for a node to reach RUNNING, in seconds.
    pub node_running_timeout_secs: u64,
    /// Budget for finding an open management port, in seconds.
    pub port_open_timeout_secs: u64,
    /// Connect timeout for a single reachability probe, in seconds.
    pub socket_timeout_secs: u64,
    /// Budget for an image bake, in seconds.
    pub image_max_wait_secs: u64,
    /// Initial period between image polls, in seconds.
    pub image_poll_period_secs: u64,
    /// Cap for the backed-off image poll period, in seconds.
    pub image_max_poll_period_secs: u64,
    /// Attempts made by `with_retry` before giving up.
    pub ssh_max_retries: u32,
    /// Base delay for the exponential backoff of `with_retry`, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Budget for deleting incidental resources that are still in use, in seconds.
    pub cleanup_timeout_secs: u64,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            poll_period_secs: 1,
            node_running_timeout_secs: 1200,
            port_open_timeout_secs: 600,
            socket_timeout_secs: 3,
            image_max_wait_secs: 3600,
            image_poll_period_secs: 1,
            image_max_poll_period_secs: 30,
            ssh_max_retries: 5,
            retry_base_delay_ms: 200,
            cleanup_timeout_secs: 3,
        }
    }
}

impl ConvergeConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject periods that are zero or longer than the budgets they poll within.
    pub fn validate(&self) -> Result<()> {
        if self.poll_period_secs == 0 {
            return Err(ConvergeError::Configuration(
                "poll_period_secs must be greater than 0".to_string(),
            ));
        }
        if self.image_poll_period_secs == 0 {
            return Err(ConvergeError::Configuration(
                "image_poll_period_secs must be greater than 0".to_string(),
            ));
        }
        if self.image_max_poll_period_secs < self.image_poll_period_secs {
            return Err(ConvergeError::Configuration(format!(
                "image_max_poll_period_secs ({}) must not be below image_poll_period_secs ({})",
                self.image_max_poll_period_secs, self.image_poll_period_secs
            )));
        }
        if self.poll_period_secs > self.node_running_timeout_secs {
            return Err(ConvergeError::Configuration(format!(
                "poll_period_secs ({}) exceeds node_running_timeout_secs ({})",
                self.poll_period_secs, self.node_running_timeout_secs
            )));
        }
        if self.image_poll_period_secs > self.image_max_wait_secs {
            return Err(ConvergeError::Configuration(format!(
                "image_poll_period_secs ({}) exceeds image_max_wait_secs ({})",
                self.image_poll_period_secs, self.image_max_wait_secs
            )));
        }
        if self.socket_timeout_secs == 0 {
            return Err(ConvergeError::Configuration(
                "socket_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.ssh_max_retries == 0 {
            return Err(ConvergeError::Configuration(
                "ssh_max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn node_running_timeout(&self) -> Duration {
        Duration::from_secs(self.node_running_timeout_secs)
    }

    pub fn port_open_timeout(&self) -> Duration {
        Duration::from_secs(self.port_open_timeout_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn image_max_wait(&self) -> Duration {
        Duration::from_secs(self.image_max_wait_secs)
    }

    pub fn image_poll_period(&self) -> Duration {
        Duration::from_secs(self.image_poll_period_secs)
    }

    pub fn image_max_poll_period(&self) -> Duration {
        Duration::from_secs(self.image_max_poll_period_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }
}
