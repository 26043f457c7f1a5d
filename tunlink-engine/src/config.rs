//! Configuration types for the control-plane

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
///
/// The configuration file uses TOML format. All sections are optional;
/// defaults are chosen so that the worker and the UI side of the
/// control-plane agree on socket and store locations out of the box.
///
/// # Example Configuration
///
/// ```toml
/// [control]
/// socket_path = "/var/run/tunlink.sock"
/// request_timeout_ms = 5000
///
/// [store]
/// dir = "/var/lib/tunlink"
///
/// [timing]
/// broadcast_min_interval_ms = 50
/// max_reconnect_attempts = 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Control endpoint settings
    #[serde(default)]
    pub control: ControlConfig,

    /// Durable store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Tunable intervals and retry limits
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.control.socket_path.as_os_str().is_empty() {
            return Err(Error::Config("control.socket_path is required".into()));
        }
        if self.control.request_timeout_ms == 0 {
            return Err(Error::Config(
                "control.request_timeout_ms must be positive".into(),
            ));
        }
        self.timing.validate()
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Tunlink control-plane configuration

[control]
# Unix socket the worker listens on and the UI connects to
socket_path = "/var/run/tunlink.sock"

# Timeout for one-shot control requests (milliseconds)
request_timeout_ms = 5000

[store]
# Directory holding the durable cross-process state files
dir = "/var/lib/tunlink"

[timing]
# Minimum interval between two state broadcasts to the same listener.
# Bursty updates (traffic ticks) are coalesced within this window.
broadcast_min_interval_ms = 50

# Base delay for linear reconnect backoff (attempt * base)
reconnect_base_delay_ms = 500

# Bind attempts before the client stops retrying on its own
max_reconnect_attempts = 5

# Fixed retry interval for undelivered app lifecycle notifications
lifecycle_retry_interval_ms = 300

# Callback silence after which the live channel is considered stale
callback_stale_after_ms = 6000
"#
        .to_string()
    }
}

/// Control endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Path of the Unix socket exposing the control endpoint
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Timeout for one-shot requests, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ControlConfig {
    /// Timeout for one-shot requests
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the state and settings files
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

/// Tunable intervals and retry limits.
///
/// These are deliberately configuration parameters, not hard invariants;
/// the defaults are conservative values that keep broadcast load bounded
/// without making state visibly laggy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum interval between broadcasts, in milliseconds
    #[serde(default = "default_broadcast_min_interval_ms")]
    pub broadcast_min_interval_ms: u64,

    /// Base delay for linear reconnect backoff, in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum automatic bind attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Fixed retry interval for pending lifecycle notifications, in milliseconds
    #[serde(default = "default_lifecycle_retry_interval_ms")]
    pub lifecycle_retry_interval_ms: u64,

    /// Callback silence window after which the channel counts as stale, in milliseconds
    #[serde(default = "default_callback_stale_after_ms")]
    pub callback_stale_after_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            broadcast_min_interval_ms: default_broadcast_min_interval_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            lifecycle_retry_interval_ms: default_lifecycle_retry_interval_ms(),
            callback_stale_after_ms: default_callback_stale_after_ms(),
        }
    }
}

impl TimingConfig {
    /// Validate the timing parameters
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_min_interval_ms == 0 {
            return Err(Error::Config(
                "timing.broadcast_min_interval_ms must be positive".into(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(Error::Config(
                "timing.max_reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.lifecycle_retry_interval_ms == 0 {
            return Err(Error::Config(
                "timing.lifecycle_retry_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Minimum interval between broadcasts
    pub fn broadcast_min_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_min_interval_ms)
    }

    /// Base delay for linear reconnect backoff
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Fixed retry interval for pending lifecycle notifications
    pub fn lifecycle_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lifecycle_retry_interval_ms)
    }

    /// Callback silence window after which the channel counts as stale
    pub fn callback_stale_after(&self) -> Duration {
        Duration::from_millis(self.callback_stale_after_ms)
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(crate::control::DEFAULT_SOCKET_PATH)
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/tunlink")
}

fn default_broadcast_min_interval_ms() -> u64 {
    50
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_lifecycle_retry_interval_ms() -> u64 {
    300
}

fn default_callback_stale_after_ms() -> u64 {
    6000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.timing.broadcast_min_interval_ms, 50);
        assert_eq!(config.timing.max_reconnect_attempts, 5);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(
            config.control.socket_path,
            PathBuf::from(crate::control::DEFAULT_SOCKET_PATH)
        );
        assert_eq!(config.timing.callback_stale_after_ms, 6000);
    }

    #[test]
    fn zero_interval_rejected() {
        let result = Config::from_toml("[timing]\nbroadcast_min_interval_ms = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn zero_attempts_rejected() {
        let result = Config::from_toml("[timing]\nmax_reconnect_attempts = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
