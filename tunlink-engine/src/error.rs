//! Error types for the control-plane

use thiserror::Error;

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the control-plane
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire codec error
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Control endpoint error
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// Durable store error
    #[error("store error: {0}")]
    Store(String),

    /// Proxy kernel rejected an operation
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Timeout error
    #[error("timeout: {0}")]
    Timeout(String),

    /// Tunnel is not running
    #[error("VPN is not running")]
    NotRunning,

    /// Not connected to the control endpoint
    #[error("not connected to the control endpoint")]
    NotConnected,
}

impl Error {
    /// Check if this is a recoverable error.
    ///
    /// Transport-level failures are always recoverable by reconnecting;
    /// kernel and configuration failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Endpoint(_) | Error::Timeout(_) | Error::NotConnected
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
