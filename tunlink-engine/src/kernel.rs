//! Boundary traits for the external proxy kernel and the OS tunnel probe
//!
//! The actual kernel (routing, protocol handling, traffic accounting) lives
//! outside this crate; the control-plane only reaches it through these seams.

use crate::error::Result;

/// The externally-built proxy kernel's control surface.
#[async_trait::async_trait]
pub trait ProxyKernel: Send + Sync {
    /// Apply a configuration to the running kernel without stopping it.
    ///
    /// Returns whether the kernel accepted the configuration. An `Err`
    /// indicates the kernel itself failed, not that the config was rejected.
    async fn start_or_reload(&self, config: &str) -> Result<bool>;
}

/// OS-level probe answering "is there an active tunnel right now".
///
/// This is the liveness source the client consults when the RPC channel
/// cannot be trusted; on Android it inspects the active network transports.
#[async_trait::async_trait]
pub trait TunnelProbe: Send + Sync {
    /// Whether the platform reports an active tunnel transport
    async fn tunnel_active(&self) -> bool;
}

/// Kernel stand-in that accepts every reload.
///
/// Used by tooling and tests when the real kernel library is not loaded.
pub struct NoopKernel;

#[async_trait::async_trait]
impl ProxyKernel for NoopKernel {
    async fn start_or_reload(&self, _config: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Probe stand-in that never reports an active tunnel.
pub struct NoTunnelProbe;

#[async_trait::async_trait]
impl TunnelProbe for NoTunnelProbe {
    async fn tunnel_active(&self) -> bool {
        false
    }
}
