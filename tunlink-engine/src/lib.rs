//! tunlink-engine: cross-process control plane for a VPN proxy client
//!
//! The engine splits the VPN app into two cooperating processes. The worker
//! process owns the tunnel and the single authoritative copy of connection
//! state; the UI process mirrors that state through an RPC channel and keeps
//! working when the channel dies.
//!
//! ```text
//!   UI process                          worker process
//!  ┌───────────────┐   control socket  ┌───────────────┐
//!  │  RemoteClient │◄─────────────────►│ ControlServer │
//!  │   (mirror)    │  requests/events  │      │        │
//!  └──────┬────────┘                   │   StateHub    │──► ProxyKernel
//!         │                            │ (sole writer) │
//!         ▼                            └──────┬────────┘
//!    observers (watch)                        │
//!         ▲                                   ▼
//!         └───────────── StateStore ◄─────────┘
//!                     (durable fallback)
//! ```
//!
//! Three layers of truth, in order of preference:
//! 1. the live callback stream from the [`StateHub`], pushed over the
//!    control socket,
//! 2. the durable [`StateStore`], written synchronously on every transition,
//! 3. the OS tunnel probe, consulted when neither of the above can be
//!    trusted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunlink_engine::{Config, NoopKernel, StateHub, StateStore, StateUpdate, ServiceState};
//!
//! #[tokio::main]
//! async fn main() -> tunlink_engine::Result<()> {
//!     let config = Config::default();
//!     let store = Arc::new(StateStore::new(&config.store.dir)?);
//!     let hub = StateHub::new(store, Arc::new(NoopKernel), &config.timing);
//!
//!     hub.update(StateUpdate::new().state(ServiceState::Starting)).await;
//!     // ... establish the tunnel ...
//!     hub.update(
//!         StateUpdate::new()
//!             .state(ServiceState::Running)
//!             .active_label("node-A"),
//!     )
//!     .await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod hub;
pub mod kernel;
pub mod state;
pub mod store;

pub use client::{LinkState, RemoteClient};
pub use config::Config;
pub use control::{
    ControlConnector, ControlRequest, ControlResponse, ControlServer, ReloadOutcome, Subscription,
    DEFAULT_SOCKET_PATH,
};
pub use error::{Error, Result};
pub use hub::{StateCallback, StateHub};
pub use kernel::{NoTunnelProbe, NoopKernel, ProxyKernel, TunnelProbe};
pub use state::{ServiceState, StateSnapshot, StateUpdate};
pub use store::{PerAppMode, PerAppVpn, StateStore, TunOptions};
