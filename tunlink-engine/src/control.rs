//! Control endpoint: the process boundary between UI and worker
//!
//! The worker exposes a Unix domain socket speaking line-delimited JSON.
//! Unary requests get one response line on a short-lived connection; a
//! `Subscribe` request upgrades the connection into a callback registration
//! through which the hub pushes every state broadcast as an `Event` line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::hub::{StateCallback, StateHub};
use crate::state::StateSnapshot;

/// Default socket path for the control endpoint
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/tunlink.sock";

/// Request messages sent to the control endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Get the current service state ordinal
    GetState,

    /// Get the active target label
    GetActiveLabel,

    /// Get the last error message
    GetLastError,

    /// Get the manual-stop flag
    IsManuallyStopped,

    /// Get the full current snapshot
    Query,

    /// Report an app foreground/background transition
    NotifyLifecycle { foreground: bool, version: u64 },

    /// Hot-reload the active configuration
    Reload { content: String },

    /// Turn this connection into a state-change subscription
    Subscribe,
}

/// Response messages from the control endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Service state ordinal
    State { state: u8 },

    /// Active target label
    Label { label: String },

    /// Boolean flag value
    Flag { value: bool },

    /// Full snapshot
    Snapshot { snapshot: StateSnapshot },

    /// Pushed state change on a subscribed connection
    Event { snapshot: StateSnapshot },

    /// Hot-reload result code
    Reload { code: i32 },

    /// Success acknowledgment
    Ok,

    /// Error response
    Error { message: String },
}

/// Result of a hot-reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The kernel accepted the new configuration
    Success,
    /// Rejected because the tunnel is not running
    VpnNotRunning,
    /// The kernel rejected the configuration or failed applying it
    KernelError,
    /// An unexpected worker-side failure
    UnknownError,
    /// The endpoint could not be reached at all (client-side only,
    /// never sent by the worker)
    IpcError,
}

impl ReloadOutcome {
    /// Stable wire code
    pub fn code(self) -> i32 {
        match self {
            ReloadOutcome::Success => 0,
            ReloadOutcome::VpnNotRunning => 1,
            ReloadOutcome::KernelError => 2,
            ReloadOutcome::UnknownError => 3,
            ReloadOutcome::IpcError => 4,
        }
    }

    /// Decode a wire code; unknown codes collapse to `UnknownError`
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ReloadOutcome::Success,
            1 => ReloadOutcome::VpnNotRunning,
            2 => ReloadOutcome::KernelError,
            4 => ReloadOutcome::IpcError,
            _ => ReloadOutcome::UnknownError,
        }
    }
}

impl std::fmt::Display for ReloadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ReloadOutcome::Success => "success",
            ReloadOutcome::VpnNotRunning => "VPN not running",
            ReloadOutcome::KernelError => "kernel error",
            ReloadOutcome::UnknownError => "unknown error",
            ReloadOutcome::IpcError => "IPC error",
        };
        write!(f, "{}", text)
    }
}

/// Serialize a response as one JSON line and flush it.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, response: &ControlResponse) -> Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Bridges a hub callback registration onto a subscribed connection.
struct ChannelCallback {
    tx: mpsc::UnboundedSender<StateSnapshot>,
}

#[async_trait::async_trait]
impl StateCallback for ChannelCallback {
    async fn on_state_changed(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.tx
            .send(snapshot.clone())
            .map_err(|_| Error::Endpoint("subscriber connection closed".into()))
    }
}

/// Control endpoint server, run inside the worker process.
pub struct ControlServer {
    socket_path: PathBuf,
    hub: Arc<StateHub>,
}

impl ControlServer {
    /// Create a new control server backed by the given hub
    pub fn new(socket_path: impl AsRef<Path>, hub: Arc<StateHub>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            hub,
        }
    }

    /// Accept and serve connections until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        // Remove a socket file left behind by a dead worker
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::Endpoint(format!("failed to bind control socket: {}", e)))?;

        // Owner read/write only
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.socket_path, perms);
        }

        log::info!("control endpoint listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, hub).await {
                            log::debug!("control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("control socket accept error: {}", e);
                }
            }
        }
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn handle_connection(stream: UnixStream, hub: Arc<StateHub>) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }

        let request: ControlRequest = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                let response = ControlResponse::Error {
                    message: format!("invalid request: {}", e),
                };
                write_line(&mut writer, &response).await?;
                continue;
            }
        };

        if matches!(request, ControlRequest::Subscribe) {
            return serve_subscription(reader, writer, hub).await;
        }

        let response = handle_request(request, &hub).await;
        write_line(&mut writer, &response).await?;
    }
}

async fn handle_request(request: ControlRequest, hub: &Arc<StateHub>) -> ControlResponse {
    match request {
        ControlRequest::GetState => ControlResponse::State {
            state: hub.snapshot().await.state.ordinal(),
        },
        ControlRequest::GetActiveLabel => ControlResponse::Label {
            label: hub.snapshot().await.active_label,
        },
        ControlRequest::GetLastError => ControlResponse::Label {
            label: hub.snapshot().await.last_error,
        },
        ControlRequest::IsManuallyStopped => ControlResponse::Flag {
            value: hub.snapshot().await.manually_stopped,
        },
        ControlRequest::Query => ControlResponse::Snapshot {
            snapshot: hub.snapshot().await,
        },
        ControlRequest::NotifyLifecycle {
            foreground,
            version,
        } => {
            hub.notify_lifecycle(foreground, version).await;
            ControlResponse::Ok
        }
        ControlRequest::Reload { content } => ControlResponse::Reload {
            code: hub.hot_reload(&content).await.code(),
        },
        // handled by the caller before dispatch
        ControlRequest::Subscribe => ControlResponse::Error {
            message: "already subscribed".into(),
        },
    }
}

/// Serve a subscribed connection: register with the hub, push every
/// broadcast as an `Event` line, and unregister when the peer goes away.
async fn serve_subscription(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    hub: Arc<StateHub>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    // registration delivers the current snapshot into the channel right away
    let id = hub.register_callback(Arc::new(ChannelCallback { tx })).await;

    // watch the read side for EOF so a vanished peer is noticed even when
    // no broadcasts are flowing
    let (closed_tx, mut closed_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut sink = [0u8; 64];
        loop {
            match reader.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    loop {
        tokio::select! {
            _ = &mut closed_rx => break,
            event = rx.recv() => match event {
                Some(snapshot) => {
                    if write_line(&mut writer, &ControlResponse::Event { snapshot })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    hub.unregister_callback(id).await;
    log::debug!("subscriber {} disconnected", id);
    Ok(())
}

/// Long-lived callback stream held by a subscribed client.
pub struct Subscription {
    reader: BufReader<OwnedReadHalf>,
    // keeps the connection's write side open so the server sees us alive
    _writer: OwnedWriteHalf,
    line: String,
}

impl Subscription {
    /// Wait for the next pushed snapshot.
    ///
    /// Returns `Ok(None)` when the worker closed the connection, the
    /// moral equivalent of a binder death notification.
    pub async fn next(&mut self) -> Result<Option<StateSnapshot>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            match serde_json::from_str::<ControlResponse>(self.line.trim())? {
                ControlResponse::Event { snapshot } | ControlResponse::Snapshot { snapshot } => {
                    return Ok(Some(snapshot));
                }
                ControlResponse::Error { message } => {
                    return Err(Error::Endpoint(message));
                }
                _ => continue,
            }
        }
    }
}

/// One-shot request client for the control endpoint.
#[derive(Debug, Clone)]
pub struct ControlConnector {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlConnector {
    /// Create a connector for the given socket path
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Override the round-trip timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and wait for its single response line.
    pub async fn request(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Endpoint(format!(
                "failed to connect to control socket at {:?}: {}. Is the worker running?",
                self.socket_path, e
            ))
        })?;

        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        writer
            .write_all(&payload)
            .await
            .map_err(|e| Error::Endpoint(format!("failed to send request: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Endpoint(format!("failed to flush request: {}", e)))?;

        let mut line = String::new();
        tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout("waiting for control response".into()))?
            .map_err(|e| Error::Endpoint(format!("failed to read response: {}", e)))?;

        let response: ControlResponse = serde_json::from_str(line.trim())?;
        Ok(response)
    }

    /// Get the full current snapshot
    pub async fn query(&self) -> Result<StateSnapshot> {
        match self.request(&ControlRequest::Query).await? {
            ControlResponse::Snapshot { snapshot } => Ok(snapshot),
            ControlResponse::Error { message } => Err(Error::Endpoint(message)),
            _ => Err(Error::Endpoint("unexpected response".into())),
        }
    }

    /// Deliver one versioned lifecycle notification
    pub async fn notify_lifecycle(&self, foreground: bool, version: u64) -> Result<()> {
        let request = ControlRequest::NotifyLifecycle {
            foreground,
            version,
        };
        match self.request(&request).await? {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error { message } => Err(Error::Endpoint(message)),
            _ => Err(Error::Endpoint("unexpected response".into())),
        }
    }

    /// Request a hot reload of the active configuration
    pub async fn reload(&self, content: &str) -> Result<ReloadOutcome> {
        let request = ControlRequest::Reload {
            content: content.to_string(),
        };
        match self.request(&request).await? {
            ControlResponse::Reload { code } => Ok(ReloadOutcome::from_code(code)),
            ControlResponse::Error { message } => Err(Error::Endpoint(message)),
            _ => Err(Error::Endpoint("unexpected response".into())),
        }
    }

    /// Open a long-lived state-change subscription.
    ///
    /// The first snapshot arrives immediately (delivered on registration),
    /// before any broadcast tick.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Endpoint(format!(
                "failed to connect to control socket at {:?}: {}. Is the worker running?",
                self.socket_path, e
            ))
        })?;

        let (read_half, mut writer) = stream.into_split();

        let mut payload = serde_json::to_vec(&ControlRequest::Subscribe)?;
        payload.push(b'\n');
        writer
            .write_all(&payload)
            .await
            .map_err(|e| Error::Endpoint(format!("failed to subscribe: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Endpoint(format!("failed to subscribe: {}", e)))?;

        Ok(Subscription {
            reader: BufReader::new(read_half),
            _writer: writer,
            line: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_code_roundtrip() {
        for outcome in [
            ReloadOutcome::Success,
            ReloadOutcome::VpnNotRunning,
            ReloadOutcome::KernelError,
            ReloadOutcome::UnknownError,
            ReloadOutcome::IpcError,
        ] {
            assert_eq!(ReloadOutcome::from_code(outcome.code()), outcome);
        }
        assert_eq!(ReloadOutcome::from_code(99), ReloadOutcome::UnknownError);
    }

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_string(&ControlRequest::NotifyLifecycle {
            foreground: true,
            version: 7,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"notify_lifecycle","foreground":true,"version":7}"#
        );

        let parsed: ControlRequest = serde_json::from_str(r#"{"type":"query"}"#).unwrap();
        assert!(matches!(parsed, ControlRequest::Query));
    }

    #[test]
    fn event_wire_format_roundtrip() {
        let response = ControlResponse::Event {
            snapshot: StateSnapshot {
                state: crate::state::ServiceState::Running,
                active_label: "node-A".into(),
                last_error: String::new(),
                manually_stopped: false,
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        let parsed: ControlResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlResponse::Event { snapshot } => {
                assert_eq!(snapshot.active_label, "node-A");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
