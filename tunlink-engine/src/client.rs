//! Remote client: the UI-process mirror of the worker's state
//!
//! The client keeps a live subscription to the control endpoint, masks its
//! failures behind an always-available local observable snapshot, and
//! guarantees that app lifecycle notifications are eventually delivered.
//! When the live channel cannot be trusted it falls back to the durable
//! store, which is never wrong about whether the tunnel is fundamentally
//! up or down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, TimingConfig};
use crate::control::{ControlConnector, ReloadOutcome, Subscription};
use crate::kernel::TunnelProbe;
use crate::state::{ServiceState, StateSnapshot};
use crate::store::StateStore;

/// Connection sub-state of the client.
///
/// Binding is fire-and-forget: `Connecting` resolves asynchronously to
/// `Connected` or back to `Disconnected` once the attempt cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No bind issued or the channel has been released
    Disconnected,
    /// A bind has been issued and is resolving (includes backoff waits)
    Connecting,
    /// The subscription stream is live
    Connected,
}

/// The single pending lifecycle notification; latest version wins.
#[derive(Debug, Clone, Copy)]
struct PendingLifecycle {
    foreground: bool,
    version: u64,
}

struct ClientInner {
    link: LinkState,
    /// Bumped on every disconnect; tasks spawned under an older epoch
    /// become no-ops when they next check it
    epoch: u64,
    reconnect_attempts: u32,
    subscription_task: Option<JoinHandle<()>>,
    pending_lifecycle: Option<PendingLifecycle>,
    /// Highest lifecycle version confirmed by the worker
    delivered_lifecycle: u64,
    lifecycle_retry_running: bool,
    last_event_at: Option<Instant>,
}

/// UI-process client for the worker's control endpoint.
///
/// All operations are non-throwing: platform failures degrade to "keep the
/// current local state and retry later" instead of propagating. `connect`,
/// `disconnect` and `rebind` never block the caller; progress is observed
/// through [`RemoteClient::observe`] or by polling [`RemoteClient::link_state`].
///
/// Must be driven from within a tokio runtime.
pub struct RemoteClient {
    weak: Weak<RemoteClient>,
    connector: ControlConnector,
    store: Arc<StateStore>,
    probe: Arc<dyn TunnelProbe>,
    timing: TimingConfig,

    inner: Mutex<ClientInner>,
    /// Local observable snapshot; always available, even while disconnected
    state_tx: watch::Sender<StateSnapshot>,
    lifecycle_version: AtomicU64,
}

impl RemoteClient {
    /// Create a client; the initial observable state comes from the store.
    pub fn new(
        config: &Config,
        store: Arc<StateStore>,
        probe: Arc<dyn TunnelProbe>,
    ) -> Arc<Self> {
        let connector = ControlConnector::new(&config.control.socket_path)
            .with_timeout(config.control.request_timeout());
        let initial = store.snapshot();
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            connector,
            store,
            probe,
            timing: config.timing.clone(),
            inner: Mutex::new(ClientInner {
                link: LinkState::Disconnected,
                epoch: 0,
                reconnect_attempts: 0,
                subscription_task: None,
                pending_lifecycle: None,
                delivered_lifecycle: 0,
                lifecycle_retry_running: false,
                last_event_at: None,
            }),
            state_tx: watch::channel(initial).0,
            lifecycle_version: AtomicU64::new(0),
        })
    }

    /// Subscribe to the local observable snapshot
    pub fn observe(&self) -> watch::Receiver<StateSnapshot> {
        self.state_tx.subscribe()
    }

    /// Current local snapshot
    pub fn current(&self) -> StateSnapshot {
        self.state_tx.borrow().clone()
    }

    /// Current connection sub-state
    pub fn link_state(&self) -> LinkState {
        self.inner.lock().unwrap().link
    }

    /// Whether a bind has been issued and not released
    pub fn is_bound(&self) -> bool {
        self.link_state() != LinkState::Disconnected
    }

    /// Whether the subscription stream is live
    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Issue a bind to the control endpoint.
    ///
    /// No-op if already connecting or connected. Resets the reconnect
    /// attempt counter, so an explicit `connect` always revives a client
    /// that gave up after exhausting its automatic attempts.
    pub fn connect(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.link != LinkState::Disconnected {
            return;
        }
        inner.link = LinkState::Connecting;
        inner.reconnect_attempts = 0;
        let epoch = inner.epoch;
        inner.subscription_task = self.spawn_bind(epoch);
    }

    /// Release the channel.
    ///
    /// Always leaves the client in a clean `Disconnected` state, whatever
    /// the underlying socket was doing; safe to call repeatedly.
    pub fn disconnect(&self) {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            inner.epoch += 1;
            inner.link = LinkState::Disconnected;
            inner.reconnect_attempts = 0;
            inner.subscription_task.take()
        };
        if let Some(task) = task {
            // dropping the subscription closes the socket; the worker
            // unregisters the callback when it sees EOF
            task.abort();
        }
    }

    /// Forced recovery: never reuse a suspect channel.
    ///
    /// Unconditionally disconnects, reconnects, and then refreshes the
    /// local observable state from the durable store rather than from the
    /// channel being reestablished, so observers never see a stale value
    /// lingering through the reconnect window.
    pub fn rebind(&self) {
        self.disconnect();
        self.connect();
        self.state_tx.send_replace(self.store.snapshot());
    }

    /// One verification round-trip, or a probe-based reconciliation.
    ///
    /// Connected: query the worker and adopt the result as local truth,
    /// returning whether the round-trip succeeded. Not connected: reconcile
    /// against the OS tunnel probe: a local `Running` belief with no
    /// OS-level tunnel downgrades to `Stopped`, and an OS-level tunnel with
    /// no local belief triggers a `connect`.
    ///
    /// Performs blocking-ish I/O; call it off the UI-thread equivalent.
    pub async fn query_and_sync_state(&self) -> bool {
        if self.is_connected() {
            match self.connector.query().await {
                Ok(snapshot) => {
                    self.state_tx.send_replace(snapshot);
                    true
                }
                Err(e) => {
                    log::debug!("state query failed: {}", e);
                    false
                }
            }
        } else {
            let os_active = self.probe.tunnel_active().await;
            let local = self.current();
            if local.state == ServiceState::Running && !os_active {
                log::info!("no OS tunnel present, downgrading local state to stopped");
                let mut corrected = local;
                corrected.state = ServiceState::Stopped;
                corrected.active_label = String::new();
                self.state_tx.send_replace(corrected);
            } else if os_active && local.state != ServiceState::Running {
                self.connect();
            }
            false
        }
    }

    /// Report an app foreground/background transition.
    ///
    /// Allocates the next version and stores it as the single pending
    /// notification, superseding any unsent one (coalescing, not queuing:
    /// a foreground→background→foreground flurry only needs "foreground"
    /// delivered). Delivery is attempted immediately when the channel is
    /// usable; otherwise the channel is rebuilt and a fixed-interval retry
    /// loop runs until the version is delivered or superseded.
    pub fn notify_app_lifecycle(&self, foreground: bool) {
        let usable = {
            // allocate and store under one lock so concurrent callers
            // cannot park an older version over a newer one
            let mut inner = self.inner.lock().unwrap();
            let version = self.lifecycle_version.fetch_add(1, Ordering::SeqCst) + 1;
            inner.pending_lifecycle = Some(PendingLifecycle {
                foreground,
                version,
            });
            inner.link == LinkState::Connected
        };
        if !usable {
            self.rebind();
        }
        self.start_lifecycle_retry();
    }

    /// UI-resume fast path.
    ///
    /// Phase 1 (synchronous): overwrite the local observable state from the
    /// durable store, so observers never see a stale or loading value on
    /// resume. Phase 2 (async, best-effort): verify with one round-trip if
    /// connected, rebinding on failure; while a reconnect is in flight, do
    /// nothing that could interrupt it.
    pub fn instant_recovery(&self) {
        self.state_tx.send_replace(self.store.snapshot());

        match self.link_state() {
            LinkState::Connected => {
                if let Some(client) = self.weak.upgrade() {
                    tokio::spawn(async move {
                        match client.connector.query().await {
                            Ok(snapshot) => {
                                client.state_tx.send_replace(snapshot);
                            }
                            Err(e) => {
                                log::debug!("recovery verification failed: {}", e);
                                client.rebind();
                            }
                        }
                    });
                }
            }
            LinkState::Connecting => {}
            LinkState::Disconnected => self.connect(),
        }
    }

    /// Whether the callback stream has gone silent.
    ///
    /// A channel can stay bound at the OS level while the logical callback
    /// stream has died; callers poll this to decide when to force a
    /// store-based resync regardless of the client's own connection belief.
    pub fn is_callback_stale(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.last_event_at {
            Some(at) => at.elapsed() > self.timing.callback_stale_after(),
            None => true,
        }
    }

    /// Highest lifecycle version confirmed by the worker
    pub fn delivered_lifecycle(&self) -> u64 {
        self.inner.lock().unwrap().delivered_lifecycle
    }

    /// Request a hot reload of the active configuration.
    ///
    /// Transport failure maps to [`ReloadOutcome::IpcError`]; every other
    /// code comes from the worker.
    pub async fn hot_reload(&self, content: &str) -> ReloadOutcome {
        match self.connector.reload(content).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::debug!("reload request failed: {}", e);
                ReloadOutcome::IpcError
            }
        }
    }

    // internals

    fn spawn_bind(&self, epoch: u64) -> Option<JoinHandle<()>> {
        let client = self.weak.upgrade()?;
        Some(tokio::spawn(async move {
            client.bind_and_serve(epoch).await;
        }))
    }

    async fn bind_and_serve(self: Arc<Self>, epoch: u64) {
        match self.connector.subscribe().await {
            Ok(subscription) => self.run_subscription(subscription, epoch).await,
            Err(e) => {
                log::debug!("bind failed: {}", e);
                self.schedule_reconnect(epoch);
            }
        }
    }

    async fn run_subscription(self: Arc<Self>, mut subscription: Subscription, epoch: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch {
                return;
            }
            inner.link = LinkState::Connected;
            inner.reconnect_attempts = 0;
        }
        log::debug!("control channel connected");

        // a notification queued while the channel was down can go out now
        self.start_lifecycle_retry();

        loop {
            match subscription.next().await {
                Ok(Some(snapshot)) => {
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if inner.epoch != epoch {
                            return;
                        }
                        inner.last_event_at = Some(Instant::now());
                    }
                    self.state_tx.send_replace(snapshot);
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("callback stream error: {}", e);
                    break;
                }
            }
        }

        self.on_channel_closed(epoch).await;
    }

    /// Channel death handling: the equivalent of a binder death callback.
    async fn on_channel_closed(&self, epoch: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch {
                // explicitly disconnected in the meantime; nothing to heal
                return;
            }
            inner.epoch += 1;
            inner.link = LinkState::Disconnected;
            inner.subscription_task = None;
        }

        // Do not flash `Stopped` at observers over a transient IPC blip:
        // only regress local state when both the durable store and the OS
        // probe agree the tunnel is gone.
        let store_active = self.store.active();
        let os_active = self.probe.tunnel_active().await;
        if store_active || os_active {
            log::debug!("channel died but tunnel still up, keeping last state");
        } else {
            self.state_tx.send_replace(self.store.snapshot());
        }

        // death is rare and usually instantly recoverable
        self.connect();
    }

    /// Linear backoff for failed binds, capped at a maximum attempt count.
    ///
    /// Beyond the cap the client goes quiet; an explicit `connect` or
    /// `rebind` is required to resume trying. This bounds retry storms
    /// while keeping the system recoverable.
    fn schedule_reconnect(&self, epoch: u64) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch {
                return;
            }
            inner.reconnect_attempts += 1;
            if inner.reconnect_attempts > self.timing.max_reconnect_attempts {
                log::warn!(
                    "giving up after {} bind attempts",
                    inner.reconnect_attempts - 1
                );
                inner.link = LinkState::Disconnected;
                inner.subscription_task = None;
                return;
            }
            self.timing.reconnect_base_delay() * inner.reconnect_attempts
        };

        let Some(client) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let inner = client.inner.lock().unwrap();
                if inner.epoch != epoch || inner.link != LinkState::Connecting {
                    return;
                }
            }
            client.bind_and_serve(epoch).await;
        });
    }

    /// Single retry task delivering the pending lifecycle notification.
    ///
    /// The first attempt happens immediately; afterwards the task sleeps a
    /// fixed interval between attempts. Delivery uses one-shot connections,
    /// so it succeeds as soon as the worker is reachable even if the
    /// subscription is still rebuilding.
    fn start_lifecycle_retry(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.lifecycle_retry_running || inner.pending_lifecycle.is_none() {
                return;
            }
            inner.lifecycle_retry_running = true;
        }
        let Some(client) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let pending = {
                    let inner = client.inner.lock().unwrap();
                    inner.pending_lifecycle
                };
                let Some(pending) = pending else { break };

                client
                    .attempt_lifecycle_delivery(pending.foreground, pending.version)
                    .await;

                let still_pending = {
                    let inner = client.inner.lock().unwrap();
                    inner.pending_lifecycle.is_some()
                };
                if !still_pending {
                    break;
                }
                tokio::time::sleep(client.timing.lifecycle_retry_interval()).await;
            }

            let requeued = {
                let mut inner = client.inner.lock().unwrap();
                inner.lifecycle_retry_running = false;
                inner.pending_lifecycle.is_some()
            };
            // a new notification may have been queued while winding down
            if requeued {
                client.start_lifecycle_retry();
            }
        });
    }

    async fn attempt_lifecycle_delivery(&self, foreground: bool, version: u64) {
        match self.connector.notify_lifecycle(foreground, version).await {
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                // clear only if not superseded while the call was in flight
                if inner
                    .pending_lifecycle
                    .map(|p| p.version == version)
                    .unwrap_or(false)
                {
                    inner.pending_lifecycle = None;
                }
                if version > inner.delivered_lifecycle {
                    inner.delivered_lifecycle = version;
                }
                log::debug!("lifecycle v{} delivered", version);
            }
            Err(e) => {
                log::debug!("lifecycle v{} delivery failed: {}", version, e);
            }
        }
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().unwrap().subscription_task.take() {
            task.abort();
        }
    }
}
