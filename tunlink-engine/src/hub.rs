//! State hub: single writer of canonical state and rate-limited broadcaster
//!
//! The hub runs inside the worker process. It owns the one canonical
//! [`StateSnapshot`], persists every transition into the durable store
//! before a broadcast can be observed, and fans changes out to registered
//! callbacks through a coalescing drain loop with a minimum inter-broadcast
//! interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::config::TimingConfig;
use crate::control::ReloadOutcome;
use crate::error::Result;
use crate::kernel::ProxyKernel;
use crate::state::{ServiceState, StateSnapshot, StateUpdate};
use crate::store::StateStore;

/// Callback interface pushed from the hub to each registrant.
///
/// Delivery failures are isolated per listener: a failing callback is
/// dropped from the registry and never prevents delivery to the rest.
#[async_trait::async_trait]
pub trait StateCallback: Send + Sync {
    /// Handle a new canonical snapshot
    async fn on_state_changed(&self, snapshot: &StateSnapshot) -> Result<()>;
}

/// Owner of the canonical service state.
pub struct StateHub {
    weak: Weak<StateHub>,
    store: Arc<StateStore>,
    kernel: Arc<dyn ProxyKernel>,

    /// Canonical snapshot; mutated only through [`StateHub::update`]
    snapshot: RwLock<StateSnapshot>,

    /// Registered callbacks, keyed by registration id
    registry: Mutex<HashMap<u64, Arc<dyn StateCallback>>>,
    next_callback_id: AtomicU64,

    /// Set when a broadcast is owed; cleared by the drain loop
    broadcast_pending: AtomicBool,
    /// Set while exactly one drain task is alive
    broadcast_in_flight: AtomicBool,
    /// Completion time of the last broadcast round
    last_broadcast: StdMutex<Option<Instant>>,
    min_interval: Duration,

    /// Latest applied app lifecycle signal, with its version
    lifecycle: Mutex<Option<(bool, u64)>>,
    lifecycle_transitions: AtomicU64,
}

impl StateHub {
    /// Create a hub starting from `Stopped` and seed the durable store.
    ///
    /// Seeding matters after a crash: a stale `active = true` left behind
    /// by a dead worker must not survive the worker's restart.
    pub fn new(
        store: Arc<StateStore>,
        kernel: Arc<dyn ProxyKernel>,
        timing: &TimingConfig,
    ) -> Arc<Self> {
        let hub = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            store,
            kernel,
            snapshot: RwLock::new(StateSnapshot::default()),
            registry: Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(1),
            broadcast_pending: AtomicBool::new(false),
            broadcast_in_flight: AtomicBool::new(false),
            last_broadcast: StdMutex::new(None),
            min_interval: timing.broadcast_min_interval(),
            lifecycle: Mutex::new(None),
            lifecycle_transitions: AtomicU64::new(0),
        });
        if let Err(e) = hub.store.write_snapshot(&StateSnapshot::default()) {
            log::warn!("failed to seed durable store: {}", e);
        }
        hub
    }

    /// Current canonical snapshot
    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Apply a partial update to the canonical state.
    ///
    /// The full just-mutated snapshot is written to the durable store while
    /// the write lock is still held, so concurrent updates cannot interleave
    /// the persist step and the store always holds exactly what some
    /// canonical snapshot contained. The hub is the sole writer of the state
    /// file, which keeps the full-document write equivalent to a partial one.
    /// This is a local operation and cannot fail; store write errors are
    /// logged and the in-memory state remains authoritative.
    pub async fn update(&self, update: StateUpdate) {
        if update.is_empty() {
            return;
        }
        {
            let mut snapshot = self.snapshot.write().await;
            update.apply_to(&mut snapshot);
            if let Err(e) = self.store.write_snapshot(&snapshot) {
                log::warn!("durable store write failed: {}", e);
            }
        }
        self.broadcast_pending.store(true, Ordering::SeqCst);
        self.schedule_broadcast();
    }

    /// Register a callback and synchronously deliver the current snapshot.
    ///
    /// A freshly-bound client must never wait for the next broadcast tick
    /// to learn current state. A registrant that fails this first delivery
    /// is not added to the registry.
    pub async fn register_callback(&self, callback: Arc<dyn StateCallback>) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.snapshot.read().await.clone();
        if let Err(e) = callback.on_state_changed(&snapshot).await {
            log::debug!("initial delivery to callback {} failed: {}", id, e);
            return id;
        }
        self.registry.lock().await.insert(id, callback);
        log::debug!("callback {} registered", id);
        id
    }

    /// Remove a callback; safe to call on an already-removed id.
    pub async fn unregister_callback(&self, id: u64) {
        if self.registry.lock().await.remove(&id).is_some() {
            log::debug!("callback {} unregistered", id);
        }
    }

    /// Number of currently registered callbacks
    pub async fn callback_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Record an app foreground/background transition.
    ///
    /// Versions are assigned by the client; only the highest version is
    /// meaningful, so replays of an already-applied or superseded version
    /// are ignored. This is what makes client-side delivery retries
    /// harmless.
    pub async fn notify_lifecycle(&self, foreground: bool, version: u64) {
        let mut guard = self.lifecycle.lock().await;
        if let Some((_, applied)) = *guard {
            if version <= applied {
                log::debug!("ignoring lifecycle version {} (applied {})", version, applied);
                return;
            }
        }
        *guard = Some((foreground, version));
        self.lifecycle_transitions.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "app moved to {} (v{})",
            if foreground { "foreground" } else { "background" },
            version
        );
    }

    /// Latest applied lifecycle signal
    pub async fn app_foreground(&self) -> Option<bool> {
        self.lifecycle.lock().await.map(|(foreground, _)| foreground)
    }

    /// Number of lifecycle transitions actually applied (replays excluded)
    pub fn lifecycle_transitions(&self) -> u64 {
        self.lifecycle_transitions.load(Ordering::Relaxed)
    }

    /// Hot-reload the active configuration through the kernel.
    ///
    /// Fails fast when the tunnel is not running; the kernel is not
    /// consulted at all in that case. The hub never retries; retry policy
    /// belongs to the caller.
    pub async fn hot_reload(&self, content: &str) -> ReloadOutcome {
        if self.snapshot.read().await.state != ServiceState::Running {
            return ReloadOutcome::VpnNotRunning;
        }
        match self.kernel.start_or_reload(content).await {
            Ok(true) => ReloadOutcome::Success,
            Ok(false) => ReloadOutcome::KernelError,
            Err(e) => {
                log::warn!("kernel reload failed: {}", e);
                match e {
                    crate::error::Error::Kernel(_) => ReloadOutcome::KernelError,
                    _ => ReloadOutcome::UnknownError,
                }
            }
        }
    }

    /// Spawn the drain task unless one is already alive.
    fn schedule_broadcast(&self) {
        if self.broadcast_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(hub) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            hub.drain_broadcasts().await;
        });
    }

    /// Self-rescheduling drain loop.
    ///
    /// One round: wait out the remainder of the minimum interval, clear the
    /// pending flag, copy the snapshot once, deliver to every registered
    /// callback. Each delivery runs in its own task so a panicking listener
    /// is contained and evicted instead of unwinding the drain loop with the
    /// in-flight flag still set. If updates arrived while broadcasting, loop
    /// immediately; otherwise release the in-flight flag and re-check so a
    /// concurrent `update` is never lost between the check and the release.
    async fn drain_broadcasts(&self) {
        loop {
            loop {
                let remaining = {
                    let last = lock_unpoisoned(&self.last_broadcast);
                    last.and_then(|t| self.min_interval.checked_sub(t.elapsed()))
                };
                match remaining {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => break,
                }
            }

            self.broadcast_pending.store(false, Ordering::SeqCst);
            let snapshot = self.snapshot.read().await.clone();
            *lock_unpoisoned(&self.last_broadcast) = Some(Instant::now());

            let callbacks: Vec<(u64, Arc<dyn StateCallback>)> = {
                let registry = self.registry.lock().await;
                registry
                    .iter()
                    .map(|(id, cb)| (*id, Arc::clone(cb)))
                    .collect()
            };

            let mut dead = Vec::new();
            for (id, callback) in callbacks {
                let payload = snapshot.clone();
                let delivery =
                    tokio::spawn(async move { callback.on_state_changed(&payload).await });
                match delivery.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::debug!("dropping callback {}: {}", id, e);
                        dead.push(id);
                    }
                    Err(e) => {
                        log::warn!("dropping callback {}: delivery panicked: {}", id, e);
                        dead.push(id);
                    }
                }
            }
            if !dead.is_empty() {
                let mut registry = self.registry.lock().await;
                for id in dead {
                    registry.remove(&id);
                }
            }

            if self.broadcast_pending.load(Ordering::SeqCst) {
                continue;
            }
            self.broadcast_in_flight.store(false, Ordering::SeqCst);
            if self.broadcast_pending.load(Ordering::SeqCst)
                && !self.broadcast_in_flight.swap(true, Ordering::SeqCst)
            {
                continue;
            }
            return;
        }
    }
}

/// The guarded value is a plain timestamp, so a lock poisoned by an
/// unwinding holder is still safe to keep using.
fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kernel::NoopKernel;
    use std::sync::atomic::AtomicUsize;

    struct RecordingCallback {
        snapshots: StdMutex<Vec<StateSnapshot>>,
    }

    impl RecordingCallback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                snapshots: StdMutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<StateSnapshot> {
            self.snapshots.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl StateCallback for RecordingCallback {
        async fn on_state_changed(&self, snapshot: &StateSnapshot) -> Result<()> {
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    struct FailingCallback;

    #[async_trait::async_trait]
    impl StateCallback for FailingCallback {
        async fn on_state_changed(&self, _snapshot: &StateSnapshot) -> Result<()> {
            Err(Error::Endpoint("listener gone".into()))
        }
    }

    struct CountingKernel {
        calls: AtomicUsize,
        accept: bool,
    }

    impl CountingKernel {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                accept,
            })
        }
    }

    #[async_trait::async_trait]
    impl ProxyKernel for CountingKernel {
        async fn start_or_reload(&self, _config: &str) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.accept)
        }
    }

    fn test_timing() -> TimingConfig {
        TimingConfig {
            broadcast_min_interval_ms: 30,
            ..TimingConfig::default()
        }
    }

    fn test_hub(kernel: Arc<dyn ProxyKernel>) -> (tempfile::TempDir, Arc<StateHub>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let hub = StateHub::new(store, kernel, &test_timing());
        (dir, hub)
    }

    #[tokio::test]
    async fn listener_converges_to_final_state() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));
        let callback = RecordingCallback::new();
        hub.register_callback(callback.clone()).await;

        hub.update(StateUpdate::new().state(ServiceState::Starting))
            .await;
        hub.update(
            StateUpdate::new()
                .state(ServiceState::Running)
                .active_label("node-A"),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = callback.seen();
        // registration snapshot plus at least one broadcast
        assert!(seen.len() >= 2);
        assert_eq!(
            *seen.last().unwrap(),
            StateSnapshot {
                state: ServiceState::Running,
                active_label: "node-A".into(),
                last_error: String::new(),
                manually_stopped: false,
            }
        );
    }

    #[tokio::test]
    async fn registration_delivers_current_state_immediately() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));
        hub.update(StateUpdate::new().state(ServiceState::Running))
            .await;

        let callback = RecordingCallback::new();
        hub.register_callback(callback.clone()).await;

        // no broadcast tick needed; the registration itself delivered
        let seen = callback.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].state, ServiceState::Running);
    }

    #[tokio::test]
    async fn burst_is_coalesced() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));
        let callback = RecordingCallback::new();
        hub.register_callback(callback.clone()).await;
        let initial = callback.seen().len();

        for i in 0..20 {
            hub.update(StateUpdate::new().active_label(format!("node-{}", i)))
                .await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;

        let broadcasts = callback.seen().len() - initial;
        assert!(broadcasts >= 1);
        assert!(broadcasts < 20, "burst produced {} broadcasts", broadcasts);
        assert_eq!(callback.seen().last().unwrap().active_label, "node-19");
    }

    #[tokio::test]
    async fn failing_listener_does_not_starve_others() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));
        let healthy = RecordingCallback::new();
        hub.register_callback(healthy.clone()).await;
        // bypass the first-delivery filter by inserting directly
        hub.registry
            .lock()
            .await
            .insert(999, Arc::new(FailingCallback));

        hub.update(StateUpdate::new().state(ServiceState::Running))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            healthy.seen().last().unwrap().state,
            ServiceState::Running
        );
        // the failing listener was evicted
        assert_eq!(hub.callback_count().await, 1);
    }

    #[tokio::test]
    async fn reload_while_stopped_skips_kernel() {
        let kernel = CountingKernel::new(true);
        let (_dir, hub) = test_hub(kernel.clone());

        let outcome = hub.hot_reload("{}").await;

        assert_eq!(outcome, ReloadOutcome::VpnNotRunning);
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reload_while_running_reaches_kernel() {
        let kernel = CountingKernel::new(true);
        let (_dir, hub) = test_hub(kernel.clone());
        hub.update(StateUpdate::new().state(ServiceState::Running))
            .await;

        assert_eq!(hub.hot_reload("{}").await, ReloadOutcome::Success);
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn kernel_rejection_maps_to_kernel_error() {
        let kernel = CountingKernel::new(false);
        let (_dir, hub) = test_hub(kernel.clone());
        hub.update(StateUpdate::new().state(ServiceState::Running))
            .await;

        assert_eq!(hub.hot_reload("{}").await, ReloadOutcome::KernelError);
    }

    #[tokio::test]
    async fn lifecycle_versions_are_latest_wins() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));

        hub.notify_lifecycle(true, 1).await;
        hub.notify_lifecycle(false, 2).await;
        // a late retry of version 1 must not regress the state
        hub.notify_lifecycle(true, 1).await;

        assert_eq!(hub.app_foreground().await, Some(false));
        assert_eq!(hub.lifecycle_transitions(), 2);
    }

    #[tokio::test]
    async fn store_written_before_broadcast_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let hub = StateHub::new(Arc::clone(&store), Arc::new(NoopKernel), &test_timing());

        hub.update(
            StateUpdate::new()
                .state(ServiceState::Running)
                .active_label("node-A"),
        )
        .await;

        // durable truth is current even before any broadcast tick
        assert!(store.active());
        assert_eq!(store.active_label(), "node-A");
    }

    #[tokio::test]
    async fn unregister_unknown_id_is_safe() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));
        hub.unregister_callback(42).await;
        hub.unregister_callback(42).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_keep_store_and_snapshot_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let hub = StateHub::new(Arc::clone(&store), Arc::new(NoopKernel), &test_timing());
        hub.update(StateUpdate::new().state(ServiceState::Running))
            .await;

        for round in 0..50 {
            let label_writer = {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    hub.update(StateUpdate::new().active_label(format!("node-{}", round)))
                        .await;
                })
            };
            let error_writer = {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    hub.update(StateUpdate::new().last_error(format!("err-{}", round)))
                        .await;
                })
            };
            label_writer.await.unwrap();
            error_writer.await.unwrap();

            assert_eq!(
                store.snapshot(),
                hub.snapshot().await,
                "round {}: durable store diverged from canonical snapshot",
                round
            );
        }
    }

    struct PanickingCallback;

    #[async_trait::async_trait]
    impl StateCallback for PanickingCallback {
        async fn on_state_changed(&self, _snapshot: &StateSnapshot) -> Result<()> {
            panic!("listener exploded");
        }
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stall_broadcasts() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));
        let healthy = RecordingCallback::new();
        hub.register_callback(healthy.clone()).await;
        // bypass the first-delivery filter by inserting directly
        hub.registry
            .lock()
            .await
            .insert(999, Arc::new(PanickingCallback));

        hub.update(StateUpdate::new().state(ServiceState::Running))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // the panicking listener was evicted, the healthy one delivered to
        assert_eq!(hub.callback_count().await, 1);
        assert_eq!(healthy.seen().last().unwrap().state, ServiceState::Running);

        // and later updates still flow
        hub.update(StateUpdate::new().active_label("after"))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(healthy.seen().last().unwrap().active_label, "after");
    }

    struct TimedCallback {
        at: StdMutex<Vec<Instant>>,
    }

    #[async_trait::async_trait]
    impl StateCallback for TimedCallback {
        async fn on_state_changed(&self, _snapshot: &StateSnapshot) -> Result<()> {
            self.at.lock().unwrap().push(Instant::now());
            Ok(())
        }
    }

    #[tokio::test]
    async fn deliveries_respect_minimum_interval() {
        let (_dir, hub) = test_hub(Arc::new(NoopKernel));
        let callback = Arc::new(TimedCallback {
            at: StdMutex::new(Vec::new()),
        });
        hub.register_callback(callback.clone()).await;

        // keep updates flowing long enough for several throttled rounds
        for i in 0..12 {
            hub.update(StateUpdate::new().active_label(format!("node-{}", i)))
                .await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let at = callback.at.lock().unwrap().clone();
        // the first entry is the registration delivery, which is exempt
        let broadcasts = &at[1..];
        assert!(broadcasts.len() >= 2);

        // timestamps are taken a hair after the throttle mark; allow the
        // delivery itself a little skew
        let floor = test_timing().broadcast_min_interval() - Duration::from_millis(5);
        for pair in broadcasts.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= floor, "deliveries only {:?} apart", gap);
        }
    }
}
