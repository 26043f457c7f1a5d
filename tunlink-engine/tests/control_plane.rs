//! End-to-end tests exercising the worker and UI sides over a real socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use tunlink_engine::{
    Config, ControlConnector, ControlServer, NoTunnelProbe, NoopKernel, ReloadOutcome,
    RemoteClient, ServiceState, StateHub, StateStore, StateUpdate,
};

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.control.socket_path = dir.join("ctl.sock");
    config.control.request_timeout_ms = 2000;
    config.store.dir = dir.to_path_buf();
    config.timing.broadcast_min_interval_ms = 30;
    config.timing.reconnect_base_delay_ms = 50;
    config.timing.max_reconnect_attempts = 5;
    config.timing.lifecycle_retry_interval_ms = 50;
    config
}

/// Spin up a worker: shared store, hub, control server on the test socket.
async fn start_worker(config: &Config) -> (Arc<StateHub>, Arc<StateStore>, JoinHandle<()>) {
    let store = Arc::new(StateStore::new(&config.store.dir).unwrap());
    let hub = StateHub::new(Arc::clone(&store), Arc::new(NoopKernel), &config.timing);
    let server = ControlServer::new(&config.control.socket_path, Arc::clone(&hub));
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    wait_for(|| config.control.socket_path.exists()).await;
    (hub, store, task)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

fn ui_client(config: &Config) -> Arc<RemoteClient> {
    let store = Arc::new(StateStore::new(&config.store.dir).unwrap());
    RemoteClient::new(config, store, Arc::new(NoTunnelProbe))
}

#[tokio::test]
async fn subscription_receives_current_state_without_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (hub, _store, server) = start_worker(&config).await;

    hub.update(
        StateUpdate::new()
            .state(ServiceState::Running)
            .active_label("node-A"),
    )
    .await;

    let connector = ControlConnector::new(&config.control.socket_path);
    let mut subscription = connector.subscribe().await.unwrap();

    // the registration snapshot arrives before any broadcast tick
    let first = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.state, ServiceState::Running);
    assert_eq!(first.active_label, "node-A");

    server.abort();
}

#[tokio::test]
async fn client_mirror_follows_worker_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (hub, _store, server) = start_worker(&config).await;

    let client = ui_client(&config);
    let mut observer = client.observe();
    client.connect();
    wait_for(|| client.is_connected()).await;

    hub.update(
        StateUpdate::new()
            .state(ServiceState::Running)
            .active_label("node-B"),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            observer.changed().await.unwrap();
            let snapshot = observer.borrow().clone();
            if snapshot.state == ServiceState::Running && snapshot.active_label == "node-B" {
                break;
            }
        }
    })
    .await
    .unwrap();

    client.disconnect();
    server.abort();
}

#[tokio::test]
async fn lifecycle_queued_while_worker_down_is_delivered_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    // no worker yet: the notification must queue, not vanish
    let client = ui_client(&config);
    client.notify_app_lifecycle(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (hub, _store, server) = start_worker(&config).await;
    wait_for_async(|| {
        let hub = Arc::clone(&hub);
        async move { hub.app_foreground().await == Some(true) }
    })
    .await;

    // let any spurious retries play out, then check the hub saw one apply
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.lifecycle_transitions(), 1);

    client.disconnect();
    server.abort();
}

#[tokio::test]
async fn rapid_lifecycle_flurry_collapses_to_latest() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let client = ui_client(&config);
    client.notify_app_lifecycle(true);
    client.notify_app_lifecycle(false);
    client.notify_app_lifecycle(true);
    client.notify_app_lifecycle(false);

    let (hub, _store, server) = start_worker(&config).await;
    wait_for_async(|| {
        let hub = Arc::clone(&hub);
        async move { hub.app_foreground().await.is_some() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // only the final signal was worth delivering
    assert_eq!(hub.app_foreground().await, Some(false));
    assert_eq!(hub.lifecycle_transitions(), 1);

    client.disconnect();
    server.abort();
}

#[tokio::test]
async fn instant_recovery_restores_from_store_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let store = Arc::new(StateStore::new(&config.store.dir).unwrap());
    store
        .apply(
            &StateUpdate::new()
                .state(ServiceState::Running)
                .active_label("node-C"),
        )
        .unwrap();

    // worker is gone; recovery must still produce a usable state at once
    let client = RemoteClient::new(&config, store, Arc::new(NoTunnelProbe));
    client.instant_recovery();

    let snapshot = client.current();
    assert_eq!(snapshot.state, ServiceState::Running);
    assert_eq!(snapshot.active_label, "node-C");

    client.disconnect();
}

#[tokio::test]
async fn query_and_sync_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (hub, _store, server) = start_worker(&config).await;
    hub.update(
        StateUpdate::new()
            .state(ServiceState::Running)
            .active_label("node-D"),
    )
    .await;

    let client = ui_client(&config);
    client.connect();
    wait_for(|| client.is_connected()).await;

    assert!(client.query_and_sync_state().await);
    assert_eq!(client.current().active_label, "node-D");

    client.disconnect();
    server.abort();
}

#[tokio::test]
async fn reload_outcomes_across_worker_states() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (hub, _store, server) = start_worker(&config).await;
    let client = ui_client(&config);

    assert_eq!(client.hot_reload("{}").await, ReloadOutcome::VpnNotRunning);

    hub.update(StateUpdate::new().state(ServiceState::Running))
        .await;
    assert_eq!(client.hot_reload("{}").await, ReloadOutcome::Success);

    server.abort();
}

#[tokio::test]
async fn reload_with_no_worker_is_an_ipc_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let client = ui_client(&config);
    assert_eq!(client.hot_reload("{}").await, ReloadOutcome::IpcError);
}

async fn wait_for_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
