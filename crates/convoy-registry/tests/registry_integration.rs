//! Registry integration tests.
//!
//! Run against the in-memory backend with a paused clock, so lease expiry
//! and the watch's ticker and reconnect backoff can be driven directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use convoy_core::{APP_ENV_VAR, ContainerInfo, PortMapping, ServiceConfig};
use convoy_registry::paths::{self, CONFIG_FIELD};
use convoy_registry::*;

fn registry(backend: &Arc<MemoryBackend>) -> ServiceRegistry {
    ServiceRegistry::new(backend.clone(), "web", "10.0.0.1")
}

fn container(app: &str) -> ContainerInfo {
    ContainerInfo {
        id: "4f3c2b1a09876543210f".to_string(),
        name: format!("{app}_1"),
        image: "reg.io/api:1".to_string(),
        image_id: "sha256:beef".to_string(),
        created: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        running: true,
        env: vec![format!("{APP_ENV_VAR}={app}")],
        ip_address: "172.17.0.3".to_string(),
        ports: vec![PortMapping {
            container_port: "80".to_string(),
            protocol: "tcp".to_string(),
            host_port: Some("49001".to_string()),
        }],
    }
}

/// Let spawned tasks run until they block.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn next_change(rx: &mut mpsc::Receiver<ConfigChange>) -> ServiceConfig {
    match timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(ConfigChange::Changed(config))) => config,
        other => panic!("expected a config change, got {other:?}"),
    }
}

async fn assert_quiet(rx: &mut mpsc::Receiver<ConfigChange>) {
    if let Ok(event) = timeout(Duration::from_secs(1), rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

// ── Pools ──────────────────────────────────────────────────────────

#[tokio::test]
async fn pool_with_apps_cannot_be_deleted() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend);
    reg.create_pool("web", "prod").await.unwrap();
    reg.create_app("api", "prod").await.unwrap();
    reg.create_app("worker", "prod").await.unwrap();
    reg.assign_app("api", "prod", "web").await.unwrap();
    reg.assign_app("worker", "prod", "web").await.unwrap();

    assert!(!reg.delete_pool("web", "prod").await.unwrap());
    assert!(reg.pool_exists("web", "prod").await.unwrap());
    assert_eq!(reg.list_assignments("prod", "web").await.unwrap().len(), 2);

    reg.unassign_app("api", "prod", "web").await.unwrap();
    assert!(!reg.delete_pool("web", "prod").await.unwrap());

    reg.unassign_app("worker", "prod", "web").await.unwrap();
    assert!(reg.list_assignments("prod", "web").await.unwrap().is_empty());
    assert!(reg.delete_pool("web", "prod").await.unwrap());
    assert!(!reg.pool_exists("web", "prod").await.unwrap());
    assert!(reg.list_pools("prod").await.unwrap().is_empty());
}

// ── Leases ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn registration_expires_without_refresh() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend).with_ttl(1);
    let config = ServiceConfig::new("api", "prod");

    reg.register_service("prod", &container("api"), &config)
        .await
        .unwrap();
    assert!(reg.is_registered("prod", &config).await.unwrap());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(!reg.is_registered("prod", &config).await.unwrap());
    assert!(reg.list_registrations("prod").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reregistration_refreshes_lease() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend).with_ttl(2);
    let config = ServiceConfig::new("api", "prod");

    reg.register_service("prod", &container("api"), &config)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1500)).await;
    reg.register_service("prod", &container("api"), &config)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1500)).await;

    assert!(reg.is_registered("prod", &config).await.unwrap());
}

// ── Change watch ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn watch_emits_one_event_per_version() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend).with_poll_interval(Duration::from_secs(3600));
    reg.create_app("api", "prod").await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handles = reg.watch(tx, stop_rx).await.unwrap();
    settle().await;

    // Seeding reports nothing.
    reg.check_for_changes_now();
    assert_quiet(&mut rx).await;

    // A write publishes, and the subscription triggers the check.
    reg.set_env_var("api", "prod", "LOG_LEVEL", "debug")
        .await
        .unwrap();
    let changed = next_change(&mut rx).await;
    assert_eq!(changed.name, "api");
    assert_eq!(changed.env_get("LOG_LEVEL"), Some("debug"));

    // No id movement, no event.
    reg.check_for_changes_now();
    assert_quiet(&mut rx).await;

    handles.abort();
}

#[tokio::test(start_paused = true)]
async fn write_right_after_watch_starts_is_reported() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend).with_poll_interval(Duration::from_secs(3600));
    reg.create_app("api", "prod").await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handles = reg.watch(tx, stop_rx).await.unwrap();

    // No yield: the watch tasks have not run yet.
    reg.set_env_var("api", "prod", "LOG_LEVEL", "debug")
        .await
        .unwrap();
    reg.check_for_changes_now();

    let changed = next_change(&mut rx).await;
    assert_eq!(changed.env_get("LOG_LEVEL"), Some("debug"));
    assert_quiet(&mut rx).await;

    handles.abort();
}

#[tokio::test(start_paused = true)]
async fn each_restart_is_one_event() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend).with_poll_interval(Duration::from_secs(3600));
    reg.create_app("api", "prod").await.unwrap();
    let before = reg.get_app("api", "prod").await.unwrap().unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handles = reg.watch(tx, stop_rx).await.unwrap();
    settle().await;

    let mut last_id = before.id();
    for _ in 0..2 {
        reg.notify_restart("api", "prod").await.unwrap();
        let changed = next_change(&mut rx).await;
        assert!(changed.id() > last_id);
        last_id = changed.id();

        // Same content, new id.
        assert_eq!(changed.env(), before.env());
        assert_eq!(changed.version(), before.version());
        assert_eq!(changed.ports(), before.ports());
    }
    assert_quiet(&mut rx).await;

    handles.abort();
}

#[tokio::test(start_paused = true)]
async fn ticker_picks_up_unannounced_writes() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend);
    reg.create_app("api", "prod").await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handles = reg.watch(tx, stop_rx).await.unwrap();
    settle().await;

    // Write a new version straight to the backend, without publishing.
    let mut config = reg.get_app("api", "prod").await.unwrap().unwrap();
    let id = config.advance_id(0);
    backend
        .set(
            &paths::app_key("prod", "api"),
            CONFIG_FIELD,
            &serde_json::to_string(&config).unwrap(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;
    let changed = next_change(&mut rx).await;
    assert_eq!(changed.id(), id);

    handles.abort();
}

#[tokio::test(start_paused = true)]
async fn stop_signal_halts_ticker() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend);

    let (tx, _rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    let WatchHandles {
        poll,
        ticker,
        subscriber,
    } = reg.watch(tx, stop_rx).await.unwrap();

    stop_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), ticker)
        .await
        .expect("ticker should stop")
        .unwrap();

    // The poll loop and subscriber keep running until aborted.
    assert!(!poll.is_finished());
    assert!(!subscriber.is_finished());
    poll.abort();
    subscriber.abort();
}

#[tokio::test(start_paused = true)]
async fn subscriber_reconnects_after_backoff() {
    let backend = Arc::new(MemoryBackend::new());
    let reg = registry(&backend).with_poll_interval(Duration::from_secs(3600));
    reg.create_app("api", "prod").await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handles = reg.watch(tx, stop_rx).await.unwrap();
    settle().await;

    backend.disconnect_subscribers().await;
    // Past the 5 s reconnect backoff.
    tokio::time::sleep(Duration::from_secs(6)).await;

    reg.notify_restart("api", "prod").await.unwrap();
    let changed = next_change(&mut rx).await;
    assert_eq!(changed.name, "api");

    handles.abort();
}
