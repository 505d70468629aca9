//! End-to-end convergence over the in-memory registry and scripted engine.
//!
//! Walks one app through its lifecycle: deploy, start, register, upgrade,
//! reap, and lease expiry once the host stops refreshing.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use convoy_registry::{ConfigChange, MemoryBackend, ServiceRegistry};
use convoy_runtime::mock::MockEngine;
use convoy_runtime::{AuthConfig, ServiceRuntime};
use tokio::sync::{mpsc, watch};

const ENV: &str = "prod";

fn setup() -> (Arc<MockEngine>, Arc<ServiceRegistry>, ServiceRuntime) {
    let engine = Arc::new(MockEngine::new());
    let registry = Arc::new(
        ServiceRegistry::new(Arc::new(MemoryBackend::new()), "web", "10.0.0.7").with_ttl(5),
    );
    let runtime = ServiceRuntime::new(engine.clone(), registry.clone(), ENV, "172.17.0.1")
        .with_auth_config(AuthConfig::default());
    (engine, registry, runtime)
}

#[tokio::test(start_paused = true)]
async fn app_lifecycle() {
    let (engine, registry, runtime) = setup();
    engine.add_image("reg.io/api:1", &["8080/tcp"]);
    engine.add_image("reg.io/api:2", &["8080/tcp"]);

    registry.create_app("api", ENV).await.unwrap();
    registry.create_pool("web", ENV).await.unwrap();
    registry.assign_app("api", ENV, "web").await.unwrap();
    registry.set_env_var("api", ENV, "CONVOY_PORT", "8080").await.unwrap();
    assert!(runtime.deploy("api", "reg.io/api:1").await.unwrap());

    // v1 up and registered.
    let v1 = registry.get_app("api", ENV).await.unwrap().unwrap();
    let (changed, first) = runtime.start_if_not_running(&v1).await.unwrap();
    assert!(changed);
    let registered = runtime.register_running().await.unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].external_ip, "10.0.0.7");
    assert_eq!(registered[0].internal_port, "8080");
    assert_eq!(registered[0].port, "8080");

    // Upgrade: v2 starts alongside v1.
    assert!(runtime.deploy("api", "reg.io/api:2").await.unwrap());
    let v2 = registry.get_app("api", ENV).await.unwrap().unwrap();
    let (changed, second) = runtime.start_if_not_running(&v2).await.unwrap();
    assert!(changed);
    assert_ne!(second.id, first.id);

    let report = runtime
        .stop_all_but_latest(Duration::from_secs(60))
        .await
        .unwrap();
    // v1 is too young to reap.
    assert!(report.stopped.is_empty());
    assert!(engine.container(&first.id).unwrap().running);

    let aged = engine.add_container(
        "api_1",
        "reg.io/api:0",
        DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
        true,
    );
    let report = runtime
        .stop_all_but_latest(Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(report.stopped, vec![aged]);
    assert!(engine.container(&first.id).is_some());

    let registered = runtime.register_running().await.unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].container_id, second.id);

    // No refresh: the lease lapses.
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!registry.is_registered(ENV, &v2).await.unwrap());
    assert!(registry.list_registrations(ENV).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deploy_is_seen_by_the_watch() {
    let (engine, registry, runtime) = setup();
    engine.add_image("reg.io/api:1", &["8080/tcp"]);
    registry.create_app("api", ENV).await.unwrap();

    let (changes_tx, mut changes_rx) = mpsc::channel(8);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handles = registry.watch(changes_tx, stop_rx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    runtime.deploy("api", "reg.io/api:1").await.unwrap();

    let change = tokio::time::timeout(Duration::from_secs(1), changes_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match change {
        ConfigChange::Changed(config) => {
            assert_eq!(config.name, "api");
            assert_eq!(config.version(), "reg.io/api:1");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    handles.abort();
}
