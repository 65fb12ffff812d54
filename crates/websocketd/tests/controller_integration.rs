//! Integration tests for the controller startup sequence.

mod common;

use std::time::Duration;

use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

use common::{tenant, test_config, token, ScriptedTokenService};
use websocketd::bus::{BusConnector, MemoryBus};
use websocketd::config::{Config, ProcessWorkers};
use websocketd::controller::Controller;

/// Maximum time to wait for the controller to reach a state
const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

fn config_with_credentials() -> Config {
    let mut config = test_config();
    config.auth.service_id = Some("accent-websocketd".to_string());
    config.auth.service_key = Some("secret".to_string());
    config
}

#[tokio::test]
async fn test_controller_starts_and_discovers_master_tenant() {
    let bus = MemoryBus::new();
    let tokens = ScriptedTokenService::new();
    tokens.set_service_token(token("service-token", Some(tenant()), &[]));

    let shutdown = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let controller = Controller::new(config_with_credentials(), shutdown.clone())
        .unwrap()
        .with_bus(BusConnector::Memory(bus.clone()))
        .with_token_service(tokens.clone())
        .notify_ready(ready_tx);
    let master_tenant = controller.master_tenant();

    let handle = tokio::spawn(controller.run());
    let addr = tokio::time::timeout(WAIT_TIMEOUT, ready_rx)
        .await
        .expect("controller ready in time")
        .expect("ready address");

    assert!(bus.is_initialized());

    let start = tokio::time::Instant::now();
    while master_tenant.get().is_none() && start.elapsed() < WAIT_TIMEOUT {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(master_tenant.get(), Some(tenant()));
    assert!(tokens.created_count() >= 1);

    // Workers accept connections
    let (ws, _) = connect_async(format!("ws://{addr}/")).await.expect("connect");
    drop(ws);

    shutdown.cancel();
    let result = tokio::time::timeout(WAIT_TIMEOUT, handle)
        .await
        .expect("controller stopped in time")
        .expect("controller task");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_controller_without_credentials_leaves_master_unknown() {
    let bus = MemoryBus::new();
    let tokens = ScriptedTokenService::new();

    let shutdown = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let controller = Controller::new(test_config(), shutdown.clone())
        .unwrap()
        .with_bus(BusConnector::Memory(bus))
        .with_token_service(tokens.clone())
        .notify_ready(ready_tx);
    let master_tenant = controller.master_tenant();

    let handle = tokio::spawn(controller.run());
    tokio::time::timeout(WAIT_TIMEOUT, ready_rx)
        .await
        .expect("controller ready in time")
        .expect("ready address");

    assert_eq!(master_tenant.get(), None);
    assert_eq!(tokens.created_count(), 0);

    shutdown.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_shutdown_before_bus_initialization() {
    let bus = MemoryBus::new();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let (ready_tx, ready_rx) = oneshot::channel();
    let controller = Controller::new(config_with_credentials(), shutdown)
        .unwrap()
        .with_bus(BusConnector::Memory(bus.clone()))
        .with_token_service(ScriptedTokenService::new())
        .notify_ready(ready_tx);

    assert!(controller.run().await.is_ok());
    assert!(!bus.is_initialized());
    // Workers never started
    assert!(ready_rx.await.is_err());
}

#[tokio::test]
async fn test_invalid_worker_count_fails_before_start() {
    let bus = MemoryBus::new();
    let mut config = test_config();
    config.process_workers = ProcessWorkers::Named("lots".to_string());

    let controller = Controller::new(config, CancellationToken::new())
        .unwrap()
        .with_bus(BusConnector::Memory(bus.clone()));

    assert!(controller.run().await.is_err());
    assert!(!bus.is_initialized());
}
