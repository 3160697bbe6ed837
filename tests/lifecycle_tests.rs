mod common;

use cap_relay_node::connection::{ConnectionHandle, Inbound, ReadFailure};
use cap_relay_node::error::{HandshakeError, ShutdownError};
use cap_relay_node::identity::{CapId, PeerId};
use cap_relay_node::lifecycle::{LifecycleConfig, LifecycleManager, ALREADY_CONNECTED, GREETING};
use cap_relay_node::registry::ConnectionRegistry;
use cap_relay_node::router::Router;
use common::{address, channel_reader, signed, signing_key, CountingVerifier, MockConnection};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn config() -> LifecycleConfig {
    LifecycleConfig {
        handshake_timeout: Duration::from_millis(100),
        ping_interval: Duration::from_millis(50),
        stale_after: None,
        shutdown_timeout: Duration::from_millis(500),
    }
}

fn manager_with(config: LifecycleConfig) -> Arc<LifecycleManager> {
    let router = Router::new(ConnectionRegistry::new(), CountingVerifier::new(), CapId::generate());
    Arc::new(LifecycleManager::new(Arc::new(router), config))
}

fn manager() -> Arc<LifecycleManager> {
    manager_with(config())
}

fn identity(id: PeerId, name: &str) -> Inbound {
    Inbound::Text(format!(r#"{{"id":"{}","name":"{}"}}"#, id, name))
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_handshake_welcomes_and_registers() {
    let manager = manager();
    let conn = MockConnection::new();
    let handle: ConnectionHandle = conn.clone();
    let (tx, mut reader) = channel_reader();
    let id = PeerId::from_bytes([1; 20]);

    tx.send(Ok(identity(id, "alice"))).unwrap();
    let record = manager.handshake(&handle, &mut reader).await.unwrap();

    assert_eq!(record.id, id);
    assert_eq!(conn.sent(), vec![GREETING.to_string(), "WELCOME alice".to_string()]);
    assert!(manager.registry().retrieve(&id).await.is_ok());
}

#[tokio::test]
async fn test_failed_pong_during_handshake_is_not_fatal() {
    let manager = manager();
    let conn = MockConnection::new();
    conn.fail_pongs.store(true, Ordering::SeqCst);
    let handle: ConnectionHandle = conn.clone();
    let (tx, mut reader) = channel_reader();
    let id = PeerId::from_bytes([4; 20]);

    tx.send(Ok(Inbound::Ping)).unwrap();
    tx.send(Ok(identity(id, "dave"))).unwrap();
    let record = manager.handshake(&handle, &mut reader).await.unwrap();

    assert_eq!(record.id, id);
    assert_eq!(conn.pongs.load(Ordering::SeqCst), 0);
    assert_eq!(conn.sent(), vec![GREETING.to_string(), "WELCOME dave".to_string()]);
}

#[tokio::test]
async fn test_handshake_times_out_without_identity() {
    let manager = manager();
    let conn = MockConnection::new();
    let (_tx, reader) = channel_reader();

    let result = manager.serve_connection(conn.clone(), reader).await;

    assert!(matches!(result, Err(HandshakeError::Timeout { timeout_ms: 100 })));
    assert_eq!(conn.sent(), vec![GREETING.to_string()]);
    assert!(conn.close_count() >= 1);
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn test_handshake_rejects_garbage_identity() {
    let manager = manager();
    let conn = MockConnection::new();
    let (tx, reader) = channel_reader();
    tx.send(Ok(Inbound::Text("hello there".into()))).unwrap();

    let result = manager.serve_connection(conn.clone(), reader).await;

    assert!(matches!(result, Err(HandshakeError::InvalidIdentity(_))));
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn test_duplicate_identity_is_told_already_connected() {
    let manager = manager();
    let id = PeerId::from_bytes([2; 20]);

    let first = MockConnection::new();
    let (first_tx, first_reader) = channel_reader();
    first_tx.send(Ok(identity(id, "bob"))).unwrap();
    let serving = {
        let manager = manager.clone();
        let first = first.clone();
        tokio::spawn(async move { manager.serve_connection(first, first_reader).await })
    };
    wait_until(|| first.sent().len() == 2).await;
    let original = manager.registry().retrieve(&id).await.unwrap();

    let second = MockConnection::new();
    let (second_tx, second_reader) = channel_reader();
    second_tx.send(Ok(identity(id, "bob"))).unwrap();
    let result = manager.serve_connection(second.clone(), second_reader).await;

    assert!(matches!(result, Err(HandshakeError::AlreadyConnected(conflict)) if conflict == id));
    assert_eq!(second.sent(), vec![GREETING.to_string(), ALREADY_CONNECTED.to_string()]);
    assert!(second.close_count() >= 1);

    // The original registration survives the rejected duplicate
    let current = manager.registry().retrieve(&id).await.unwrap();
    assert_eq!(current.session, original.session);
    assert_eq!(first.close_count(), 0);

    drop(first_tx);
    serving.await.unwrap().unwrap();
    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn test_read_loop_routes_frames_and_cleans_up() {
    let manager = manager();
    let alice = signing_key(1);
    let bob = signing_key(2);

    // bob registered directly
    let bob_conn = MockConnection::new();
    manager.registry().add(address(&bob), "bob", bob_conn.clone()).await.unwrap();

    let alice_conn = MockConnection::new();
    let (tx, reader) = channel_reader();
    tx.send(Ok(identity(address(&alice), "alice"))).unwrap();
    let serving = {
        let manager = manager.clone();
        let alice_conn = alice_conn.clone();
        tokio::spawn(async move { manager.serve_connection(alice_conn, reader).await })
    };
    wait_until(|| alice_conn.sent().len() == 2).await;

    let json = signed(&alice, "alice", address(&bob), "hi", 1).to_json().unwrap();
    tx.send(Ok(Inbound::Text("garbage".into()))).unwrap();
    tx.send(Err(ReadFailure::Transient("timed out".into()))).unwrap();
    tx.send(Ok(Inbound::Binary(json.into_bytes()))).unwrap();
    tx.send(Ok(Inbound::Ping)).unwrap();
    tx.send(Ok(Inbound::Pong)).unwrap();

    wait_until(|| bob_conn.sent().len() == 1).await;
    wait_until(|| alice_conn.pongs.load(Ordering::SeqCst) == 1).await;

    tx.send(Err(ReadFailure::Critical("connection reset".into()))).unwrap();
    serving.await.unwrap().unwrap();

    assert!(manager.registry().retrieve(&address(&alice)).await.is_err());
    assert!(alice_conn.close_count() >= 1);
    // Malformed input never tore the connection down early
    assert_eq!(bob_conn.sent().len(), 1);
}

#[tokio::test]
async fn test_pong_updates_registry() {
    let manager = manager();
    let conn = MockConnection::new();
    let id = PeerId::from_bytes([3; 20]);
    let (tx, reader) = channel_reader();
    tx.send(Ok(identity(id, "carol"))).unwrap();
    let serving = {
        let manager = manager.clone();
        let conn = conn.clone();
        tokio::spawn(async move { manager.serve_connection(conn, reader).await })
    };
    wait_until(|| conn.sent().len() == 2).await;

    tx.send(Ok(Inbound::Pong)).unwrap();
    for _ in 0..100 {
        if manager.registry().retrieve(&id).await.unwrap().last_pong.is_some() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.registry().retrieve(&id).await.unwrap().last_pong.is_some());

    tx.send(Ok(Inbound::Close)).unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_too_many_transient_failures_close_the_connection() {
    let manager = manager();
    let conn = MockConnection::new();
    let id = PeerId::from_bytes([4; 20]);
    let (tx, reader) = channel_reader();
    tx.send(Ok(identity(id, "dave"))).unwrap();
    for _ in 0..20 {
        tx.send(Err(ReadFailure::Transient("would block".into()))).unwrap();
    }

    manager.serve_connection(conn.clone(), reader).await.unwrap();

    assert!(manager.registry().is_empty().await);
    assert!(conn.close_count() >= 1);
}

#[tokio::test]
async fn test_probe_pings_every_connection() {
    let manager = manager();
    let a = MockConnection::new();
    let b = MockConnection::new();
    manager.registry().add(PeerId::from_bytes([5; 20]), "a", a.clone()).await.unwrap();
    manager.registry().add(PeerId::from_bytes([6; 20]), "b", b.clone()).await.unwrap();

    assert_eq!(manager.probe_once().await, 2);

    assert_eq!(a.pings.load(Ordering::SeqCst), 1);
    assert_eq!(b.pings.load(Ordering::SeqCst), 1);
    let record = manager.registry().retrieve(&PeerId::from_bytes([5; 20])).await.unwrap();
    assert!(record.last_ping.is_some());
}

#[tokio::test]
async fn test_liveness_task_pings_periodically_and_stops_on_shutdown() {
    let manager = manager();
    let conn = MockConnection::new();
    manager.registry().add(PeerId::from_bytes([7; 20]), "e", conn.clone()).await.unwrap();

    let task = manager.spawn_liveness();
    wait_until(|| conn.pings.load(Ordering::SeqCst) >= 2).await;

    manager.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("liveness task should stop")
        .unwrap();
}

#[tokio::test]
async fn test_grooming_closes_only_stale_connections() {
    let manager = manager_with(LifecycleConfig {
        stale_after: Some(Duration::from_millis(100)),
        ..config()
    });
    let stale = MockConnection::new();
    let fresh = MockConnection::new();
    let stale_id = PeerId::from_bytes([8; 20]);
    let fresh_id = PeerId::from_bytes([9; 20]);

    manager.registry().add(stale_id, "stale", stale.clone()).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    manager.registry().add(fresh_id, "fresh", fresh.clone()).await.unwrap();

    assert_eq!(manager.groom_once().await, 1);
    wait_until(|| stale.close_count() == 1).await;

    assert_eq!(fresh.close_count(), 0);
    for _ in 0..100 {
        if manager.registry().retrieve(&stale_id).await.is_err() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(manager.registry().retrieve(&stale_id).await.is_err());
    assert!(manager.registry().retrieve(&fresh_id).await.is_ok());
}

#[tokio::test]
async fn test_recent_pong_keeps_connection_alive() {
    let manager = manager_with(LifecycleConfig {
        stale_after: Some(Duration::from_millis(100)),
        ..config()
    });
    let conn = MockConnection::new();
    let id = PeerId::from_bytes([10; 20]);
    manager.registry().add(id, "f", conn.clone()).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    manager.registry().update_last_pong(&id).await.unwrap();

    assert_eq!(manager.groom_once().await, 0);
    assert_eq!(conn.close_count(), 0);
}

#[tokio::test]
async fn test_grooming_disabled() {
    let manager = manager();
    let conn = MockConnection::new();
    manager.registry().add(PeerId::from_bytes([11; 20]), "g", conn.clone()).await.unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.groom_once().await, 0);
}

#[tokio::test]
async fn test_shutdown_closes_everything_and_refuses_new_handshakes() {
    let manager = manager();
    let conns: Vec<_> = (0..5).map(|_| MockConnection::new()).collect();
    for (i, conn) in conns.iter().enumerate() {
        manager
            .registry()
            .add(PeerId::from_bytes([20 + i as u8; 20]), "peer", conn.clone())
            .await
            .unwrap();
    }

    manager.shutdown().await.unwrap();

    assert!(manager.is_shutting_down());
    assert!(manager.shutdown_token().is_cancelled());
    for conn in &conns {
        assert_eq!(conn.close_count(), 1);
    }

    let late = MockConnection::new();
    let handle: ConnectionHandle = late.clone();
    let (_tx, mut reader) = channel_reader();
    let result = manager.handshake(&handle, &mut reader).await;
    assert!(matches!(result, Err(HandshakeError::ShuttingDown)));
    assert!(late.sent().is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_concurrently_and_reports_deadline() {
    let manager = manager_with(LifecycleConfig {
        shutdown_timeout: Duration::from_millis(300),
        ..config()
    });

    // Four closes of 200ms each fit in 300ms only when run in parallel
    for i in 0..4u8 {
        manager
            .registry()
            .add(
                PeerId::from_bytes([40 + i; 20]),
                "slow",
                MockConnection::with_close_delay(Duration::from_millis(200)),
            )
            .await
            .unwrap();
    }
    manager.shutdown().await.unwrap();

    let stuck = manager_with(LifecycleConfig {
        shutdown_timeout: Duration::from_millis(100),
        ..config()
    });
    stuck
        .registry()
        .add(
            PeerId::from_bytes([50; 20]),
            "stuck",
            MockConnection::with_close_delay(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let err = stuck.shutdown().await.unwrap_err();
    assert_eq!(
        err,
        ShutdownError::DeadlineExceeded {
            pending: 1,
            timeout: Duration::from_millis(100)
        }
    );
}
