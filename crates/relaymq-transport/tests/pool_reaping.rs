//! Pool lifecycle and reaping tests against mock managed connections.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{info, pool, MockFactory, RecordingCallerListener};
use relaymq_transport::{
    AllowAll, ConnectionPool, ManagedConnection, PoolConfig, Request, ResourceError,
};

fn idle_only(idle_ms: u64) -> PoolConfig {
    PoolConfig::default()
        .with_reap_interval(Duration::ZERO)
        .with_idle_period(Duration::from_millis(idle_ms))
}

fn dead_only(reap_ms: u64, iterations: u32) -> PoolConfig {
    PoolConfig::default()
        .with_reap_interval(Duration::from_millis(reap_ms))
        .with_reap_dead_iterations(iterations)
        .with_idle_period(Duration::from_secs(3600))
}

fn request() -> Request {
    Request::new("queue/orders", "send", Bytes::from_static(b"payload"))
}

#[tokio::test(start_paused = true)]
async fn test_released_connection_is_reaped_after_idle_period() {
    common::init_tracing();
    let factory = MockFactory::new();
    let pool = pool(&factory, idle_only(100));

    let managed = pool
        .create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();
    let lease = managed.get_connection().unwrap();
    lease.invoke(request()).await.unwrap();
    lease.close().unwrap();

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert_eq!(factory.connections()[0].destroys(), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(factory.connections()[0].destroys(), 1);
    assert!(pool.match_managed_connections(None, &info("mock://broker")).is_none());
    assert!(pool.is_empty());
    assert!(!pool.is_reaper_running());
    assert_eq!(pool.stats().idle_reaped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_reaping_is_debounced() {
    let factory = MockFactory::new();
    let pool = pool(&factory, idle_only(100));
    let managed = pool
        .create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();

    for _ in 0..10 {
        let lease = managed.get_connection().unwrap();
        lease.invoke(request()).await.unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    assert_eq!(factory.connections()[0].destroys(), 0);
    assert_eq!(pool.len(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(factory.connections()[0].destroys(), 1);
    assert!(pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_held_lease_prevents_idle_reaping() {
    let factory = MockFactory::new();
    let pool = pool(&factory, idle_only(100));
    let managed = pool
        .create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();

    let held = managed.get_connection().unwrap();
    drop(managed.get_connection().unwrap());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.stats().active_leases, 1);

    drop(held);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(pool.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_reaped_after_ping_waits() {
    let factory = MockFactory::new();
    factory.behaviour.ignore_pings.store(true, Ordering::SeqCst);
    let pool = pool(&factory, dead_only(50, 2));
    let listener = Arc::new(RecordingCallerListener::default());
    pool.set_caller_listener(Some(listener.clone()));

    pool.create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();
    let connection = factory.connections()[0].clone();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(connection.pings(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(connection.destroys(), 0);
    assert_eq!(pool.len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connection.destroys(), 1);
    assert_eq!(connection.pings(), 1);
    assert!(pool.is_empty());

    let stats = pool.stats();
    assert_eq!(stats.dead_reaped, 1);
    assert_eq!(stats.pings_sent, 1);

    let seen = listener.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].remote_uri.as_str(), "mock://broker");
    assert_eq!(seen[0].local_uri.as_str(), "mock://local-1");
}

#[tokio::test(start_paused = true)]
async fn test_answering_connection_survives() {
    let factory = MockFactory::new();
    let pool = pool(&factory, dead_only(50, 2));
    pool.create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1010)).await;
    let connection = factory.connections()[0].clone();
    assert_eq!(connection.destroys(), 0);
    assert_eq!(connection.pings(), 20);
    assert!(pool.is_reaper_running());
}

#[tokio::test(start_paused = true)]
async fn test_traffic_replaces_pings() {
    let factory = MockFactory::new();
    factory.behaviour.ignore_pings.store(true, Ordering::SeqCst);
    let pool = pool(&factory, dead_only(50, 2));
    let managed = pool
        .create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();
    let lease = managed.get_connection().unwrap();

    for _ in 0..20 {
        lease.invoke(request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let connection = factory.connections()[0].clone();
    assert_eq!(connection.pings(), 0);
    assert_eq!(connection.destroys(), 0);

    // Traffic stops; one ping, then unanswered cycles while the lease is held.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connection.pings(), 1);
    assert_eq!(connection.destroys(), 0);
    assert_eq!(pool.stats().active_leases, 1);

    lease.close().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(connection.pings(), 1);
    assert_eq!(connection.destroys(), 1);
    assert!(pool.is_empty());
    assert_eq!(pool.stats().dead_reaped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ping_send_failure_reaps_immediately() {
    let factory = MockFactory::new();
    factory.behaviour.fail_pings.store(true, Ordering::SeqCst);
    let pool = pool(&factory, dead_only(50, 5));
    pool.create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(55)).await;
    assert_eq!(factory.connections()[0].destroys(), 1);
    assert!(pool.is_empty());
    assert_eq!(pool.stats().dead_reaped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ping_send_failure_waits_for_lease_release() {
    let factory = MockFactory::new();
    factory.behaviour.fail_pings.store(true, Ordering::SeqCst);
    let pool = pool(&factory, dead_only(50, 2));
    let managed = pool
        .create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();
    let lease = managed.get_connection().unwrap();
    let connection = factory.connections()[0].clone();

    tokio::time::sleep(Duration::from_millis(210)).await;
    assert_eq!(connection.pings(), 1);
    assert_eq!(connection.destroys(), 0);
    assert_eq!(pool.len(), 1);

    drop(lease);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(connection.pings(), 1);
    assert_eq!(connection.destroys(), 1);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_setup_failure_reverts_registration() {
    let factory = MockFactory::new();
    factory.behaviour.fail_setup.store(true, Ordering::SeqCst);
    let pool = pool(&factory, PoolConfig::default());

    let err = pool
        .create_managed_connection(None, &info("mock://broker"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ResourceError::Invocation(_)));
    assert_eq!(factory.connections()[0].destroys(), 1);
    assert!(pool.is_empty());
    assert!(!pool.is_reaper_running());

    let stats = pool.stats();
    assert_eq!(stats.setup_failures, 1);
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.connections_destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_accepted_connections_are_never_reaped() {
    let factory = MockFactory::new();
    factory.behaviour.ignore_pings.store(true, Ordering::SeqCst);
    let pool = pool(&factory, PoolConfig::default()
        .with_reap_interval(Duration::from_millis(50))
        .with_reap_dead_iterations(1)
        .with_idle_period(Duration::from_millis(50)));
    let listener = Arc::new(RecordingCallerListener::default());
    pool.set_caller_listener(Some(listener.clone()));

    pool.create_managed_connection_acceptor(Arc::new(AllowAll), &info("mock://broker"))
        .await
        .unwrap();
    let acceptor = factory.acceptors()[0].clone();
    let server_end = acceptor.connect(None);
    assert!(pool.is_reaper_running());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(server_end.pings(), 0);
    assert_eq!(server_end.destroys(), 0);

    let stats = pool.stats();
    assert_eq!(stats.accepted_connections, 1);
    assert_eq!(stats.outbound_connections, 0);

    server_end.peer_closed();
    assert_eq!(server_end.destroys(), 1);
    assert!(pool.is_empty());
    assert!(!pool.is_reaper_running());
    assert_eq!(listener.seen()[0].remote_uri.as_str(), "mock://peer-1");
}

#[tokio::test]
async fn test_inbound_invocation_reaches_handler() {
    let factory = MockFactory::new();
    let pool = pool(&factory, PoolConfig::default());
    pool.create_managed_connection_acceptor(Arc::new(AllowAll), &info("mock://broker"))
        .await
        .unwrap();
    let server_end = factory.acceptors()[0].connect(None);

    let response = server_end.inbound(request()).await.unwrap();
    assert_eq!(response.result().unwrap().as_ref(), b"payload");
}

#[tokio::test]
async fn test_error_event_removes_connection() {
    let factory = MockFactory::new();
    let pool = pool(&factory, PoolConfig::default());
    let listener = Arc::new(RecordingCallerListener::default());
    pool.set_caller_listener(Some(listener.clone()));
    let managed = pool
        .create_managed_connection(None, &info("mock://broker"))
        .await
        .unwrap();

    factory.connections()[0].fail(ResourceError::ConnectionClosed);
    assert!(pool.is_empty());
    assert_eq!(factory.connections()[0].destroys(), 1);
    assert_eq!(listener.seen().len(), 1);

    factory.connections()[0].peer_closed();
    assert_eq!(factory.connections()[0].destroys(), 1);
    assert!(!pool.remove(&managed));
}

#[tokio::test]
async fn test_acceptor_matching_and_failure() {
    let factory = MockFactory::new();
    let pool = pool(&factory, PoolConfig::default());
    let broker = info("mock://broker");

    assert!(pool.match_managed_connection_acceptors(&broker).is_none());
    pool.create_managed_connection_acceptor(Arc::new(AllowAll), &broker)
        .await
        .unwrap();
    assert!(pool.match_managed_connection_acceptors(&broker).is_some());
    assert!(pool
        .match_managed_connection_acceptors(&info("mock://other"))
        .is_none());

    factory.behaviour.fail_accept.store(true, Ordering::SeqCst);
    let err = pool
        .create_managed_connection_acceptor(Arc::new(AllowAll), &info("mock://other"))
        .await
        .err()
        .unwrap();
    assert!(err.is_connect_error());
    assert!(factory.acceptors()[1].is_closed());
    assert_eq!(pool.stats().acceptors, 1);

    pool.close();
    assert!(factory.acceptors()[0].is_closed());
}

#[tokio::test]
async fn test_close_destroys_everything_once() {
    let factory = MockFactory::new();
    let pool = pool(&factory, PoolConfig::default());
    pool.create_managed_connection_acceptor(Arc::new(AllowAll), &info("mock://broker"))
        .await
        .unwrap();
    let server_end = factory.acceptors()[0].connect(None);
    for target in ["mock://a", "mock://b"] {
        pool.create_managed_connection(None, &info(target))
            .await
            .unwrap();
    }
    assert_eq!(pool.len(), 3);

    pool.close();
    pool.close();
    assert!(pool.is_empty());
    assert!(!pool.is_reaper_running());
    assert_eq!(server_end.destroys(), 1);
    for connection in factory.connections() {
        assert_eq!(connection.destroys(), 1);
    }

    let acceptor = factory.acceptors()[0].clone();
    let late = acceptor.connect(None);
    assert_eq!(late.destroys(), 1);
    assert!(pool.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_match_and_reap_race_destroys_each_connection_once() {
    let factory = MockFactory::new();
    let pool = pool(&factory, PoolConfig::default()
        .with_reap_interval(Duration::from_millis(1))
        .with_reap_dead_iterations(1)
        .with_idle_period(Duration::from_millis(1)));

    let mut workers = Vec::new();
    for worker in 0..8 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            let target = info(&format!("mock://broker-{}", worker % 2));
            for _ in 0..200 {
                let managed = match pool.match_managed_connections(None, &target) {
                    Some(managed) => managed,
                    None => pool.create_managed_connection(None, &target).await.unwrap(),
                };
                if let Ok(lease) = managed.get_connection() {
                    let _ = lease.invoke(request()).await;
                }
                if worker % 3 == 0 {
                    pool.reap_idle();
                    pool.reap_dead();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
    pool.close();

    let connections = factory.connections();
    assert!(!connections.is_empty());
    for connection in &connections {
        assert_eq!(connection.destroys(), 1);
    }
    let stats = pool.stats();
    assert_eq!(stats.connections_destroyed, connections.len() as u64);
    assert_eq!(stats.connections_created, connections.len() as u64);
}

#[tokio::test(start_paused = true)]
async fn test_matched_connection_outlives_original_idle_deadline() {
    let factory = MockFactory::new();
    let pool = pool(&factory, idle_only(100));
    let target = info("mock://broker");

    let managed = pool.create_managed_connection(None, &target).await.unwrap();
    managed.get_connection().unwrap().close().unwrap();

    tokio::time::sleep(Duration::from_millis(90)).await;
    let matched = pool.match_managed_connections(None, &target).unwrap();

    // Past the deadline set by the release; the match restarted the idle window.
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.reap_idle();
    let connection = factory.connections()[0].clone();
    assert_eq!(connection.destroys(), 0);
    assert_eq!(pool.len(), 1);

    let lease = matched.get_connection().unwrap();
    lease.invoke(request()).await.unwrap();
    assert_eq!(pool.stats().active_leases, 1);
    assert_eq!(pool.stats().idle_reaped, 0);
}
