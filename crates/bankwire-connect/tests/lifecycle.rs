//! Connection lifecycle driven by the simulated bank under a paused clock.

use bankwire_connect::message::WireMessage;
use bankwire_connect::sim::{BankBehavior, SimOpen, SimTransport};
use bankwire_connect::{
    BankConnection, ConnectError, ConnectionEvent, ConnectionState, EndpointConfig, SendError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::time::Instant;

fn endpoint() -> EndpointConfig {
    let mut config = EndpointConfig::new("visa", "sim.bank", 7000);
    config.reconnect_base_ms = 1_000;
    config.reconnect_cap_ms = 60_000;
    config.max_reconnect_attempts = 3;
    config.heartbeat_interval_ms = 30_000;
    config.message_timeout_ms = 30_000;
    config
}

fn connection(sim: &SimTransport, config: EndpointConfig) -> BankConnection {
    BankConnection::with_transport(config, Arc::new(sim.clone()))
}

async fn next(events: &mut Receiver<ConnectionEvent>) -> ConnectionEvent {
    events.recv().await.unwrap()
}

fn gaps(times: &[Instant]) -> Vec<u64> {
    times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect()
}

async fn wait_for_requests(conn: &BankConnection, sim: &SimTransport, n: usize) {
    while conn.pending_requests() < n || sim.received().len() < n {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sequence_then_exhaustion() {
    let sim = SimTransport::new();
    sim.script([SimOpen::Refuse; 4]);
    let conn = connection(&sim, endpoint());
    let mut events = conn.subscribe();

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::ReconnectionExhausted { attempts: 3, .. }));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(sim.open_attempts(), 4);
    assert_eq!(gaps(&sim.attempt_times()), vec![1_000, 2_000, 4_000]);

    for (attempt, delay_ms) in [(1, 1_000), (2, 2_000), (3, 4_000)] {
        assert_eq!(
            next(&mut events).await,
            ConnectionEvent::Reconnecting {
                attempt,
                delay: Duration::from_millis(delay_ms)
            }
        );
    }
    assert!(matches!(
        next(&mut events).await,
        ConnectionEvent::ReconnectionExhausted { attempts: 3, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_are_capped() {
    let sim = SimTransport::new();
    sim.script([SimOpen::Refuse; 7]);
    let mut config = endpoint();
    config.reconnect_cap_ms = 5_000;
    config.max_reconnect_attempts = 6;
    let conn = connection(&sim, config);

    assert!(conn.connect().await.is_err());
    assert_eq!(
        gaps(&sim.attempt_times()),
        vec![1_000, 2_000, 4_000, 5_000, 5_000, 5_000]
    );
    assert_eq!(conn.retry_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_connect_succeeds_after_transient_failures() {
    let sim = SimTransport::new();
    sim.script([SimOpen::Refuse, SimOpen::Timeout]);
    let conn = connection(&sim, endpoint());
    let mut events = conn.subscribe();

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.retry_count(), 2);
    assert_eq!(sim.open_attempts(), 3);

    // The cycle ends once the bank answers on the new channel.
    conn.send(json!({"balance": 1}), None).await.unwrap();
    assert_eq!(conn.retry_count(), 0);

    assert!(matches!(next(&mut events).await, ConnectionEvent::Reconnecting { attempt: 1, .. }));
    assert!(matches!(next(&mut events).await, ConnectionEvent::Reconnecting { attempt: 2, .. }));
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_certificate_failure_is_not_retried() {
    let sim = SimTransport::new();
    sim.script([SimOpen::RejectCertificate]);
    let conn = connection(&sim, endpoint());

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::CertificateValidationFailed { .. }));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sim.open_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connecting_is_rejected() {
    let sim = SimTransport::new();
    sim.script([SimOpen::Timeout]);
    let conn = connection(&sim, endpoint());

    let first = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(
        conn.connect().await,
        Err(ConnectError::InvalidState {
            state: "connecting".into()
        })
    );
    first.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_backoff() {
    let sim = SimTransport::new();
    sim.script([SimOpen::Refuse; 10]);
    let conn = connection(&sim, endpoint());

    let connecting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    conn.disconnect().await.unwrap();

    assert_eq!(connecting.await.unwrap(), Err(ConnectError::Cancelled));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sim.open_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_fails_only_that_request() {
    let sim = SimTransport::new();
    sim.set_behavior(BankBehavior::Silent);
    let conn = connection(&sim, endpoint());
    conn.connect().await.unwrap();

    let started = Instant::now();
    let err = conn
        .send(json!({"amount": 1}), Some(Duration::from_millis(250)))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Timeout { timeout_ms: 250, .. }));
    assert!(!err.is_channel_failure());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(260));
    assert!(conn.is_connected());
    assert_eq!(conn.pending_requests(), 0);

    // A response arriving after the deadline is dropped.
    let id = sim.received()[0].id.clone().unwrap();
    sim.inject(WireMessage::response(id, json!({"late": true})));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_responses_reach_their_callers() {
    let sim = SimTransport::new();
    sim.set_behavior(BankBehavior::Silent);
    let conn = connection(&sim, endpoint());
    conn.connect().await.unwrap();

    let callers: Vec<_> = (0..3)
        .map(|i| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(json!({"caller": i}), None).await })
        })
        .collect();
    wait_for_requests(&conn, &sim, 3).await;

    let mut requests = sim.received();
    requests.reverse();
    for request in requests {
        let caller = request.data["caller"].clone();
        sim.inject(WireMessage::response(
            request.id.unwrap(),
            json!({"answer_for": caller}),
        ));
    }

    for (i, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.await.unwrap().unwrap(), json!({"answer_for": i}));
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_rejects_all_pending_with_cancelled() {
    let sim = SimTransport::new();
    sim.set_behavior(BankBehavior::Silent);
    let conn = connection(&sim, endpoint());
    conn.connect().await.unwrap();

    let callers: Vec<_> = (0..10)
        .map(|i| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(json!({"n": i}), None).await })
        })
        .collect();
    wait_for_requests(&conn, &sim, 10).await;

    conn.disconnect().await.unwrap();
    assert_eq!(conn.pending_requests(), 0);
    for caller in callers {
        assert_eq!(caller.await.unwrap(), Err(SendError::Cancelled));
    }

    // Nothing is resolved or panics when a stale response shows up.
    let stale = sim.received()[0].id.clone().unwrap();
    assert!(!sim.inject(WireMessage::response(stale, json!({}))));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(sim.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_silence_triggers_recovery() {
    let sim = SimTransport::new();
    sim.set_behavior(BankBehavior::Silent);
    let mut config = endpoint();
    config.heartbeat_interval_ms = 1_000;
    let conn = connection(&sim, config);
    let mut events = conn.subscribe();

    let t0 = Instant::now();
    conn.connect().await.unwrap();
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));

    let outstanding = conn.send(json!({"pending": true}), Some(Duration::from_secs(60))).await;
    assert!(matches!(outstanding, Err(SendError::ConnectionLost { .. })));
    let lost_after = t0.elapsed();
    assert!(lost_after >= Duration::from_millis(2_000) && lost_after < Duration::from_millis(2_010));
    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert_eq!(conn.heartbeat_stats().missed, 1);

    sim.set_behavior(BankBehavior::Echo);
    assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));
    assert!(matches!(next(&mut events).await, ConnectionEvent::Reconnecting { attempt: 1, .. }));
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));
    assert_eq!(conn.retry_count(), 1);
    let reopened_after = gaps(&sim.attempt_times())[0];
    assert!((3_000..3_010).contains(&reopened_after), "{}", reopened_after);

    assert_eq!(conn.send(json!({"after": 1}), None).await.unwrap(), json!({"after": 1}));
    assert_eq!(conn.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_answered_heartbeats_keep_connection_up() {
    let sim = SimTransport::new();
    let mut config = endpoint();
    config.heartbeat_interval_ms = 1_000;
    let conn = connection(&sim, config);
    conn.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert!(conn.is_connected());
    let stats = conn.heartbeat_stats();
    assert_eq!(stats.sent, 10);
    assert_eq!(stats.acknowledged, 10);
    assert_eq!(sim.open_attempts(), 1);
    assert!(sim.received().iter().all(WireMessage::is_heartbeat));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_heartbeats_alone_kill_connection() {
    let sim = SimTransport::new();
    sim.set_behavior(BankBehavior::EchoExceptHeartbeat);
    let mut config = endpoint();
    config.heartbeat_interval_ms = 1_000;
    let conn = connection(&sim, config);
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));

    match next(&mut events).await {
        ConnectionEvent::Disconnected { reason } => assert!(reason.contains("heartbeat"), "{}", reason),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_severed_link_rejects_pending_and_reconnects() {
    let sim = SimTransport::new();
    sim.set_behavior(BankBehavior::Silent);
    let conn = connection(&sim, endpoint());
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));

    let callers: Vec<_> = (0..4)
        .map(|i| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(json!({"n": i}), None).await })
        })
        .collect();
    wait_for_requests(&conn, &sim, 4).await;

    sim.sever();
    for caller in callers {
        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, SendError::ConnectionLost { .. }));
        assert!(err.is_channel_failure());
    }

    assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));
    assert!(matches!(next(&mut events).await, ConnectionEvent::Reconnecting { attempt: 1, .. }));
    assert_eq!(conn.retry_count(), 1);
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));
    assert!(conn.is_connected());

    sim.set_behavior(BankBehavior::Echo);
    assert_eq!(conn.send(json!({"n": 9}), None).await.unwrap(), json!({"n": 9}));
    assert_eq!(conn.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_exhaustion_after_loss() {
    let sim = SimTransport::new();
    let conn = connection(&sim, endpoint());
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));

    sim.script([SimOpen::Refuse; 3]);
    sim.reset();

    assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));
    for attempt in 1..=3 {
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Reconnecting { attempt: a, .. } if a == attempt
        ));
    }
    assert!(matches!(
        next(&mut events).await,
        ConnectionEvent::ReconnectionExhausted { attempts: 3, .. }
    ));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(gaps(&sim.attempt_times()[1..]), vec![2_000, 4_000]);

    // Nothing is left to tear down.
    conn.disconnect().await.unwrap();
    assert!(events.try_recv().is_err());

    // A fresh connect starts over.
    conn.connect().await.unwrap();
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_certificate_rejection_after_connect_is_fatal() {
    let sim = SimTransport::new();
    let conn = connection(&sim, endpoint());
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));

    sim.reject_certificate();
    assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(sim.open_attempts(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_bank_dropping_every_channel_exhausts_retries() {
    let sim = SimTransport::new();
    let conn = connection(&sim, endpoint());
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();

    for attempt in 1..=3 {
        assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));
        sim.sever();
        assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Reconnecting { attempt: a, .. } if a == attempt
        ));
    }
    assert!(matches!(next(&mut events).await, ConnectionEvent::Connected { .. }));
    sim.sever();
    assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));
    assert!(matches!(
        next(&mut events).await,
        ConnectionEvent::ReconnectionExhausted { attempts: 3, .. }
    ));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(sim.open_attempts(), 4);

    conn.disconnect().await.unwrap();
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_connect_can_be_retried() {
    let sim = SimTransport::new();
    sim.script([SimOpen::Refuse; 2]);
    let conn = connection(&sim, endpoint());
    let mut events = conn.subscribe();

    let abandoned = tokio::time::timeout(Duration::from_millis(500), conn.connect()).await;
    assert!(abandoned.is_err());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(next(&mut events).await, ConnectionEvent::Reconnecting { attempt: 1, .. }));
    assert!(matches!(next(&mut events).await, ConnectionEvent::Disconnected { .. }));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(sim.open_attempts(), 1);

    conn.connect().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(sim.open_attempts(), 3);
}
