//! Connection manager tests against the mock transport
//!
//! All tests run on a paused clock so the reset sequence and the drain loop
//! advance deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use seriallink::config::{LinkConfig, MockConfig, TransportConfig};
use seriallink::connection::RESET_PULSE;
use seriallink::transport::mock::{MockTransport, TransportCall};
use seriallink::{
    ConnectionId, ConnectionManager, ConnectionOptions, ConnectionState, ControlSignals,
    LinkError, LinkEvent, ListenerKind, ReceiveErrorKind, SendInfo,
};
use tokio::sync::broadcast;

fn setup_with(config: LinkConfig) -> (Arc<MockTransport>, ConnectionManager) {
    let mock = Arc::new(MockTransport::new(&MockConfig::default()));
    let manager = ConnectionManager::new(mock.clone(), config);
    (mock, manager)
}

fn setup() -> (Arc<MockTransport>, ConnectionManager) {
    setup_with(LinkConfig {
        transport: TransportConfig::Mock(MockConfig::default()),
        ..Default::default()
    })
}

fn drain_events(rx: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn connect(manager: &ConnectionManager) -> seriallink::ConnectionInfo {
    manager
        .connect("COM-TEST", ConnectionOptions::with_bitrate(115200))
        .await
        .unwrap()
}

// =============================================================================
// Connect / Disconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_runs_reset_and_becomes_ready() {
    let (mock, manager) = setup();
    let mut events = manager.subscribe_events();

    let info = connect(&manager).await;

    assert_eq!(info.path, "COM-TEST");
    assert_eq!(info.bitrate, 115200);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.connection_id(), Some(info.id));
    assert_eq!(manager.bytes_sent(), 0);
    assert_eq!(manager.bytes_received(), 0);
    assert_eq!(manager.consecutive_failures(), 0);

    let log = mock.signal_log();
    let levels: Vec<ControlSignals> = log.iter().map(|(_, s)| *s).collect();
    assert_eq!(
        levels,
        vec![
            ControlSignals::ASSERTED,
            ControlSignals::DEASSERTED,
            ControlSignals::ASSERTED
        ]
    );
    assert_eq!(log[1].0 - log[0].0, RESET_PULSE);
    assert_eq!(log[2].0 - log[1].0, RESET_PULSE);

    assert_eq!(
        drain_events(&mut events),
        vec![
            LinkEvent::Opened {
                id: info.id,
                path: "COM-TEST".to_string(),
                bitrate: 115200
            },
            LinkEvent::Ready { id: info.id },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_is_reported() {
    let (mock, manager) = setup();
    let mut events = manager.subscribe_events();
    mock.fail_open("COM-BAD");

    let err = manager
        .connect("COM-BAD", ConnectionOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, LinkError::OpenFailed { ref path, .. } if path == "COM-BAD"));
    assert_eq!(manager.state(), ConnectionState::FailedToOpen);
    assert!(matches!(
        drain_events(&mut events).as_slice(),
        [LinkEvent::OpenFailed { path, .. }] if path == "COM-BAD"
    ));
    assert!(mock.signal_log().is_empty());

    // A later connect to a working port is allowed
    connect(&manager).await;
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_twice() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;

    assert!(manager.disconnect().await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.connection_id(), None);
    assert!(!mock.is_open(info.id));

    mock.clear_calls();
    assert!(!manager.disconnect().await);
    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_without_connection_touches_nothing() {
    let (mock, manager) = setup();

    assert!(!manager.disconnect().await);
    assert!(mock.calls().is_empty());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_reset_cancels_connect() {
    let (mock, manager) = setup();
    let mut events = manager.subscribe_events();

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { connect_result(&manager).await })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(manager.state(), ConnectionState::ResettingDevice);
    assert_eq!(mock.signal_log().len(), 1);

    assert!(manager.disconnect().await);
    assert_eq!(pending.await.unwrap(), Err(LinkError::Cancelled));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.signal_log().len(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, LinkEvent::Ready { .. })));
}

async fn connect_result(manager: &ConnectionManager) -> Result<(), LinkError> {
    manager
        .connect("COM-TEST", ConnectionOptions::default())
        .await
        .map(|_| ())
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_open_in_flight() {
    let mock = Arc::new(MockTransport::new(&MockConfig {
        latency_ms: 10,
        ..Default::default()
    }));
    let manager = ConnectionManager::new(mock.clone(), LinkConfig::default());

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { connect_result(&manager).await })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    assert!(!manager.disconnect().await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(pending.await.unwrap(), Err(LinkError::Cancelled));

    assert_eq!(
        mock.calls(),
        vec![
            TransportCall::Open {
                path: "COM-TEST".to_string()
            },
            TransportCall::Close { id: ConnectionId(1) },
        ]
    );
    assert!(!mock.is_open(ConnectionId(1)));
    assert_eq!(manager.listener_count(ListenerKind::Data), 0);
    assert!(mock.signal_log().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_racing_disconnect_leaves_nothing_attached() {
    let (_mock, manager) = setup();

    for _ in 0..50 {
        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { connect_result(&manager).await })
        };
        let disconnecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.disconnect().await })
        };

        let connected = connecting.await.unwrap();
        disconnecting.await.unwrap();

        if connected.is_err() {
            assert_eq!(manager.listener_count(ListenerKind::Data), 0);
            assert_eq!(manager.listener_count(ListenerKind::Error), 0);
            assert_eq!(manager.connection_id(), None);
        }
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_failure_is_reported() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    let mut events = manager.subscribe_events();
    mock.set_close_result(false);

    assert!(!manager.disconnect().await);

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        drain_events(&mut events),
        vec![
            LinkEvent::CloseFailed { id: info.id },
            LinkEvent::Closed {
                id: info.id,
                bytes_sent: 0,
                bytes_received: 0
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_closed_event_carries_statistics() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    let mut events = manager.subscribe_events();

    manager.write(vec![0x01, 0x02]).await.unwrap();
    mock.inject_data(info.id, vec![0xaa, 0xbb, 0xcc]);
    settle().await;
    manager.disconnect().await;

    assert_eq!(
        drain_events(&mut events).last(),
        Some(&LinkEvent::Closed {
            id: info.id,
            bytes_sent: 2,
            bytes_received: 3
        })
    );
    assert_eq!(manager.bytes_sent(), 0);
    assert_eq!(manager.bytes_received(), 0);
}

// =============================================================================
// Output queue
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_reports_bytes() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;

    let sent = manager.write(vec![0x01, 0x02]).await.unwrap();

    assert_eq!(sent, SendInfo { bytes_sent: 2 });
    assert_eq!(manager.bytes_sent(), 2);
    assert!(mock.calls().contains(&TransportCall::Write {
        id: info.id,
        data: vec![0x01, 0x02]
    }));
    assert!(!manager.is_draining());
    assert_eq!(manager.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sends_are_written_in_order() {
    let (mock, manager) = setup();
    connect(&manager).await;

    manager.send(vec![0x0a], None);
    manager.send(vec![0x0b], None);
    manager.send(vec![0x0c], None);
    settle().await;

    assert_eq!(mock.written(), vec![vec![0x0a], vec![0x0b], vec![0x0c]]);
    assert_eq!(manager.bytes_sent(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_overflow_drops_newest_sends() {
    let (mock, manager) = setup();
    connect(&manager).await;
    let mut events = manager.subscribe_events();
    let completed = Arc::new(AtomicUsize::new(0));

    mock.hold_writes();
    for i in 0..150u8 {
        let completed = completed.clone();
        manager.send(
            vec![i],
            Some(Box::new(move |result| {
                assert!(result.is_ok());
                completed.fetch_add(1, Ordering::SeqCst);
            })),
        );
    }
    settle().await;
    assert_eq!(manager.queue_len(), 150);
    assert_eq!(mock.written().len(), 1);

    mock.release_writes();
    settle().await;

    let expected: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i]).collect();
    assert_eq!(mock.written(), expected);
    assert_eq!(completed.load(Ordering::SeqCst), 100);
    assert_eq!(manager.bytes_sent(), 100);
    assert_eq!(
        drain_events(&mut events),
        vec![LinkEvent::QueueOverflow { dropped: 50 }]
    );
    assert!(!manager.is_draining());
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_does_not_stop_draining() {
    let (mock, manager) = setup();
    connect(&manager).await;
    let results = Arc::new(Mutex::new(Vec::new()));

    mock.set_fail_writes(true);
    for payload in [vec![0x01], vec![0x02]] {
        let results = results.clone();
        manager.send(
            payload,
            Some(Box::new(move |result| results.lock().push(result.is_ok()))),
        );
    }
    settle().await;

    assert_eq!(*results.lock(), vec![false, false]);
    assert_eq!(mock.written(), vec![vec![0x01], vec![0x02]]);
    assert_eq!(manager.bytes_sent(), 0);

    mock.set_fail_writes(false);
    manager.write(vec![0x03, 0x04]).await.unwrap();
    assert_eq!(manager.bytes_sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_discards_pending_sends() {
    let (mock, manager) = setup();
    connect(&manager).await;
    let completed = Arc::new(AtomicUsize::new(0));

    mock.hold_writes();
    for payload in [vec![0x01], vec![0x02]] {
        let completed = completed.clone();
        manager.send(
            payload,
            Some(Box::new(move |_| {
                completed.fetch_add(1, Ordering::SeqCst);
            })),
        );
    }
    settle().await;

    manager.disconnect().await;
    mock.release_writes();
    settle().await;

    assert_eq!(mock.written(), vec![vec![0x01]]);
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    assert_eq!(manager.queue_len(), 0);
    assert!(!manager.is_draining());
}

// =============================================================================
// Listeners
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_data_listeners_receive_inbound_bytes() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = received.clone();
    manager.add_data_listener(move |data| sink.lock().extend_from_slice(&data.data));

    mock.inject_data(info.id, vec![0x10, 0x11]);
    mock.inject_data(info.id, vec![0x12]);
    settle().await;

    assert_eq!(*received.lock(), vec![0x10, 0x11, 0x12]);
    assert_eq!(manager.bytes_received(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_removed_listener_is_not_called() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let id = manager.add_data_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(manager.remove_listener(id));
    assert!(!manager.remove_listener(id));

    mock.inject_data(info.id, vec![0x01]);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_detaches_listeners() {
    let (mock, manager) = setup();
    connect(&manager).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    manager.add_data_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    manager.add_error_listener(|_| {});
    manager.disconnect().await;

    assert_eq!(manager.listener_count(ListenerKind::Data), 0);
    assert_eq!(manager.listener_count(ListenerKind::Error), 0);

    let info = connect(&manager).await;
    mock.inject_data(info.id, vec![0x01]);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.bytes_received(), 1);
}

// =============================================================================
// Recovery
// =============================================================================

fn status_queries(mock: &MockTransport) -> usize {
    mock.calls()
        .iter()
        .filter(|call| matches!(call, TransportCall::GetInfo { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_system_error_recovers_once() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    let mut events = manager.subscribe_events();

    mock.inject_error(info.id, ReceiveErrorKind::SystemError);
    mock.inject_error(info.id, ReceiveErrorKind::SystemError);
    settle().await;

    assert_eq!(status_queries(&mock), 1);
    assert!(mock.calls().contains(&TransportCall::SetPaused {
        id: info.id,
        paused: false
    }));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.consecutive_failures(), 0);
    assert!(drain_events(&mut events).contains(&LinkEvent::Recovered { id: info.id }));
}

#[tokio::test(start_paused = true)]
async fn test_other_errors_are_only_reported() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    let mut events = manager.subscribe_events();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    manager.add_error_listener(move |err| sink.lock().push(err.kind));
    mock.inject_error(info.id, ReceiveErrorKind::FrameError);
    mock.inject_error(info.id, ReceiveErrorKind::DeviceLost);
    settle().await;

    assert_eq!(
        *seen.lock(),
        vec![ReceiveErrorKind::FrameError, ReceiveErrorKind::DeviceLost]
    );
    assert_eq!(status_queries(&mock), 0);
    assert_eq!(manager.consecutive_failures(), 0);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        drain_events(&mut events),
        vec![
            LinkEvent::ReceiveError {
                id: info.id,
                kind: ReceiveErrorKind::FrameError
            },
            LinkEvent::ReceiveError {
                id: info.id,
                kind: ReceiveErrorKind::DeviceLost
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_escalates_and_requests_reconnect() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    let mut events = manager.subscribe_events();
    mock.set_stuck_paused(true);

    mock.inject_error(info.id, ReceiveErrorKind::SystemError);
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!mock.is_open(info.id));

    let events = drain_events(&mut events);
    assert!(matches!(
        events.as_slice(),
        [
            LinkEvent::ReceiveError { .. },
            LinkEvent::Unrecoverable { .. },
            LinkEvent::Closed { .. },
            LinkEvent::ReconnectRequested { path, options },
        ] if path == "COM-TEST" && options.bitrate == 115200
    ));
}

#[tokio::test(start_paused = true)]
async fn test_status_failure_escalates() {
    let (mock, manager) = setup();
    let info = connect(&manager).await;
    mock.set_fail_info(true);

    mock.inject_error(info.id, ReceiveErrorKind::SystemError);
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(mock.calls().contains(&TransportCall::Close { id: info.id }));
}

#[tokio::test(start_paused = true)]
async fn test_idle_host_gets_no_reconnect_request() {
    let (mock, manager) = setup();
    let manager = manager.with_host(|| false);
    let info = connect(&manager).await;
    let mut events = manager.subscribe_events();
    mock.set_stuck_paused(true);

    mock.inject_error(info.id, ReceiveErrorKind::SystemError);
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, LinkEvent::ReconnectRequested { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_reopens_port() {
    let mut config = LinkConfig {
        transport: TransportConfig::Mock(MockConfig::default()),
        ..Default::default()
    };
    config.recovery.auto_reconnect = true;
    let (mock, manager) = setup_with(config);
    let first = connect(&manager).await;
    mock.set_stuck_paused(true);

    mock.inject_error(first.id, ReceiveErrorKind::SystemError);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    let second = manager.connection_id().unwrap();
    assert_ne!(second, first.id);
    assert!(mock.is_open(second));
}
