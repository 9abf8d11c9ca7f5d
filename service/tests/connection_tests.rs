//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Service connection behavior against an in-process relay

mod common;

use bytes::Bytes;
use common::{
    AppEvent, FakeRelay, HandshakeMode, RelayConnection, WAIT, echo_delegate, endpoint,
    eventually, fast_options, next_event, recording_delegate,
};
use relaymux_protocol::consts::{HEADER_MIGRATED_FROM, PING_OFFLINE, PING_OFFLINE_FIN};
use relaymux_protocol::{CodecError, Headers, ServiceConnectionType, ServiceMessage};
use relaymux_service::{
    BoxError, ClientConnection, ConnectionDelegate, ConnectionDependencies, ConnectionScope,
    OFFLINE_CLOSE_REASON, RelayError, ServiceConnection, ServiceConnectionStatus, ServiceOptions,
    delegate_fn,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};

/// Helper to build dependencies against the relay
fn dependencies(
    relay: &FakeRelay,
    delegate: Arc<dyn ConnectionDelegate>,
    options: ServiceOptions,
) -> ConnectionDependencies {
    ConnectionDependencies::new(relay.factory(), delegate, options)
}

/// Helper to create an unstarted connection for hub "chat"
fn connection(deps: &ConnectionDependencies) -> ServiceConnection {
    ServiceConnection::new(
        "chat",
        endpoint("chat"),
        ServiceConnectionType::Default,
        None,
        deps.clone(),
    )
}

/// Helper to start a connection and return both sides
async fn connect(
    relay: &FakeRelay,
    delegate: Arc<dyn ConnectionDelegate>,
) -> (ServiceConnection, Arc<RelayConnection>, ConnectionDependencies) {
    let deps = dependencies(relay, delegate, fast_options());
    let connection = connection(&deps);
    connection.start().await.unwrap();
    let relay_side = relay.next_connection().await;
    (connection, relay_side, deps)
}

#[tokio::test]
async fn test_handshake_connects() {
    let relay = FakeRelay::start();
    let (connection, relay_side, _deps) = connect(&relay, echo_delegate()).await;

    assert_eq!(relay_side.id, connection.id());
    assert_eq!(relay_side.request.hub, "chat");
    assert_eq!(
        relay_side.handshake,
        ServiceMessage::HandshakeRequest {
            version: 1,
            connection_type: ServiceConnectionType::Default,
            target: None,
            migration_level: 0,
        }
    );
    assert_eq!(connection.status(), ServiceConnectionStatus::Connected);
    assert!(connection.start().await.is_err());
}

#[tokio::test]
async fn test_handshake_rejected() {
    let relay = FakeRelay::start();
    relay.set_handshake(HandshakeMode::Reject("invalid access key".to_string()));
    let deps = dependencies(&relay, echo_delegate(), fast_options());
    let connection = connection(&deps);

    let result = connection.start().await;
    assert!(matches!(result, Err(RelayError::HandshakeFailed(message)) if message == "invalid access key"));
    assert_eq!(connection.status(), ServiceConnectionStatus::Disconnected);
    assert!(connection.is_terminated());
    assert_eq!(deps.metrics.snapshot().handshake_failures, 1);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let relay = FakeRelay::start();
    relay.set_handshake(HandshakeMode::Ignore);
    let options = fast_options().with_handshake_timeout(Duration::from_millis(200));
    let deps = dependencies(&relay, echo_delegate(), options);
    let connection = connection(&deps);

    let started = Instant::now();
    let result = connection.start().await;
    assert!(matches!(result, Err(RelayError::HandshakeTimeout(_))));
    assert!(started.elapsed() < WAIT);
    assert!(connection.is_terminated());
}

#[tokio::test]
async fn test_client_payload_reaches_application_unchanged() {
    let relay = FakeRelay::start();
    let (delegate, mut events) = recording_delegate();
    let (_connection, relay_side, _deps) = connect(&relay, delegate).await;

    relay_side.open("conn-1");
    assert_eq!(next_event(&mut events).await, AppEvent::Opened("conn-1".to_string()));

    let payload = Bytes::from((0..=255u8).collect::<Vec<_>>());
    relay_side.data("conn-1", payload.clone());
    assert_eq!(
        next_event(&mut events).await,
        AppEvent::Data("conn-1".to_string(), payload)
    );
}

#[tokio::test]
async fn test_inbound_order_preserved() {
    let relay = FakeRelay::start();
    let (delegate, mut events) = recording_delegate();
    let (_connection, relay_side, _deps) = connect(&relay, delegate).await;

    relay_side.open("conn-1");
    next_event(&mut events).await;
    for n in 0..100u32 {
        relay_side.data("conn-1", Bytes::from(n.to_be_bytes().to_vec()));
    }
    for n in 0..100u32 {
        assert_eq!(
            next_event(&mut events).await,
            AppEvent::Data("conn-1".to_string(), Bytes::from(n.to_be_bytes().to_vec()))
        );
    }
}

#[tokio::test]
async fn test_application_output_reaches_relay() {
    let relay = FakeRelay::start();
    let (connection, relay_side, _deps) = connect(&relay, echo_delegate()).await;

    relay_side.open("conn-1");
    relay_side.data("conn-1", "hello");
    let (from, message) = relay.next_message().await;
    assert_eq!(from, connection.id());
    assert_eq!(message, ServiceMessage::connection_data("conn-1", "hello"));
}

#[tokio::test]
async fn test_claims_and_query_string_visible_to_application() {
    let relay = FakeRelay::start();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let delegate = delegate_fn(move |connection: ClientConnection| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send((
                connection.hub().to_string(),
                connection.user_id().map(str::to_string),
                connection.query_string().map(str::to_string),
            ));
            Ok::<(), BoxError>(())
        }
    });
    let (_connection, relay_side, _deps) = connect(&relay, Arc::new(delegate)).await;

    relay_side.open("conn-1");
    let seen = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        seen,
        (
            "chat".to_string(),
            Some("user-1".to_string()),
            Some("room=lobby".to_string())
        )
    );
}

#[tokio::test]
async fn test_relay_close_is_idempotent() {
    let relay = FakeRelay::start();
    let (delegate, mut events) = recording_delegate();
    let (connection, relay_side, deps) = connect(&relay, delegate).await;

    relay_side.open("conn-1");
    next_event(&mut events).await;
    relay_side.close("conn-1");
    relay_side.close("conn-1");

    assert_eq!(next_event(&mut events).await, AppEvent::Closed("conn-1".to_string()));
    assert!(eventually(|| deps.client_manager.is_empty()).await);
    // a close started by the relay is not echoed back
    assert!(
        relay
            .try_next_message(Duration::from_millis(300))
            .await
            .is_none()
    );
    assert!(connection.is_connected());

    let snapshot = deps.metrics.snapshot();
    assert_eq!(snapshot.total_client_connections, 1);
    assert_eq!(snapshot.active_client_connections, 0);
}

#[tokio::test]
async fn test_relay_close_racing_teardown_closes_once() {
    for stop_locally in [false, true, false, true] {
        let relay = FakeRelay::start();
        let (delegate, mut events) = recording_delegate();
        let (connection, relay_side, deps) = connect(&relay, delegate).await;

        relay_side.open("conn-1");
        next_event(&mut events).await;
        relay_side.close("conn-1");
        if stop_locally {
            timeout(WAIT, connection.stop()).await.unwrap();
        } else {
            relay_side.kill();
        }

        assert_eq!(next_event(&mut events).await, AppEvent::Closed("conn-1".to_string()));
        timeout(WAIT, connection.closed()).await.unwrap();
        assert!(
            timeout(Duration::from_millis(300), events.recv())
                .await
                .is_err(),
            "application saw a second close"
        );
        assert!(deps.client_manager.is_empty());
        assert_eq!(connection.client_count(), 0);

        let snapshot = deps.metrics.snapshot();
        assert_eq!(snapshot.total_client_connections, 1);
        assert_eq!(snapshot.active_client_connections, 0);
        assert_eq!(snapshot.active_service_connections, 0);
    }
}

#[tokio::test]
async fn test_oversized_message_keeps_connection_open() {
    let relay = FakeRelay::start();
    let (delegate, mut events) = recording_delegate();
    let deps = dependencies(&relay, delegate, fast_options().with_max_frame_size(1024));
    let connection = connection(&deps);
    connection.start().await.unwrap();
    let relay_side = relay.next_connection().await;

    relay_side.open("conn-a");
    next_event(&mut events).await;

    let result = connection
        .write(ServiceMessage::connection_data("conn-b", vec![0u8; 2048]))
        .await;
    assert!(matches!(
        result,
        Err(RelayError::Codec(CodecError::FrameTooLarge { limit: 1024, .. }))
    ));
    assert!(connection.is_connected());
    assert_eq!(deps.client_manager.count(), 1);
    assert_eq!(deps.metrics.snapshot().protocol_errors, 1);

    // the other client on the same connection is unaffected
    relay_side.data("conn-a", "still here");
    assert_eq!(
        next_event(&mut events).await,
        AppEvent::Data("conn-a".to_string(), Bytes::from_static(b"still here"))
    );
    connection
        .write(ServiceMessage::connection_data("conn-a", "after"))
        .await
        .unwrap();
    let (_, message) = relay.next_message().await;
    assert_eq!(message, ServiceMessage::connection_data("conn-a", "after"));
}

#[tokio::test]
async fn test_application_runs_inside_connection_scope() {
    let relay = FakeRelay::start();
    let (scoped_tx, mut scoped_rx) = mpsc::unbounded_channel();
    let delegate = delegate_fn(move |mut connection: ClientConnection| {
        let scoped_tx = scoped_tx.clone();
        async move {
            let _ = scoped_tx.send(ConnectionScope::current().is_some());
            while connection.recv().await.is_some() {}
            Ok::<(), BoxError>(())
        }
    });
    let (_connection, relay_side, _deps) = connect(&relay, Arc::new(delegate)).await;

    relay_side.open("conn-1");
    let scoped = timeout(WAIT, scoped_rx.recv()).await.unwrap().unwrap();
    assert!(scoped);
}

#[tokio::test]
async fn test_application_error_closes_with_reason() {
    let relay = FakeRelay::start();
    let delegate = delegate_fn(|_connection: ClientConnection| async {
        Err::<(), BoxError>("bad request".into())
    });
    let (_connection, relay_side, deps) = connect(&relay, Arc::new(delegate)).await;

    relay_side.open("conn-1");
    let (_, message) = relay.next_message().await;
    assert_eq!(
        message,
        ServiceMessage::close("conn-1", Some("bad request".to_string()))
    );
    assert!(eventually(|| deps.client_manager.is_empty()).await);
}

#[tokio::test]
async fn test_duplicate_open_is_rejected() {
    let relay = FakeRelay::start();
    let (delegate, mut events) = recording_delegate();
    let (connection, relay_side, deps) = connect(&relay, delegate).await;

    relay_side.open("conn-1");
    relay_side.open("conn-1");
    relay_side.data("conn-1", "after");

    assert_eq!(next_event(&mut events).await, AppEvent::Opened("conn-1".to_string()));
    assert_eq!(
        next_event(&mut events).await,
        AppEvent::Data("conn-1".to_string(), Bytes::from_static(b"after"))
    );
    assert!(
        timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err()
    );
    assert_eq!(deps.client_manager.count(), 1);
    assert_eq!(connection.client_count(), 1);
}

#[tokio::test]
async fn test_data_for_unknown_connection_is_dropped() {
    let relay = FakeRelay::start();
    let (connection, relay_side, deps) = connect(&relay, echo_delegate()).await;

    relay_side.data("ghost", "boo");
    assert!(eventually(|| deps.metrics.snapshot().dropped_messages == 1).await);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_offline_refuses_new_clients() {
    let relay = FakeRelay::start();
    let (connection, relay_side, _deps) = connect(&relay, echo_delegate()).await;

    connection.offline(false).await.unwrap();
    assert!(connection.is_offline());
    let (_, ping) = relay.next_message().await;
    assert_eq!(
        ping,
        ServiceMessage::Ping {
            messages: vec![(PING_OFFLINE.to_string(), PING_OFFLINE_FIN.to_string())],
        }
    );

    relay_side.open("late");
    let (_, message) = relay.next_message().await;
    assert_eq!(
        message,
        ServiceMessage::close("late", Some(OFFLINE_CLOSE_REASON.to_string()))
    );
}

#[tokio::test]
async fn test_migrated_connection_skips_handshake_response() {
    let relay = FakeRelay::start();
    let (migrated_tx, mut migrated_rx) = mpsc::unbounded_channel();
    let delegate = delegate_fn(move |mut connection: ClientConnection| {
        let migrated_tx = migrated_tx.clone();
        async move {
            let _ = migrated_tx.send(connection.is_migrated());
            connection.send(&b"{}\x1ehello"[..]).await?;
            while connection.recv().await.is_some() {}
            Ok::<(), BoxError>(())
        }
    });
    let (_connection, relay_side, _deps) = connect(&relay, Arc::new(delegate)).await;

    let mut headers = Headers::new();
    headers.insert(HEADER_MIGRATED_FROM.to_string(), "server-a".to_string());
    relay_side.open_with_headers("conn-1", headers);

    assert!(timeout(WAIT, migrated_rx.recv()).await.unwrap().unwrap());
    let (_, message) = relay.next_message().await;
    assert_eq!(message, ServiceMessage::connection_data("conn-1", "hello"));
}

#[tokio::test]
async fn test_unresponsive_application_is_aborted_after_close_timeout() {
    let relay = FakeRelay::start();
    let (aborted_tx, mut aborted_rx) = mpsc::unbounded_channel();
    let delegate = delegate_fn(move |connection: ClientConnection| {
        let aborted_tx = aborted_tx.clone();
        async move {
            connection.aborted().cancelled().await;
            let _ = aborted_tx.send(());
            Ok::<(), BoxError>(())
        }
    });
    let (_connection, relay_side, deps) = connect(&relay, Arc::new(delegate)).await;

    relay_side.open("conn-1");
    assert!(eventually(|| deps.client_manager.count() == 1).await);
    let started = Instant::now();
    relay_side.close("conn-1");

    timeout(WAIT, aborted_rx.recv()).await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_transport_loss_completes_clients() {
    let relay = FakeRelay::start();
    let (delegate, mut events) = recording_delegate();
    let (connection, relay_side, deps) = connect(&relay, delegate).await;

    relay_side.open("conn-1");
    next_event(&mut events).await;
    relay_side.kill();

    assert_eq!(next_event(&mut events).await, AppEvent::Closed("conn-1".to_string()));
    timeout(WAIT, connection.closed()).await.unwrap();
    assert_eq!(connection.status(), ServiceConnectionStatus::Disconnected);
    assert!(deps.client_manager.is_empty());
    assert_eq!(deps.metrics.snapshot().active_service_connections, 0);
}

#[tokio::test]
async fn test_service_error_terminates_connection() {
    let relay = FakeRelay::start();
    let (connection, relay_side, _deps) = connect(&relay, echo_delegate()).await;

    relay_side.send(ServiceMessage::ServiceError {
        error_message: "relay restarting".to_string(),
    });
    timeout(WAIT, connection.closed()).await.unwrap();
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_keep_alive_keeps_connection_open() {
    let relay = FakeRelay::start();
    let options = fast_options()
        .with_keep_alive_interval(Duration::from_millis(50))
        .with_service_timeout(Duration::from_millis(300));
    let deps = dependencies(&relay, echo_delegate(), options);
    let connection = connection(&deps);
    connection.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_stop_terminates_connection() {
    let relay = FakeRelay::start();
    let (delegate, mut events) = recording_delegate();
    let (connection, relay_side, deps) = connect(&relay, delegate).await;

    relay_side.open("conn-1");
    next_event(&mut events).await;
    timeout(WAIT, connection.stop()).await.unwrap();

    assert!(connection.is_terminated());
    assert_eq!(connection.status(), ServiceConnectionStatus::Disconnected);
    assert_eq!(next_event(&mut events).await, AppEvent::Closed("conn-1".to_string()));
    assert!(deps.client_manager.is_empty());
    assert!(matches!(
        connection.write(ServiceMessage::ping()).await,
        Err(RelayError::ConnectionClosed)
    ));
}
