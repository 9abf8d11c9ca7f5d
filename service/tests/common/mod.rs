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

//! In-process relay used by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use relaymux_protocol::consts::PING_OFFLINE;
use relaymux_protocol::{Headers, ServiceCodec, ServiceMessage};
use relaymux_service::{
    BoxError, ClientConnection, ConnectRequest, ConnectionDelegate, ConnectionFactory,
    HubServiceEndpoint, MemoryConnection, MemoryConnectionFactory, MemoryListener,
    ReconnectPolicy, ServiceConnectionId, ServiceEndpoint, ServiceOptions, delegate_fn,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// How long helpers wait before failing a test
pub const WAIT: Duration = Duration::from_secs(5);

/// How the relay answers handshakes
#[derive(Debug, Clone)]
pub enum HandshakeMode {
    Accept,
    Reject(String),
    Ignore,
}

/// Relay side of one accepted service connection
#[derive(Debug)]
pub struct RelayConnection {
    pub id: ServiceConnectionId,
    pub endpoint: String,
    pub request: ConnectRequest,
    pub handshake: ServiceMessage,
    outbound: mpsc::UnboundedSender<ServiceMessage>,
    kill: CancellationToken,
}

impl RelayConnection {
    /// Send a message to the server
    pub fn send(&self, message: ServiceMessage) {
        let _ = self.outbound.send(message);
    }

    /// Open a client connection
    pub fn open(&self, connection_id: &str) {
        self.open_with_headers(connection_id, Headers::new());
    }

    /// Open a client connection with headers
    pub fn open_with_headers(&self, connection_id: &str, headers: Headers) {
        self.send(ServiceMessage::OpenConnection {
            connection_id: connection_id.to_string(),
            claims: vec![("sub".to_string(), "user-1".to_string())],
            headers,
            query_string: Some("room=lobby".to_string()),
        });
    }

    /// Send client data to the server
    pub fn data(&self, connection_id: &str, payload: impl Into<Bytes>) {
        self.send(ServiceMessage::connection_data(connection_id, payload));
    }

    /// Close a client connection
    pub fn close(&self, connection_id: &str) {
        self.send(ServiceMessage::close(connection_id, None));
    }

    /// Drop the transport
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

/// A relay answering over [`MemoryConnectionFactory`] streams
pub struct FakeRelay {
    factory: Arc<MemoryConnectionFactory>,
    handshake: Arc<Mutex<HandshakeMode>>,
    connections: Arc<Mutex<Vec<Arc<RelayConnection>>>>,
    accepted: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<RelayConnection>>>,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<(ServiceConnectionId, ServiceMessage)>>,
}

impl FakeRelay {
    /// Start a relay accepting every handshake
    pub fn start() -> Self {
        let (factory, listener) = MemoryConnectionFactory::pair();
        let handshake = Arc::new(Mutex::new(HandshakeMode::Accept));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&handshake),
            Arc::clone(&connections),
            accepted_tx,
            messages_tx,
        ));

        Self {
            factory: Arc::new(factory),
            handshake,
            connections,
            accepted: tokio::sync::Mutex::new(accepted_rx),
            messages: tokio::sync::Mutex::new(messages_rx),
        }
    }

    /// Factory servers connect through
    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        self.factory.clone()
    }

    /// The concrete memory factory
    pub fn memory_factory(&self) -> &Arc<MemoryConnectionFactory> {
        &self.factory
    }

    /// Change how later handshakes are answered
    pub fn set_handshake(&self, mode: HandshakeMode) {
        *self.handshake.lock().unwrap() = mode;
    }

    /// Wait for the next accepted service connection
    pub async fn next_connection(&self) -> Arc<RelayConnection> {
        timeout(WAIT, self.accepted.lock().await.recv())
            .await
            .expect("no service connection accepted in time")
            .expect("relay stopped")
    }

    /// The live relay side of a service connection
    pub fn connection(&self, id: ServiceConnectionId) -> Option<Arc<RelayConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .find(|connection| connection.id == id)
            .cloned()
    }

    /// Number of accepted service connections so far
    pub fn accepted_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Wait for the next message the server sent (keep-alive pings excluded)
    pub async fn next_message(&self) -> (ServiceConnectionId, ServiceMessage) {
        self.try_next_message(WAIT)
            .await
            .expect("no message from the server in time")
    }

    /// Wait up to `wait` for the next message the server sent
    pub async fn try_next_message(
        &self,
        wait: Duration,
    ) -> Option<(ServiceConnectionId, ServiceMessage)> {
        timeout(wait, self.messages.lock().await.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn accept_loop(
    listener: MemoryListener,
    handshake: Arc<Mutex<HandshakeMode>>,
    connections: Arc<Mutex<Vec<Arc<RelayConnection>>>>,
    accepted: mpsc::UnboundedSender<Arc<RelayConnection>>,
    messages: mpsc::UnboundedSender<(ServiceConnectionId, ServiceMessage)>,
) {
    while let Some(connection) = listener.accept().await {
        let mode = handshake.lock().unwrap().clone();
        tokio::spawn(serve(
            connection,
            mode,
            Arc::clone(&connections),
            accepted.clone(),
            messages.clone(),
        ));
    }
}

async fn serve(
    connection: MemoryConnection,
    mode: HandshakeMode,
    connections: Arc<Mutex<Vec<Arc<RelayConnection>>>>,
    accepted: mpsc::UnboundedSender<Arc<RelayConnection>>,
    messages: mpsc::UnboundedSender<(ServiceConnectionId, ServiceMessage)>,
) {
    let MemoryConnection {
        endpoint,
        request,
        stream,
    } = connection;
    let (mut sink, mut frames) = Framed::new(stream, ServiceCodec::new()).split();
    let Some(Ok(handshake)) = frames.next().await else {
        return;
    };

    match mode {
        HandshakeMode::Accept => {}
        HandshakeMode::Reject(error) => {
            let _ = sink
                .send(ServiceMessage::HandshakeResponse {
                    error_message: Some(error),
                })
                .await;
            return;
        }
        HandshakeMode::Ignore => {
            while let Some(Ok(_)) = frames.next().await {}
            return;
        }
    }

    let id = request.service_connection_id;
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let relay_connection = Arc::new(RelayConnection {
        id,
        endpoint: endpoint.name().to_string(),
        request,
        handshake,
        outbound,
        kill: kill.clone(),
    });
    connections.lock().unwrap().push(Arc::clone(&relay_connection));
    let _ = accepted.send(relay_connection);

    if sink
        .send(ServiceMessage::HandshakeResponse {
            error_message: None,
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            () = kill.cancelled() => break,
            Some(message) = outbound_rx.recv() => {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            frame = frames.next() => match frame {
                Some(Ok(ServiceMessage::Ping { messages: entries })) => {
                    if entries.iter().any(|(key, _)| key == PING_OFFLINE) {
                        let _ = messages.send((id, ServiceMessage::Ping { messages: entries }));
                    }
                    if sink.send(ServiceMessage::ping()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(message)) => {
                    let _ = messages.send((id, message));
                }
                _ => break,
            },
        }
    }
}

/// Options with short timeouts and fast reconnects
pub fn fast_options() -> ServiceOptions {
    ServiceOptions::default()
        .with_connection_count(1)
        .with_handshake_timeout(Duration::from_secs(2))
        .with_keep_alive_interval(Duration::from_millis(200))
        .with_service_timeout(Duration::from_secs(5))
        .with_close_timeout(Duration::from_millis(500))
        .with_migration_handshake_timeout(Duration::from_millis(500))
        .with_reconnect(
            ReconnectPolicy::default()
                .with_initial_delay(Duration::from_millis(300))
                .with_max_delay(Duration::from_secs(1))
                .with_max_jitter(Duration::from_millis(20)),
        )
}

/// A relay endpoint for a hub
pub fn endpoint(hub: &str) -> Arc<HubServiceEndpoint> {
    Arc::new(HubServiceEndpoint::new(hub, service_endpoint("primary")))
}

/// A named relay endpoint
pub fn service_endpoint(name: &str) -> ServiceEndpoint {
    ServiceEndpoint::from_connection_string("Endpoint=http://relay.local;AccessKey=secret")
        .unwrap()
        .with_name(name)
}

/// What a recording application observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Opened(String),
    Data(String, Bytes),
    Closed(String),
}

/// An application that reports everything it sees
pub fn recording_delegate() -> (
    Arc<dyn ConnectionDelegate>,
    mpsc::UnboundedReceiver<AppEvent>,
) {
    let (events, receiver) = mpsc::unbounded_channel();
    let delegate = delegate_fn(move |mut connection: ClientConnection| {
        let events = events.clone();
        async move {
            let id = connection.connection_id().to_string();
            let _ = events.send(AppEvent::Opened(id.clone()));
            while let Some(payload) = connection.recv().await {
                let _ = events.send(AppEvent::Data(id.clone(), payload));
            }
            let _ = events.send(AppEvent::Closed(id));
            Ok::<(), BoxError>(())
        }
    });
    (Arc::new(delegate), receiver)
}

/// An application that sends every payload back
pub fn echo_delegate() -> Arc<dyn ConnectionDelegate> {
    Arc::new(delegate_fn(|mut connection: ClientConnection| async move {
        while let Some(payload) = connection.recv().await {
            connection.send(payload).await?;
        }
        Ok::<(), BoxError>(())
    }))
}

/// Wait for the next application event
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<AppEvent>) -> AppEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no application event in time")
        .expect("application event channel closed")
}

/// Poll `condition` until it holds or [`WAIT`] elapses
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
