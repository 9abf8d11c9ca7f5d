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

//! A physical service connection to the relay
//!
//! One [`ServiceConnection`] owns one transport. After the handshake a single
//! driver task reads and dispatches relay messages and sends keep-alive pings;
//! every tunneled client connection gets its own task running the
//! application delegate, the inbound forwarder and the outgoing pump. When the
//! transport fails or [`ServiceConnection::stop`] is called, the driver tears
//! down every client connection the service connection owns, each bounded by
//! the configured close timeout, before the status becomes terminal.

use crate::ack::AckHandler;
use crate::context::{ClientConnectionContext, TransportParts, skip_handshake_response};
use crate::endpoint::HubServiceEndpoint;
use crate::handler::ConnectionDelegate;
use crate::manager::ClientConnectionManager;
use crate::metrics::RelayMetrics;
use crate::random::{RandomSource, ThreadRandom};
use crate::scope::ConnectionScope;
use crate::shutdown::GracefulShutdownMode;
use crate::transport::{BoxedTransport, ConnectRequest, ConnectionFactory};
use crate::types::{ServiceConnectionId, ServiceConnectionInfo, ServiceConnectionStatus};
use crate::{BoxError, RelayError, Result, ServiceOptions};
use bytes::Bytes;
use dashmap::DashSet;
use futures::{FutureExt, SinkExt, StreamExt};
use relaymux_protocol::consts::{
    PING_CONNECTION_COUNT, PING_OFFLINE, PING_OFFLINE_FIN, PING_OFFLINE_MIGRATE,
};
use relaymux_protocol::{
    BinaryServiceProtocol, CodecError, Headers, ServiceCodec, ServiceConnectionType,
    ServiceMessage, ServiceProtocol,
};
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, instrument, trace, warn};

type Reader = FramedRead<ReadHalf<BoxedTransport>, ServiceCodec<dyn ServiceProtocol>>;
type Writer = FramedWrite<WriteHalf<BoxedTransport>, ServiceCodec<dyn ServiceProtocol>>;

/// Error text sent to the relay when an open arrives while going offline
pub const OFFLINE_CLOSE_REASON: &str = "service connection is going offline";

/// Collaborators shared by every service connection of a host
#[derive(Clone)]
pub struct ConnectionDependencies {
    /// Opens physical transports
    pub factory: Arc<dyn ConnectionFactory>,
    /// Serializes service messages
    pub protocol: Arc<dyn ServiceProtocol>,
    /// Application run for each client connection
    pub delegate: Arc<dyn ConnectionDelegate>,
    /// Registry of live client connections
    pub client_manager: Arc<ClientConnectionManager>,
    /// Correlates ackable messages
    pub ack_handler: Arc<AckHandler>,
    /// Metrics sink
    pub metrics: Arc<RelayMetrics>,
    /// Randomness for ids and selection
    pub random: Arc<dyn RandomSource>,
    /// Options
    pub options: Arc<ServiceOptions>,
}

impl ConnectionDependencies {
    /// Create dependencies with the binary protocol and fresh shared state
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        delegate: Arc<dyn ConnectionDelegate>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            factory,
            protocol: Arc::new(
                BinaryServiceProtocol::new().with_max_frame_size(options.max_frame_size),
            ),
            delegate,
            client_manager: Arc::new(ClientConnectionManager::new()),
            ack_handler: Arc::new(AckHandler::new()),
            metrics: Arc::new(RelayMetrics::new()),
            random: Arc::new(ThreadRandom),
            options: Arc::new(options),
        }
    }

    /// Use a different protocol
    pub fn with_protocol(mut self, protocol: Arc<dyn ServiceProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Use a different application delegate
    pub fn with_delegate(mut self, delegate: Arc<dyn ConnectionDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Share an existing client registry
    pub fn with_client_manager(mut self, client_manager: Arc<ClientConnectionManager>) -> Self {
        self.client_manager = client_manager;
        self
    }

    /// Share an existing metrics sink
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use a different randomness source
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }
}

impl fmt::Debug for ConnectionDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDependencies")
            .field("options", &self.options)
            .field("client_connections", &self.client_manager.count())
            .finish_non_exhaustive()
    }
}

/// A physical, multiplexed connection to one relay endpoint
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct ServiceConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ServiceConnectionId,
    hub: String,
    endpoint: Arc<HubServiceEndpoint>,
    connection_type: ServiceConnectionType,
    target: Option<String>,
    deps: ConnectionDependencies,
    span: Span,

    status: AtomicU8,
    started: AtomicBool,
    offline: AtomicBool,
    writer: tokio::sync::Mutex<Option<Writer>>,
    clients: DashSet<String>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    terminated: CancellationToken,

    created_at: std::time::Instant,
    epoch: Instant,
    last_received_ms: AtomicU64,
}

impl ServiceConnection {
    /// Create a connection in the `Connecting` state; call [`start`](Self::start)
    pub fn new(
        hub: impl Into<String>,
        endpoint: Arc<HubServiceEndpoint>,
        connection_type: ServiceConnectionType,
        target: Option<String>,
        deps: ConnectionDependencies,
    ) -> Self {
        Self::with_shutdown_token(
            hub,
            endpoint,
            connection_type,
            target,
            deps,
            CancellationToken::new(),
        )
    }

    /// Create a connection that also stops when `shutdown` is cancelled
    pub fn with_shutdown_token(
        hub: impl Into<String>,
        endpoint: Arc<HubServiceEndpoint>,
        connection_type: ServiceConnectionType,
        target: Option<String>,
        deps: ConnectionDependencies,
        shutdown: CancellationToken,
    ) -> Self {
        let hub = hub.into();
        let id = ServiceConnectionId::new(deps.random.uuid());
        let span = info_span!(
            "service_connection",
            service_connection_id = %id,
            hub = %hub,
            endpoint = %endpoint.name()
        );
        Self {
            inner: Arc::new(Inner {
                id,
                hub,
                endpoint,
                connection_type,
                target,
                deps,
                span,
                status: AtomicU8::new(ServiceConnectionStatus::Connecting.as_u8()),
                started: AtomicBool::new(false),
                offline: AtomicBool::new(false),
                writer: tokio::sync::Mutex::new(None),
                clients: DashSet::new(),
                tasks: Mutex::new(JoinSet::new()),
                shutdown,
                terminated: CancellationToken::new(),
                created_at: std::time::Instant::now(),
                epoch: Instant::now(),
                last_received_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Connection id
    pub fn id(&self) -> ServiceConnectionId {
        self.inner.id
    }

    /// Hub served by this connection
    pub fn hub(&self) -> &str {
        &self.inner.hub
    }

    /// Endpoint this connection targets
    pub fn endpoint(&self) -> &Arc<HubServiceEndpoint> {
        &self.inner.endpoint
    }

    /// Requested connection type
    pub fn connection_type(&self) -> ServiceConnectionType {
        self.inner.connection_type
    }

    /// Current status
    pub fn status(&self) -> ServiceConnectionStatus {
        self.inner.status()
    }

    /// Whether the connection is carrying traffic
    pub fn is_connected(&self) -> bool {
        self.status() == ServiceConnectionStatus::Connected
    }

    /// Whether new client connections are refused
    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::Acquire)
    }

    /// Number of client connections this connection owns
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Ids of the client connections this connection owns
    pub fn client_connection_ids(&self) -> Vec<String> {
        self.inner.clients.iter().map(|id| id.key().clone()).collect()
    }

    /// Point-in-time view of the connection
    pub fn info(&self) -> ServiceConnectionInfo {
        ServiceConnectionInfo {
            id: self.inner.id,
            status: self.status(),
            client_connections: self.client_count(),
            created_at: self.inner.created_at,
        }
    }

    /// Connect, handshake and start the driver task.
    ///
    /// A connection can be started once. On failure the connection is
    /// `Disconnected` and the error is returned.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(RelayError::Other(format!(
                "service connection {} already started",
                inner.id
            )));
        }
        inner.start().instrument(inner.span.clone()).await
    }

    /// Write a message to the relay.
    ///
    /// A failed write tears the connection down and returns the error.
    pub async fn write(&self, message: ServiceMessage) -> Result<()> {
        self.inner.write(message).await
    }

    /// Refuse new client connections and tell the relay this server is leaving
    #[instrument(skip(self), fields(service_connection_id = %self.inner.id))]
    pub async fn offline(&self, migratable: bool) -> Result<()> {
        if self.inner.offline.swap(true, Ordering::AcqRel) || !self.is_connected() {
            return Ok(());
        }
        let state = if migratable {
            PING_OFFLINE_MIGRATE
        } else {
            PING_OFFLINE_FIN
        };
        info!(state, "Going offline");
        self.inner
            .write(ServiceMessage::Ping {
                messages: vec![(PING_OFFLINE.to_string(), state.to_string())],
            })
            .await
    }

    /// Stop the connection and wait for its teardown to finish
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        if !inner.started.swap(true, Ordering::AcqRel) {
            inner.set_status(ServiceConnectionStatus::Disconnected);
            inner.terminated.cancel();
        }
        inner.terminated.cancelled().await;
    }

    /// Wait until the connection has fully terminated
    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await;
    }

    /// Whether the connection has fully terminated
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }
}

impl fmt::Debug for ServiceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConnection")
            .field("id", &self.inner.id)
            .field("hub", &self.inner.hub)
            .field("endpoint", &self.inner.endpoint.name())
            .field("status", &self.status())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn status(&self) -> ServiceConnectionStatus {
        ServiceConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ServiceConnectionStatus) -> ServiceConnectionStatus {
        ServiceConnectionStatus::from_u8(self.status.swap(status.as_u8(), Ordering::AcqRel))
    }

    fn options(&self) -> &ServiceOptions {
        &self.deps.options
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_received_ms.store(elapsed, Ordering::Release);
    }

    fn silence(&self) -> Duration {
        let last = Duration::from_millis(self.last_received_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        let handshake = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(RelayError::ConnectionClosed),
            result = self.connect_and_handshake() => result,
        };

        match handshake {
            Ok((reader, writer)) => {
                *self.writer.lock().await = Some(writer);
                self.touch();
                self.set_status(ServiceConnectionStatus::Connected);
                self.deps.metrics.service_connection_opened();
                info!("Service connection started");
                tokio::spawn(Arc::clone(self).run(reader).instrument(self.span.clone()));
                Ok(())
            }
            Err(err) => {
                match err {
                    RelayError::HandshakeFailed(_) | RelayError::HandshakeTimeout(_) => {
                        self.deps.metrics.handshake_failure();
                    }
                    _ => self.deps.metrics.connection_error(),
                }
                warn!(%err, "Service connection failed to start");
                self.set_status(ServiceConnectionStatus::Disconnected);
                self.deps.factory.dispose(self.id).await;
                self.terminated.cancel();
                Err(err)
            }
        }
    }

    async fn connect_and_handshake(&self) -> Result<(Reader, Writer)> {
        let request = ConnectRequest {
            hub: self.hub.clone(),
            service_connection_id: self.id,
            connection_type: self.connection_type,
            target: self.target.clone(),
        };
        let transport = self.deps.factory.connect(&self.endpoint, &request).await?;
        let (read, write) = tokio::io::split(transport);
        let codec = ServiceCodec::with_protocol(Arc::clone(&self.deps.protocol));
        let mut reader = FramedRead::new(read, codec.clone());
        let mut writer = FramedWrite::new(write, codec);

        let migration_level =
            u8::from(self.options().graceful_shutdown.mode == GracefulShutdownMode::MigrateClients);
        writer
            .send(ServiceMessage::HandshakeRequest {
                version: self.deps.protocol.version(),
                connection_type: self.connection_type,
                target: self.target.clone(),
                migration_level,
            })
            .await?;

        let timeout = self.options().handshake_timeout;
        match tokio::time::timeout(timeout, reader.next()).await {
            Err(_) => Err(RelayError::HandshakeTimeout(timeout)),
            Ok(None) => Err(RelayError::HandshakeFailed(
                "relay closed the connection during handshake".to_string(),
            )),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(Some(Ok(ServiceMessage::HandshakeResponse {
                error_message: None,
            }))) => Ok((reader, writer)),
            Ok(Some(Ok(ServiceMessage::HandshakeResponse {
                error_message: Some(message),
            }))) => Err(RelayError::HandshakeFailed(message)),
            Ok(Some(Ok(other))) => Err(RelayError::HandshakeFailed(format!(
                "expected a handshake response, received {}",
                other.kind()
            ))),
        }
    }

    async fn run(self: Arc<Self>, reader: Reader) {
        let result = tokio::select! {
            result = self.process_incoming(reader) => result,
            result = self.keep_alive() => result,
            () = self.shutdown.cancelled() => Ok(()),
        };
        match result {
            Ok(()) => debug!("Service connection loop ended"),
            Err(err) => warn!(%err, "Service connection lost"),
        }
        self.teardown().await;
    }

    async fn process_incoming(self: &Arc<Self>, mut reader: Reader) -> Result<()> {
        while let Some(message) = reader.next().await {
            let message = message.inspect_err(|err| match err {
                CodecError::Io(_) => self.deps.metrics.connection_error(),
                _ => self.deps.metrics.protocol_error(),
            })?;
            self.touch();
            self.deps.metrics.message_received(payload_len(&message));
            self.dispatch(message).await?;
        }
        Err(RelayError::ConnectionClosed)
    }

    async fn dispatch(self: &Arc<Self>, message: ServiceMessage) -> Result<()> {
        trace!(kind = %message.kind(), "Dispatching relay message");
        let migrating_out = message.is_migrating_out();
        match message {
            ServiceMessage::OpenConnection {
                connection_id,
                claims,
                headers,
                query_string,
            } => {
                self.on_open(connection_id, claims, headers, query_string)
                    .await?;
            }
            ServiceMessage::CloseConnection {
                connection_id,
                error_message,
                ..
            } => self.on_close(&connection_id, error_message.as_deref(), migrating_out),
            ServiceMessage::ConnectionData {
                connection_id,
                payload,
            } => self.on_data(&connection_id, payload),
            ServiceMessage::Ping { messages } => on_ping(&messages),
            ServiceMessage::Ack {
                ack_id,
                status,
                message,
            } => {
                if !self.deps.ack_handler.trigger(ack_id, status) {
                    debug!(ack_id, ?status, ?message, "Ack without a waiter");
                }
            }
            ServiceMessage::ServiceError { error_message } => {
                error!(%error_message, "Relay reported a service error");
                return Err(RelayError::ServiceError(error_message));
            }
            other => warn!(kind = %other.kind(), "Ignoring unexpected relay message"),
        }
        Ok(())
    }

    async fn on_open(
        self: &Arc<Self>,
        connection_id: String,
        claims: Vec<(String, String)>,
        headers: Headers,
        query_string: Option<String>,
    ) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            info!(%connection_id, "Refusing client connection while offline");
            return self
                .write(ServiceMessage::close(
                    connection_id,
                    Some(OFFLINE_CLOSE_REASON.to_string()),
                ))
                .await;
        }

        let context = Arc::new(ClientConnectionContext::new(
            self.hub.clone(),
            self.id,
            connection_id.clone(),
            claims,
            headers,
            query_string,
            self.options().application_buffer,
        ));
        if let Err(err) = self
            .deps
            .client_manager
            .add_client_connection(Arc::clone(&context))
        {
            error!(%connection_id, %err, "Rejecting client connection");
            return Ok(());
        }
        self.clients.insert(connection_id);
        self.deps.metrics.client_connection_opened();

        let Some(parts) = context.take_parts() else {
            return Ok(());
        };
        debug!(
            connection_id = %context.connection_id(),
            migrated = context.is_migrated(),
            "Client connection opened"
        );
        let inner = Arc::clone(self);
        self.spawn(async move { inner.run_client(context, parts).await });
        Ok(())
    }

    fn on_close(self: &Arc<Self>, connection_id: &str, error: Option<&str>, migrating_out: bool) {
        let Some(context) = self.remove_client(connection_id) else {
            debug!(connection_id, "Close for unknown client connection");
            return;
        };
        if migrating_out {
            context.mark_migrating_out();
            info!(connection_id, "Client connection migrating to another server");
        } else {
            debug!(connection_id, ?error, "Relay closed client connection");
        }
        let inner = Arc::clone(self);
        self.spawn(async move { inner.perform_disconnect(context).await });
    }

    fn on_data(&self, connection_id: &str, payload: Bytes) {
        let context = if self.clients.contains(connection_id) {
            self.deps.client_manager.client_connection(connection_id)
        } else {
            None
        };
        match context {
            Some(context) => {
                if !context.enqueue_incoming(payload) {
                    trace!(connection_id, "Dropping data for closing client connection");
                    self.deps.metrics.message_dropped();
                }
            }
            None => {
                warn!(connection_id, "Dropping data for unknown client connection");
                self.deps.metrics.message_dropped();
            }
        }
    }

    async fn run_client(self: Arc<Self>, context: Arc<ClientConnectionContext>, parts: TransportParts) {
        let TransportParts {
            application,
            outgoing,
            inbound,
        } = parts;
        let application_done = CancellationToken::new();

        let delegate = Arc::clone(&self.deps.delegate);
        let app = {
            let context = Arc::clone(&context);
            let application_done = application_done.clone();
            async move {
                // hub code sent from this client's task shares one scope
                let result =
                    AssertUnwindSafe(ConnectionScope::run(delegate.on_connected(application)))
                        .catch_unwind()
                        .await;
                application_done.cancel();
                context.complete_incoming().await;
                result.unwrap_or_else(|_| Err(BoxError::from("application panicked")))
            }
        };

        let (result, (), ()) = tokio::join!(
            app,
            self.process_outgoing(&context, outgoing, application_done.clone()),
            context.forward_incoming(inbound),
        );

        let error = match result {
            Ok(()) => None,
            Err(err) => {
                warn!(connection_id = %context.connection_id(), %err, "Application ended with an error");
                Some(err.to_string())
            }
        };
        if self.remove_client(context.connection_id()).is_some() {
            debug!(connection_id = %context.connection_id(), "Application closed client connection");
            if let Err(err) = self
                .write(ServiceMessage::close(context.connection_id(), error))
                .await
            {
                debug!(connection_id = %context.connection_id(), %err, "Failed to send close");
            }
        }
        context.mark_completed();
    }

    async fn process_outgoing(
        &self,
        context: &ClientConnectionContext,
        mut outgoing: mpsc::Receiver<Bytes>,
        application_done: CancellationToken,
    ) {
        if context.is_migrated() {
            let timeout = self.options().migration_handshake_timeout;
            let first = tokio::select! {
                biased;
                () = context.outgoing_aborted().cancelled() => return,
                first = tokio::time::timeout(timeout, outgoing.recv()) => first,
            };
            match first {
                Ok(Some(payload)) => {
                    let payload = skip_handshake_response(payload);
                    if !payload.is_empty() && !self.forward(context, payload).await {
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => debug!(
                    connection_id = %context.connection_id(),
                    "No handshake response from migrated application"
                ),
            }
        }

        let mut draining = false;
        loop {
            let payload = tokio::select! {
                biased;
                () = context.outgoing_aborted().cancelled() => break,
                () = application_done.cancelled(), if !draining => {
                    draining = true;
                    outgoing.close();
                    continue;
                }
                payload = outgoing.recv() => payload,
            };
            let Some(payload) = payload else { break };
            if !self.forward(context, payload).await {
                break;
            }
        }
    }

    async fn forward(&self, context: &ClientConnectionContext, payload: Bytes) -> bool {
        let message = ServiceMessage::connection_data(context.connection_id(), payload);
        match self.write(message).await {
            Ok(()) => true,
            Err(err) => {
                debug!(connection_id = %context.connection_id(), %err, "Stopped forwarding client data");
                false
            }
        }
    }

    async fn perform_disconnect(&self, context: Arc<ClientConnectionContext>) {
        context.enqueue_completion();
        let timeout = self.options().close_timeout;
        if tokio::time::timeout(timeout, context.completed()).await.is_err() {
            warn!(
                connection_id = %context.connection_id(),
                ?timeout,
                "Client connection did not close in time, aborting"
            );
            context.abort_application();
            context.abort_outgoing();
        }
    }

    fn remove_client(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        self.clients.remove(connection_id)?;
        let context = self.deps.client_manager.remove_client_connection(connection_id)?;
        self.deps.metrics.client_connection_closed(context.duration());
        Some(context)
    }

    async fn keep_alive(&self) -> Result<()> {
        let interval = self.options().keep_alive_interval;
        let service_timeout = self.options().service_timeout;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let silence = self.silence();
            if silence > service_timeout {
                return Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no message from the relay for {silence:?}"),
                )));
            }
            self.write(ServiceMessage::Ping {
                messages: vec![(
                    PING_CONNECTION_COUNT.to_string(),
                    self.clients.len().to_string(),
                )],
            })
            .await?;
        }
    }

    async fn write(&self, message: ServiceMessage) -> Result<()> {
        let size = payload_len(&message);
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(RelayError::ConnectionClosed);
        };
        if let Err(err) = sink.send(message).await {
            // encoder errors leave the stream untouched; only I/O loss is fatal
            if !matches!(err, CodecError::Io(_)) {
                self.deps.metrics.protocol_error();
                warn!(%err, "Failed to encode service message");
                return Err(err.into());
            }
            *writer = None;
            drop(writer);
            self.deps.metrics.connection_error();
            self.shutdown.cancel();
            return Err(err.into());
        }
        self.deps.metrics.message_sent(size);
        Ok(())
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        while let Some(result) = tasks.try_join_next() {
            if matches!(&result, Err(err) if err.is_panic()) {
                error!("Client connection task panicked");
            }
        }
        tasks.spawn(task.instrument(self.span.clone()));
    }

    async fn teardown(self: &Arc<Self>) {
        if self.set_status(ServiceConnectionStatus::Disconnected)
            == ServiceConnectionStatus::Connected
        {
            self.deps.metrics.service_connection_closed();
        }
        self.shutdown.cancel();
        self.cleanup_client_connections().await;

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        tasks.shutdown().await;

        let close_timeout = self.options().close_timeout;
        let writer = match tokio::time::timeout(close_timeout, self.writer.lock()).await {
            Ok(mut writer) => writer.take(),
            Err(_) => None,
        };
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(
                close_timeout,
                SinkExt::<ServiceMessage>::close(&mut writer),
            )
            .await;
        }
        self.deps.factory.dispose(self.id).await;
        info!("Service connection stopped");
        self.terminated.cancel();
    }

    async fn cleanup_client_connections(self: &Arc<Self>) {
        let contexts: Vec<_> = self
            .clients
            .iter()
            .map(|id| id.key().clone())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|id| self.remove_client(&id))
            .collect();
        if contexts.is_empty() {
            return;
        }
        info!(count = contexts.len(), "Closing client connections");
        futures::future::join_all(
            contexts
                .into_iter()
                .map(|context| self.perform_disconnect(context)),
        )
        .await;
    }
}

fn on_ping(messages: &[(String, String)]) {
    match messages.iter().find(|(key, _)| key == PING_OFFLINE) {
        Some((_, state)) => info!(%state, "Relay instance is going offline"),
        None => trace!("Ping from relay"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Payload bytes carried by a message, for throughput metrics
fn payload_len(message: &ServiceMessage) -> usize {
    match message {
        ServiceMessage::ConnectionData { payload, .. } => payload.len(),
        ServiceMessage::MultiConnectionData { payloads, .. }
        | ServiceMessage::BroadcastData { payloads, .. }
        | ServiceMessage::GroupBroadcastData { payloads, .. }
        | ServiceMessage::MultiGroupBroadcastData { payloads, .. }
        | ServiceMessage::UserData { payloads, .. }
        | ServiceMessage::MultiUserData { payloads, .. } => payloads.values().map(Bytes::len).sum(),
        _ => 0,
    }
}
