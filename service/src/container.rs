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

//! Fixed-size pools of service connections
//!
//! A [`ServiceConnectionContainer`] keeps `connection_count` physical
//! connections to one endpoint for one hub. Each slot is owned by a
//! supervisor task that starts a connection, waits for it to end and replaces
//! it after a backoff delay, so the pool length never changes while the
//! container runs. Writes pick a connected slot: at random, by a stable hash
//! of a partition key, or by the slot the current [`ConnectionScope`] pinned.

use crate::connection::{ConnectionDependencies, ServiceConnection};
use crate::endpoint::HubServiceEndpoint;
use crate::scope::{ConnectionScope, PinnedConnection};
use crate::types::{ServiceConnectionStatus, StatusChange};
use crate::{RelayError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use relaymux_protocol::{ServiceConnectionType, ServiceMessage};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

const OFFLINE_NONE: u8 = 0;
const OFFLINE_FIN: u8 = 1;
const OFFLINE_MIGRATE: u8 = 2;

/// The capability every connection container offers to hub code
#[async_trait]
pub trait ConnectionContainer: Send + Sync + 'static {
    /// Hub served by the container
    fn hub(&self) -> &str;

    /// `Connected` when at least one physical connection is connected
    fn status(&self) -> ServiceConnectionStatus;

    /// Start every connection and wait for each one's first attempt
    async fn start(&self) -> Result<()>;

    /// Stop every connection
    async fn stop(&self) -> Result<()>;

    /// Write through any connected connection
    async fn write(&self, message: ServiceMessage) -> Result<()>;

    /// Write through the connection the partition key maps to
    async fn write_keyed(&self, partition_key: &str, message: ServiceMessage) -> Result<()>;

    /// Write an ackable message and wait for the relay's verdict.
    ///
    /// Returns `true` when the relay applied the operation and `false` when it
    /// reported a failure or no acknowledgement arrived within `timeout`.
    async fn write_ackable(&self, message: ServiceMessage, timeout: Duration) -> Result<bool>;

    /// Refuse new client connections and announce the server is leaving
    async fn offline(&self, migratable: bool) -> Result<()>;
}

/// Stable slot index for a partition key (64-bit FNV-1a)
pub fn partition_index(partition_key: &str, count: usize) -> usize {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = partition_key
        .as_bytes()
        .iter()
        .fold(OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
        });
    (hash % count.max(1) as u64) as usize
}

/// A pool of service connections for one (hub, endpoint) pair
pub struct ServiceConnectionContainer {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    hub: String,
    endpoint: Arc<HubServiceEndpoint>,
    deps: ConnectionDependencies,
    slots: Vec<RwLock<Option<ServiceConnection>>>,
    status_events: broadcast::Sender<StatusChange>,
    supervisors: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    offline: AtomicU8,
}

impl ServiceConnectionContainer {
    /// Create a container with `deps.options.connection_count` slots
    pub fn new(endpoint: Arc<HubServiceEndpoint>, deps: ConnectionDependencies) -> Self {
        let count = deps.options.connection_count.max(1);
        let (status_events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                id: deps.random.uuid(),
                hub: endpoint.hub().to_string(),
                endpoint,
                slots: (0..count).map(|_| RwLock::new(None)).collect(),
                deps,
                status_events,
                supervisors: Mutex::new(JoinSet::new()),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                offline: AtomicU8::new(OFFLINE_NONE),
            }),
        }
    }

    /// Container id, used to key scope pins
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Endpoint the container connects to
    pub fn endpoint(&self) -> &Arc<HubServiceEndpoint> {
        &self.inner.endpoint
    }

    /// Number of slots
    pub fn connection_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of connected slots
    pub fn connected_count(&self) -> usize {
        (0..self.inner.slots.len())
            .filter(|index| self.inner.connected_at(*index).is_some())
            .count()
    }

    /// Connection currently occupying a slot
    pub fn connection(&self, index: usize) -> Option<ServiceConnection> {
        self.inner.connection_at(index)
    }

    /// Subscribe to slot status changes
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_events.subscribe()
    }

    /// Wait until every slot is connected; returns `false` on timeout
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut events = self.subscribe_status();
        tokio::time::timeout(timeout, async {
            while self.connected_count() < self.connection_count() {
                // lagged or closed receivers fall back to polling
                if events.recv().await.is_err() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl ConnectionContainer for ServiceConnectionContainer {
    fn hub(&self) -> &str {
        &self.inner.hub
    }

    fn status(&self) -> ServiceConnectionStatus {
        if self.connected_count() > 0 {
            ServiceConnectionStatus::Connected
        } else if self.inner.started.load(Ordering::Acquire) && !self.inner.shutdown.is_cancelled()
        {
            ServiceConnectionStatus::Connecting
        } else {
            ServiceConnectionStatus::Disconnected
        }
    }

    #[instrument(skip(self), fields(hub = %self.inner.hub, endpoint = %self.inner.endpoint.name()))]
    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_attempts = Vec::with_capacity(inner.slots.len());
        {
            let mut supervisors = lock(&inner.supervisors);
            for index in 0..inner.slots.len() {
                let (sender, receiver) = oneshot::channel();
                first_attempts.push(receiver);
                let span = info_span!("slot", hub = %inner.hub, endpoint = %inner.endpoint.name(), index);
                supervisors.spawn(Arc::clone(inner).supervise(index, sender).instrument(span));
            }
        }
        join_all(first_attempts).await;

        let connected = self.connected_count();
        if connected == 0 {
            warn!(total = inner.slots.len(), "No service connection could be established yet");
        } else {
            info!(connected, total = inner.slots.len(), "Service connection container started");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(hub = %self.inner.hub, endpoint = %self.inner.endpoint.name()))]
    async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let mut supervisors = std::mem::take(&mut *lock(&inner.supervisors));
        while supervisors.join_next().await.is_some() {}

        let connections: Vec<_> = (0..inner.slots.len())
            .filter_map(|index| inner.connection_at(index))
            .collect();
        join_all(connections.iter().map(ServiceConnection::stop)).await;
        info!("Service connection container stopped");
        Ok(())
    }

    async fn write(&self, message: ServiceMessage) -> Result<()> {
        self.inner.select(None)?.write(message).await
    }

    async fn write_keyed(&self, partition_key: &str, message: ServiceMessage) -> Result<()> {
        if partition_key.is_empty() {
            return Err(RelayError::InvalidArgument(
                "partition key must not be empty".to_string(),
            ));
        }
        self.inner.select(Some(partition_key))?.write(message).await
    }

    async fn write_ackable(&self, mut message: ServiceMessage, timeout: Duration) -> Result<bool> {
        let acks = &self.inner.deps.ack_handler;
        let (ack_id, receiver) = acks.register();
        if !message.set_ack_id(ack_id) {
            acks.cancel(ack_id);
            return Err(RelayError::InvalidArgument(format!(
                "{} is not an ackable message",
                message.kind()
            )));
        }

        let written = match message.partition_key().map(str::to_string) {
            Some(key) => self.write_keyed(&key, message).await,
            None => self.write(message).await,
        };
        if let Err(err) = written {
            acks.cancel(ack_id);
            return Err(err);
        }

        match acks.wait(ack_id, receiver, timeout).await {
            Ok(status) => {
                debug!(ack_id, ?status, "Ackable message acknowledged");
                Ok(status.is_ok())
            }
            Err(RelayError::AckTimeout { .. }) => {
                self.inner.deps.metrics.ack_timeout();
                warn!(ack_id, ?timeout, hub = %self.inner.hub, "Ackable message timed out");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn offline(&self, migratable: bool) -> Result<()> {
        let inner = &self.inner;
        let state = if migratable { OFFLINE_MIGRATE } else { OFFLINE_FIN };
        inner.offline.store(state, Ordering::Release);

        let connections: Vec<_> = (0..inner.slots.len())
            .filter_map(|index| inner.connection_at(index))
            .collect();
        let results = join_all(connections.iter().map(|c| c.offline(migratable))).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}

impl fmt::Debug for ServiceConnectionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConnectionContainer")
            .field("id", &self.inner.id)
            .field("hub", &self.inner.hub)
            .field("endpoint", &self.inner.endpoint.name())
            .field("connected", &self.connected_count())
            .field("total", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn connection_at(&self, index: usize) -> Option<ServiceConnection> {
        let slot = self.slots.get(index)?;
        slot.read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn connected_at(&self, index: usize) -> Option<ServiceConnection> {
        self.connection_at(index)
            .filter(ServiceConnection::is_connected)
    }

    fn replace_slot(&self, index: usize, connection: ServiceConnection) {
        if let Some(slot) = self.slots.get(index) {
            *slot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(connection);
        }
    }

    fn select(&self, partition_key: Option<&str>) -> Result<ServiceConnection> {
        match ConnectionScope::current() {
            Some(scope) => self.select_scoped(&scope, partition_key),
            None => self
                .select_unscoped(partition_key)
                .map(|(_, connection)| connection),
        }
    }

    /// The key or random draw only chooses the first pin of a scope
    fn select_scoped(
        &self,
        scope: &ConnectionScope,
        partition_key: Option<&str>,
    ) -> Result<ServiceConnection> {
        if let Some(pinned) = scope.pinned(self.id) {
            let current = self
                .connected_at(pinned.index)
                .filter(|connection| connection.id() == pinned.service_connection_id);
            if let Some(connection) = current {
                return Ok(connection);
            }
            debug!(hub = %self.hub, index = pinned.index, "Scoped connection is gone, reselecting");
        }
        let (index, connection) = self.select_unscoped(partition_key)?;
        scope.pin(
            self.id,
            PinnedConnection {
                index,
                service_connection_id: connection.id(),
            },
        );
        Ok(connection)
    }

    fn select_unscoped(&self, partition_key: Option<&str>) -> Result<(usize, ServiceConnection)> {
        let count = self.slots.len();
        let preferred = match partition_key {
            Some(key) => partition_index(key, count),
            None => self.deps.random.index(count),
        };
        (0..count)
            .map(|offset| (preferred + offset) % count)
            .find_map(|index| self.connected_at(index).map(|connection| (index, connection)))
            .ok_or_else(|| RelayError::NotConnected(self.hub.clone()))
    }

    fn publish(
        &self,
        index: usize,
        connection: &ServiceConnection,
        old_status: ServiceConnectionStatus,
        new_status: ServiceConnectionStatus,
    ) {
        let _ = self.status_events.send(StatusChange {
            hub: self.hub.clone(),
            endpoint: self.endpoint.name().to_string(),
            index,
            service_connection_id: connection.id(),
            old_status,
            new_status,
        });
    }

    async fn supervise(self: Arc<Self>, index: usize, first_attempt: oneshot::Sender<()>) {
        let mut first_attempt = Some(first_attempt);
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let connection = ServiceConnection::with_shutdown_token(
                self.hub.clone(),
                Arc::clone(&self.endpoint),
                ServiceConnectionType::Default,
                None,
                self.deps.clone(),
                self.shutdown.child_token(),
            );
            self.replace_slot(index, connection.clone());

            // the connection's token is a child of ours, so start returns on stop
            let started = connection.start().await;
            if let Some(first_attempt) = first_attempt.take() {
                let _ = first_attempt.send(());
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            match started {
                Ok(()) => {
                    attempt = 0;
                    self.publish(
                        index,
                        &connection,
                        ServiceConnectionStatus::Connecting,
                        ServiceConnectionStatus::Connected,
                    );
                    let offline = self.offline.load(Ordering::Acquire);
                    if offline != OFFLINE_NONE {
                        if let Err(err) = connection.offline(offline == OFFLINE_MIGRATE).await {
                            debug!(%err, "Failed to announce offline on replacement connection");
                        }
                    }
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => break,
                        () = connection.closed() => {}
                    }
                    self.publish(
                        index,
                        &connection,
                        ServiceConnectionStatus::Connected,
                        ServiceConnectionStatus::Disconnected,
                    );
                    warn!(service_connection_id = %connection.id(), "Service connection dropped, replacing");
                }
                Err(err) => {
                    self.publish(
                        index,
                        &connection,
                        ServiceConnectionStatus::Connecting,
                        ServiceConnectionStatus::Disconnected,
                    );
                    debug!(%err, attempt, "Service connection attempt failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self
                .deps
                .options
                .reconnect
                .delay(attempt, self.deps.random.as_ref());
            self.deps.metrics.reconnect_attempt();
            debug!(attempt, ?delay, "Reconnecting after delay");
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        if let Some(first_attempt) = first_attempt.take() {
            let _ = first_attempt.send(());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
