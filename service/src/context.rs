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

//! Per-client connection state and the application-facing pipe pair
//!
//! Every tunneled client connection owns two pipes. The *application input*
//! carries payloads from the relay to the hub; the *application output*
//! carries payloads from the hub back to the relay. The service connection
//! keeps the transport ends inside a [`ClientConnectionContext`]; the hub gets
//! the application ends as a [`ClientConnection`].
//!
//! Inbound payloads are first queued on an unbounded per-client queue so the
//! relay read loop never waits on a slow application. A forwarder drains the
//! queue into the bounded application input, guarded by a small write-state
//! machine:
//!
//! ```text
//! Idle --write--> Writing --done--> Idle
//! Idle|Writing --complete--> Completing
//! ```
//!
//! A completion that lands during an in-flight write waits for that write to
//! finish; writes attempted after completion are dropped.

use crate::types::ServiceConnectionId;
use crate::{RelayError, Result};
use bytes::Bytes;
use relaymux_protocol::Headers;
use relaymux_protocol::consts::{HEADER_MIGRATED_FROM, RECORD_SEPARATOR};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Claim type holding the user identifier
pub const USER_ID_CLAIM: &str = "sub";

/// State of a context's inbound write path (stored as atomic u8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteState {
    /// No write in flight
    Idle = 0,
    /// A payload is being written into the application input
    Writing = 1,
    /// The application input is closed or closing
    Completing = 2,
}

impl WriteState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Writing,
            _ => Self::Completing,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Item on a context's inbound queue
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Payload for the application
    Data(Bytes),
    /// The relay closed the connection; end the application input after the
    /// payloads queued before it
    Complete,
}

/// Transport-side halves handed to the service connection's client task
pub(crate) struct TransportParts {
    pub(crate) application: ClientConnection,
    pub(crate) outgoing: mpsc::Receiver<Bytes>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Server-side state of one tunneled client connection
pub struct ClientConnectionContext {
    connection_id: String,
    hub: String,
    service_connection_id: ServiceConnectionId,
    claims: Vec<(String, String)>,
    headers: Headers,
    query_string: Option<String>,
    is_migrated: bool,
    migrating_out: AtomicBool,
    created_at: Instant,

    inbound: mpsc::UnboundedSender<Inbound>,
    application_input: Mutex<Option<mpsc::Sender<Bytes>>>,
    parts: Mutex<Option<TransportParts>>,

    write_state: AtomicU8,
    write_finished: Notify,
    input_closed: CancellationToken,
    outgoing_aborted: CancellationToken,
    application_aborted: CancellationToken,
    completed: CancellationToken,
}

impl ClientConnectionContext {
    /// Create the context and pipe pair for a newly opened client connection
    pub fn new(
        hub: impl Into<String>,
        service_connection_id: ServiceConnectionId,
        connection_id: impl Into<String>,
        claims: Vec<(String, String)>,
        headers: Headers,
        query_string: Option<String>,
        buffer: usize,
    ) -> Self {
        let connection_id = connection_id.into();
        let hub = hub.into();
        let is_migrated = headers.contains_key(HEADER_MIGRATED_FROM);
        let (input_sender, input_receiver) = mpsc::channel(buffer.max(1));
        let (output_sender, output_receiver) = mpsc::channel(buffer.max(1));
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();
        let application_aborted = CancellationToken::new();

        let application = ClientConnection {
            connection_id: connection_id.clone(),
            hub: hub.clone(),
            claims: claims.clone(),
            headers: headers.clone(),
            query_string: query_string.clone(),
            is_migrated,
            incoming: input_receiver,
            outgoing: output_sender,
            aborted: application_aborted.clone(),
        };

        Self {
            connection_id,
            hub,
            service_connection_id,
            claims,
            headers,
            query_string,
            is_migrated,
            migrating_out: AtomicBool::new(false),
            created_at: Instant::now(),
            inbound: inbound_sender,
            application_input: Mutex::new(Some(input_sender)),
            parts: Mutex::new(Some(TransportParts {
                application,
                outgoing: output_receiver,
                inbound: inbound_receiver,
            })),
            write_state: AtomicU8::new(WriteState::Idle.as_u8()),
            write_finished: Notify::new(),
            input_closed: CancellationToken::new(),
            outgoing_aborted: CancellationToken::new(),
            application_aborted,
            completed: CancellationToken::new(),
        }
    }

    /// Logical connection id assigned by the relay
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Hub the connection belongs to
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Service connection that owns this client connection
    pub fn service_connection_id(&self) -> ServiceConnectionId {
        self.service_connection_id
    }

    /// Client identity claims
    pub fn claims(&self) -> &[(String, String)] {
        &self.claims
    }

    /// Client request headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Client request query string
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Whether the connection was migrated here from another server
    pub fn is_migrated(&self) -> bool {
        self.is_migrated
    }

    /// Whether the relay is moving the connection to another server
    pub fn is_migrating_out(&self) -> bool {
        self.migrating_out.load(Ordering::Acquire)
    }

    pub(crate) fn mark_migrating_out(&self) {
        self.migrating_out.store(true, Ordering::Release);
    }

    /// Time since the connection was opened
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Current state of the inbound write path
    pub fn write_state(&self) -> WriteState {
        WriteState::from_u8(self.write_state.load(Ordering::Acquire))
    }

    pub(crate) fn take_parts(&self) -> Option<TransportParts> {
        lock(&self.parts).take()
    }

    /// Queue a relay payload for the application.
    ///
    /// Never blocks. Returns `false` when the input is already completing.
    pub fn enqueue_incoming(&self, payload: Bytes) -> bool {
        if self.write_state() == WriteState::Completing {
            return false;
        }
        self.inbound.send(Inbound::Data(payload)).is_ok()
    }

    /// Queue the end of the application input behind any pending payloads
    pub(crate) fn enqueue_completion(&self) {
        if self.inbound.send(Inbound::Complete).is_err() {
            self.close_application_input();
        }
    }

    /// Write one payload into the application input.
    ///
    /// Only one writer may be active; a write attempted while another is in
    /// flight or after completion is dropped and returns `false`.
    pub async fn write_incoming(&self, payload: Bytes) -> bool {
        if self
            .write_state
            .compare_exchange(
                WriteState::Idle.as_u8(),
                WriteState::Writing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            trace!(connection_id = %self.connection_id, "Dropping payload after completion");
            return false;
        }

        let delivered = {
            let sender = lock(&self.application_input).clone();
            match sender {
                Some(sender) => tokio::select! {
                    result = sender.send(payload) => result.is_ok(),
                    () = self.application_aborted.cancelled() => false,
                },
                None => false,
            }
        };

        if self
            .write_state
            .compare_exchange(
                WriteState::Writing.as_u8(),
                WriteState::Idle.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // completion arrived mid-write and is waiting on us
            self.close_application_input();
            self.write_finished.notify_one();
        }
        delivered
    }

    /// End the application input.
    ///
    /// Waits for an in-flight write to finish first. Idempotent.
    pub async fn complete_incoming(&self) {
        loop {
            match self.write_state() {
                WriteState::Idle => {
                    if self.transition(WriteState::Idle, WriteState::Completing) {
                        self.close_application_input();
                        return;
                    }
                }
                WriteState::Writing => {
                    if self.transition(WriteState::Writing, WriteState::Completing) {
                        self.write_finished.notified().await;
                        return;
                    }
                }
                WriteState::Completing => return,
            }
        }
    }

    fn transition(&self, from: WriteState, to: WriteState) -> bool {
        self.write_state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn close_application_input(&self) {
        lock(&self.application_input).take();
        self.input_closed.cancel();
    }

    /// Drain the inbound queue into the application input until it completes
    pub(crate) async fn forward_incoming(&self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        loop {
            let item = tokio::select! {
                biased;
                () = self.application_aborted.cancelled() => break,
                () = self.input_closed.cancelled() => break,
                item = inbound.recv() => item,
            };
            match item {
                Some(Inbound::Data(payload)) => {
                    if !self.write_incoming(payload).await
                        && self.write_state() == WriteState::Completing
                    {
                        break;
                    }
                }
                Some(Inbound::Complete) | None => {
                    self.complete_incoming().await;
                    break;
                }
            }
        }
    }

    /// Stop forwarding application output to the relay
    pub fn abort_outgoing(&self) {
        self.outgoing_aborted.cancel();
    }

    /// Signal the application that the connection is gone
    pub fn abort_application(&self) {
        self.application_aborted.cancel();
    }

    /// Token cancelled when outgoing forwarding is aborted
    pub fn outgoing_aborted(&self) -> &CancellationToken {
        &self.outgoing_aborted
    }

    /// Token cancelled when the application is aborted
    pub fn application_aborted(&self) -> &CancellationToken {
        &self.application_aborted
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.cancel();
    }

    /// Whether the connection's application and pumps have finished
    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }

    /// Wait until the connection's application and pumps have finished
    pub async fn completed(&self) {
        self.completed.cancelled().await;
    }
}

impl fmt::Debug for ClientConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("hub", &self.hub)
            .field("service_connection_id", &self.service_connection_id)
            .field("is_migrated", &self.is_migrated)
            .field("migrating_out", &self.is_migrating_out())
            .field("write_state", &self.write_state())
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove a stray handshake response from the first payload of a migrated
/// connection.
///
/// The client already completed its handshake with the previous server, so
/// the response the hub writes for the new server is discarded: everything up
/// to and including the first record separator of a JSON-looking record.
pub(crate) fn skip_handshake_response(payload: Bytes) -> Bytes {
    if payload.first() != Some(&b'{') {
        return payload;
    }
    match payload.iter().position(|byte| *byte == RECORD_SEPARATOR) {
        Some(end) => payload.slice(end + 1..),
        None => payload,
    }
}

/// The application's view of a tunneled client connection
///
/// Dropping the connection (and every [`ClientSender`] cloned from it) ends
/// the application output, which closes the client connection at the relay.
pub struct ClientConnection {
    connection_id: String,
    hub: String,
    claims: Vec<(String, String)>,
    headers: Headers,
    query_string: Option<String>,
    is_migrated: bool,
    incoming: mpsc::Receiver<Bytes>,
    outgoing: mpsc::Sender<Bytes>,
    aborted: CancellationToken,
}

impl ClientConnection {
    /// Logical connection id assigned by the relay
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Hub the connection belongs to
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Client identity claims
    pub fn claims(&self) -> &[(String, String)] {
        &self.claims
    }

    /// First claim of the given type
    pub fn claim(&self, claim_type: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|(name, _)| name == claim_type)
            .map(|(_, value)| value.as_str())
    }

    /// User identifier claim, if any
    pub fn user_id(&self) -> Option<&str> {
        self.claim(USER_ID_CLAIM)
    }

    /// Client request headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Client request query string
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Whether the connection was migrated here from another server
    pub fn is_migrated(&self) -> bool {
        self.is_migrated
    }

    /// Receive the next payload from the client.
    ///
    /// Returns `None` once the relay closed the connection or it was aborted.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            () = self.aborted.cancelled() => None,
            payload = self.incoming.recv() => payload,
        }
    }

    /// Send a payload to the client
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        send_with_abort(&self.outgoing, &self.aborted, payload.into()).await
    }

    /// A cloneable handle for sending from other tasks
    pub fn sender(&self) -> ClientSender {
        ClientSender {
            connection_id: self.connection_id.clone(),
            outgoing: self.outgoing.clone(),
            aborted: self.aborted.clone(),
        }
    }

    /// Token cancelled when the connection is aborted
    pub fn aborted(&self) -> CancellationToken {
        self.aborted.clone()
    }

    /// Whether the connection was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("connection_id", &self.connection_id)
            .field("hub", &self.hub)
            .field("is_migrated", &self.is_migrated)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Cloneable sending half of a [`ClientConnection`]
#[derive(Clone)]
pub struct ClientSender {
    connection_id: String,
    outgoing: mpsc::Sender<Bytes>,
    aborted: CancellationToken,
}

impl ClientSender {
    /// Logical connection id
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Send a payload to the client
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        send_with_abort(&self.outgoing, &self.aborted, payload.into()).await
    }
}

impl fmt::Debug for ClientSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSender")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

async fn send_with_abort(
    outgoing: &mpsc::Sender<Bytes>,
    aborted: &CancellationToken,
    payload: Bytes,
) -> Result<()> {
    tokio::select! {
        biased;
        () = aborted.cancelled() => Err(RelayError::ConnectionClosed),
        result = outgoing.send(payload) => result.map_err(|_| RelayError::ConnectionClosed),
    }
}
