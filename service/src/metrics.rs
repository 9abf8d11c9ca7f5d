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

//! Lock-free metrics for relay service connections
//!
//! Every recording method updates an in-process atomic counter and emits the
//! matching `relaymux.*` metric through the `metrics` facade, so an installed
//! exporter sees the same numbers [`RelayMetrics::snapshot`] reports.

use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free relay metrics
///
/// All metrics are stored as atomics and can be accessed concurrently
/// without locks. Use the `snapshot()` method to get a view of all metrics at
/// a point in time.
#[derive(Debug)]
pub struct RelayMetrics {
    // Physical connections
    total_service_connections: AtomicU64,
    active_service_connections: AtomicU64,
    reconnect_attempts: AtomicU64,
    handshake_failures: AtomicU64,

    // Logical connections
    total_client_connections: AtomicU64,
    active_client_connections: AtomicU64,
    total_client_duration_ns: AtomicU64,

    // Throughput
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dropped_messages: AtomicU64,

    // Errors
    connection_errors: AtomicU64,
    protocol_errors: AtomicU64,
    ack_timeouts: AtomicU64,

    started_at: Instant,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_service_connections: AtomicU64::new(0),
            active_service_connections: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            total_client_connections: AtomicU64::new(0),
            active_client_connections: AtomicU64::new(0),
            total_client_duration_ns: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            ack_timeouts: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Service connection tracking

    /// Record a service connection completing its handshake
    pub fn service_connection_opened(&self) {
        self.total_service_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.active_service_connections.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("relaymux.service_connections.opened").increment(1);
        gauge!("relaymux.service_connections.active").set(active as f64);
    }

    /// Record a connected service connection going away
    pub fn service_connection_closed(&self) {
        let active = decrement(&self.active_service_connections);
        counter!("relaymux.service_connections.closed").increment(1);
        gauge!("relaymux.service_connections.active").set(active as f64);
    }

    /// Record a slot retrying its connection
    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        counter!("relaymux.service_connections.reconnects").increment(1);
    }

    /// Record a failed handshake
    pub fn handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
        counter!("relaymux.service_connections.handshake_failures").increment(1);
    }

    /// Get the current number of connected service connections
    pub fn active_service_connections(&self) -> u64 {
        self.active_service_connections.load(Ordering::Relaxed)
    }

    // Client connection tracking

    /// Record a client connection being opened
    pub fn client_connection_opened(&self) {
        self.total_client_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.active_client_connections.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("relaymux.client_connections.opened").increment(1);
        gauge!("relaymux.client_connections.active").set(active as f64);
    }

    /// Record a client connection being closed
    pub fn client_connection_closed(&self, duration: Duration) {
        let active = decrement(&self.active_client_connections);
        self.total_client_duration_ns.fetch_add(
            u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        counter!("relaymux.client_connections.closed").increment(1);
        gauge!("relaymux.client_connections.active").set(active as f64);
        histogram!("relaymux.client_connections.duration_seconds").record(duration.as_secs_f64());
    }

    /// Get the current number of client connections
    pub fn active_client_connections(&self) -> u64 {
        self.active_client_connections.load(Ordering::Relaxed)
    }

    /// Get the total number of client connections since start
    pub fn total_client_connections(&self) -> u64 {
        self.total_client_connections.load(Ordering::Relaxed)
    }

    // Throughput tracking

    /// Record a message written to the relay
    pub fn message_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        counter!("relaymux.messages.sent").increment(1);
        counter!("relaymux.bytes.sent").increment(bytes as u64);
    }

    /// Record a message read from the relay
    pub fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        counter!("relaymux.messages.received").increment(1);
        counter!("relaymux.bytes.received").increment(bytes as u64);
    }

    /// Record a payload dropped for an unknown or completed client connection
    pub fn message_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        counter!("relaymux.messages.dropped").increment(1);
    }

    // Error tracking

    /// Record a transport error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        counter!("relaymux.errors.connection").increment(1);
    }

    /// Record a framing or decoding error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        counter!("relaymux.errors.protocol").increment(1);
    }

    /// Record an acknowledgement timeout
    pub fn ack_timeout(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("relaymux.errors.ack_timeout").increment(1);
    }

    // Snapshot

    /// Get a snapshot of all metrics
    ///
    /// Counters are read individually, so a snapshot taken under concurrent
    /// updates may be slightly skewed between fields.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_service_connections: self.total_service_connections.load(Ordering::Relaxed),
            active_service_connections: self.active_service_connections.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            total_client_connections: self.total_client_connections.load(Ordering::Relaxed),
            active_client_connections: self.active_client_connections.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_client_duration: self.average_client_duration(),
        }
    }

    fn average_client_duration(&self) -> Duration {
        let total = self.total_client_connections.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_client_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / total)
    }
}

fn decrement(value: &AtomicU64) -> u64 {
    let previous = value
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
        .unwrap_or(0);
    previous.saturating_sub(1)
}

/// A snapshot of relay metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Service connections that completed a handshake since start
    pub total_service_connections: u64,
    /// Currently connected service connections
    pub active_service_connections: u64,
    /// Reconnect attempts made by container slots
    pub reconnect_attempts: u64,
    /// Failed handshakes
    pub handshake_failures: u64,
    /// Client connections opened since start
    pub total_client_connections: u64,
    /// Currently open client connections
    pub active_client_connections: u64,
    /// Messages written to the relay
    pub messages_sent: u64,
    /// Messages read from the relay
    pub messages_received: u64,
    /// Payload bytes written to the relay
    pub bytes_sent: u64,
    /// Payload bytes read from the relay
    pub bytes_received: u64,
    /// Payloads dropped for unknown or completed client connections
    pub dropped_messages: u64,
    /// Transport errors
    pub connection_errors: u64,
    /// Framing or decoding errors
    pub protocol_errors: u64,
    /// Acknowledgement timeouts
    pub ack_timeouts: u64,
    /// Time since the metrics were created
    pub uptime: Duration,
    /// Average client connection lifetime
    pub avg_client_duration: Duration,
}

impl MetricsSnapshot {
    /// Calculate total error count
    pub fn total_errors(&self) -> u64 {
        self.connection_errors + self.protocol_errors + self.ack_timeouts
    }
}
