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

//! Core types for relay service connections

use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique identifier of a physical service connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceConnectionId(Uuid);

impl ServiceConnectionId {
    /// Create a service connection ID from a UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ServiceConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sc-{}", self.0.simple())
    }
}

/// Status of a physical service connection (stored as atomic u8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceConnectionStatus {
    /// Transport or handshake in progress
    Connecting = 0,
    /// Handshake completed, carrying traffic
    Connected = 1,
    /// Transport lost or stopped; terminal for a connection instance
    Disconnected = 2,
}

impl ServiceConnectionStatus {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the status is terminal
    pub fn is_terminal(self) -> bool {
        self == Self::Disconnected
    }
}

impl fmt::Display for ServiceConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A status transition of one container slot, published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Hub served by the container
    pub hub: String,
    /// Endpoint name of the container
    pub endpoint: String,
    /// Slot index inside the container
    pub index: usize,
    /// Connection occupying the slot
    pub service_connection_id: ServiceConnectionId,
    /// Status before the change
    pub old_status: ServiceConnectionStatus,
    /// Status after the change
    pub new_status: ServiceConnectionStatus,
}

/// Point-in-time view of one service connection
#[derive(Debug, Clone)]
pub struct ServiceConnectionInfo {
    /// Connection ID
    pub id: ServiceConnectionId,
    /// Current status
    pub status: ServiceConnectionStatus,
    /// Number of client connections it carries
    pub client_connections: usize,
    /// When the connection was created
    pub created_at: Instant,
}

impl ServiceConnectionInfo {
    /// Get the connection age
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Host snapshot for non-blocking debug information
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    /// Registered hubs
    pub hubs: Vec<String>,
    /// Hubs with at least one connected service connection
    pub connected_hubs: usize,
    /// Live client connections across all hubs
    pub client_connections: usize,
    /// Whether the host has been started and not shut down
    pub running: bool,
    /// Host uptime
    pub uptime: Duration,
}

impl fmt::Display for HostSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServiceHost {{ hubs: {}, connected: {}, clients: {}, running: {}, uptime: {:?} }}",
            self.hubs.len(),
            self.connected_hubs,
            self.client_connections,
            self.running,
            self.uptime
        )
    }
}
