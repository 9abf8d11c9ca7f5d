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

//! Service protocol message types

use crate::consts::{HEADER_MIGRATED_FROM, HEADER_MIGRATED_TO};
use bytes::Bytes;
use enum_kinds::EnumKind;
use std::collections::BTreeMap;
use std::fmt;

/// Serialized payloads keyed by hub protocol name (e.g. `json`, `messagepack`)
pub type Payloads = BTreeMap<String, Bytes>;

/// Header map carried on open/close messages
pub type Headers = BTreeMap<String, String>;

/// Kind of physical connection requested during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ServiceConnectionType {
    /// Regular connection that carries client traffic
    #[default]
    Default = 0,
    /// Connection opened on demand by a relay request
    OnDemand = 1,
    /// Connection that only receives hub-level messages, never clients
    Weak = 2,
}

impl ServiceConnectionType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Default),
            1 => Some(Self::OnDemand),
            2 => Some(Self::Weak),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::OnDemand => write!(f, "on-demand"),
            Self::Weak => write!(f, "weak"),
        }
    }
}

/// Outcome reported by the relay for an ackable message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckStatus {
    /// The operation was applied
    Ok = 0,
    /// The target (connection, group, user) does not exist
    NotFound = 1,
    /// The relay did not apply the operation in time
    Timeout = 2,
    /// The relay failed to apply the operation
    InternalError = 3,
}

impl AckStatus {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::NotFound),
            2 => Some(Self::Timeout),
            3 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Whether the operation succeeded
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// A message exchanged between the app server and the relay service.
#[derive(Clone, Debug, PartialEq, Eq, EnumKind)]
#[enum_kind(ServiceMessageKind)]
pub enum ServiceMessage {
    /// First message sent by the server on a new physical connection
    HandshakeRequest {
        /// Protocol version spoken by the server
        version: u32,
        /// Requested connection type
        connection_type: ServiceConnectionType,
        /// Optional routing target for on-demand connections
        target: Option<String>,
        /// Migration support level (0 = off)
        migration_level: u8,
    },
    /// Relay answer to a handshake request
    HandshakeResponse {
        /// Present when the relay rejected the handshake
        error_message: Option<String>,
    },
    /// Keep-alive carrying optional key/value telemetry
    Ping {
        /// Telemetry entries
        messages: Vec<(String, String)>,
    },
    /// A client connected to the relay and was routed to this server
    OpenConnection {
        /// Logical client connection id
        connection_id: String,
        /// Client identity claims
        claims: Vec<(String, String)>,
        /// Client request headers
        headers: Headers,
        /// Client request query string
        query_string: Option<String>,
    },
    /// A logical connection was closed (in either direction)
    CloseConnection {
        /// Logical client connection id
        connection_id: String,
        /// Error describing an abnormal close
        error_message: Option<String>,
        /// Close headers (migration markers)
        headers: Headers,
    },
    /// Data for a single logical connection
    ConnectionData {
        /// Logical client connection id
        connection_id: String,
        /// Opaque hub protocol bytes
        payload: Bytes,
    },
    /// Data for several logical connections
    MultiConnectionData {
        /// Target connection ids
        connection_ids: Vec<String>,
        /// Payloads by hub protocol
        payloads: Payloads,
    },
    /// Data for every connection of the hub
    BroadcastData {
        /// Connections excluded from the broadcast
        excluded: Vec<String>,
        /// Payloads by hub protocol
        payloads: Payloads,
    },
    /// Data for every connection in a group
    GroupBroadcastData {
        /// Target group
        group: String,
        /// Connections excluded from the broadcast
        excluded: Vec<String>,
        /// Payloads by hub protocol
        payloads: Payloads,
    },
    /// Data for every connection in several groups
    MultiGroupBroadcastData {
        /// Target groups
        groups: Vec<String>,
        /// Payloads by hub protocol
        payloads: Payloads,
    },
    /// Data for every connection of a user
    UserData {
        /// Target user
        user_id: String,
        /// Payloads by hub protocol
        payloads: Payloads,
    },
    /// Data for every connection of several users
    MultiUserData {
        /// Target users
        user_ids: Vec<String>,
        /// Payloads by hub protocol
        payloads: Payloads,
    },
    /// Add a connection to a group, acknowledged by the relay
    JoinGroupWithAck {
        /// Connection joining the group
        connection_id: String,
        /// Group joined
        group: String,
        /// Acknowledgement correlation id
        ack_id: u64,
    },
    /// Remove a connection from a group, acknowledged by the relay
    LeaveGroupWithAck {
        /// Connection leaving the group
        connection_id: String,
        /// Group left
        group: String,
        /// Acknowledgement correlation id
        ack_id: u64,
    },
    /// Relay acknowledgement of an ackable message
    Ack {
        /// Correlation id of the acknowledged message
        ack_id: u64,
        /// Outcome
        status: AckStatus,
        /// Optional detail
        message: Option<String>,
    },
    /// Fatal error reported by the relay for the physical connection
    ServiceError {
        /// Error description
        error_message: String,
    },
}

impl ServiceMessage {
    /// Get the kind of this message
    pub fn kind(&self) -> ServiceMessageKind {
        ServiceMessageKind::from(self)
    }

    /// Natural ordering key of the message.
    ///
    /// Messages sharing a key must travel over the same physical connection to
    /// stay ordered. Broadcasts and control messages have no key.
    pub fn partition_key(&self) -> Option<&str> {
        match self {
            Self::OpenConnection { connection_id, .. }
            | Self::CloseConnection { connection_id, .. }
            | Self::ConnectionData { connection_id, .. } => Some(connection_id),
            Self::GroupBroadcastData { group, .. }
            | Self::JoinGroupWithAck { group, .. }
            | Self::LeaveGroupWithAck { group, .. } => Some(group),
            Self::UserData { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    /// Acknowledgement id carried by ackable messages
    pub fn ack_id(&self) -> Option<u64> {
        match self {
            Self::JoinGroupWithAck { ack_id, .. } | Self::LeaveGroupWithAck { ack_id, .. } => {
                Some(*ack_id)
            }
            _ => None,
        }
    }

    /// Replace the acknowledgement id of an ackable message.
    ///
    /// Returns `false` when the message is not ackable.
    pub fn set_ack_id(&mut self, id: u64) -> bool {
        match self {
            Self::JoinGroupWithAck { ack_id, .. } | Self::LeaveGroupWithAck { ack_id, .. } => {
                *ack_id = id;
                true
            }
            _ => false,
        }
    }

    /// Whether an open carries the migrated-from marker
    pub fn is_migrated_in(&self) -> bool {
        matches!(self, Self::OpenConnection { headers, .. } if headers.contains_key(HEADER_MIGRATED_FROM))
    }

    /// Whether a close carries the migrated-to marker
    pub fn is_migrating_out(&self) -> bool {
        matches!(self, Self::CloseConnection { headers, .. } if headers.contains_key(HEADER_MIGRATED_TO))
    }

    /// Build an empty ping
    pub fn ping() -> Self {
        Self::Ping {
            messages: Vec::new(),
        }
    }

    /// Build a close for a logical connection
    pub fn close(connection_id: impl Into<String>, error_message: Option<String>) -> Self {
        Self::CloseConnection {
            connection_id: connection_id.into(),
            error_message,
            headers: Headers::new(),
        }
    }

    /// Build a data message for a logical connection
    pub fn connection_data(connection_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::ConnectionData {
            connection_id: connection_id.into(),
            payload: payload.into(),
        }
    }
}

impl fmt::Display for ServiceMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
