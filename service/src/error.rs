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

//! Error types for relay service connections

use relaymux_protocol::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Result type for operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error type returned by application delegates and shutdown callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Relay service error types
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or decoding error from the protocol layer
    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    /// The relay rejected the handshake
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The relay did not answer the handshake in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// No service connection is connected for the hub
    #[error("No connected service connection for hub '{0}'")]
    NotConnected(String),

    /// The router selected no endpoint for a message
    #[error("No endpoint available for hub '{0}'")]
    NoEndpointAvailable(String),

    /// A client connection with this id is already registered
    #[error("Client connection {0} is already registered")]
    DuplicateConnection(String),

    /// A caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The relay did not acknowledge a message in time
    #[error("Acknowledgement {ack_id} timed out after {timeout:?}")]
    AckTimeout {
        /// Correlation id of the message
        ack_id: u64,
        /// Time waited
        timeout: Duration,
    },

    /// The service or client connection has been closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The relay reported a fatal error for the service connection
    #[error("Service error: {0}")]
    ServiceError(String),

    /// A connection string could not be parsed
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Options failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Graceful shutdown did not finish in time
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The host is not running
    #[error("Host not running")]
    HostNotRunning,

    /// Generic error with a message
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Check if the error is recoverable
    ///
    /// Recoverable errors are transient conditions where retrying the
    /// operation, possibly on a replacement connection, might succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::HandshakeTimeout(_)
                | RelayError::NotConnected(_)
                | RelayError::NoEndpointAvailable(_)
                | RelayError::AckTimeout { .. }
                | RelayError::ConnectionClosed
        )
    }

    /// Check if the error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::HandshakeFailed(_)
                | RelayError::HandshakeTimeout(_)
                | RelayError::NotConnected(_)
                | RelayError::ConnectionClosed
                | RelayError::ServiceError(_)
        )
    }
}
