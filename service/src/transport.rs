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

//! Physical transports to the relay service
//!
//! A [`ConnectionFactory`] opens one byte stream per service connection. The
//! stream carries framed service protocol messages in both directions; the
//! service connection owns it until teardown, then tells the factory to
//! dispose of any per-connection state.

use crate::endpoint::HubServiceEndpoint;
use crate::types::ServiceConnectionId;
use crate::{RelayError, Result};
use async_trait::async_trait;
use relaymux_protocol::ServiceConnectionType;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, instrument};

/// A bidirectional byte stream to the relay
pub trait RelayTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RelayTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased relay transport
pub type BoxedTransport = Box<dyn RelayTransport>;

/// Parameters of a physical connection attempt
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Hub the connection serves
    pub hub: String,
    /// Id of the service connection being started
    pub service_connection_id: ServiceConnectionId,
    /// Requested connection type
    pub connection_type: ServiceConnectionType,
    /// Routing target for on-demand connections
    pub target: Option<String>,
}

/// Opens and disposes of physical relay transports
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open a transport to `endpoint`
    async fn connect(
        &self,
        endpoint: &HubServiceEndpoint,
        request: &ConnectRequest,
    ) -> Result<BoxedTransport>;

    /// Release anything held for a service connection that has ended
    async fn dispose(&self, _service_connection_id: ServiceConnectionId) {}
}

/// Connects to relays over plain TCP
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpConnectionFactory {
    /// Create a factory with the default connect timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve the `host:port` a hub endpoint is reached at
    pub fn address(endpoint: &HubServiceEndpoint) -> Result<String> {
        let url = endpoint.endpoint().endpoint();
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            RelayError::InvalidConnectionString(format!("endpoint '{url}' has no scheme"))
        })?;
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(RelayError::InvalidConnectionString(format!(
                "endpoint '{url}' has no host"
            )));
        }
        let invalid_port =
            || RelayError::InvalidConnectionString(format!("invalid port in '{url}'"));
        let (host, url_port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                RelayError::InvalidConnectionString(format!("invalid host in '{url}'"))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port.parse::<u16>().map_err(|_| invalid_port())?),
                None => None,
            };
            (format!("[{host}]"), port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    Some(port.parse::<u16>().map_err(|_| invalid_port())?),
                ),
                None => (authority.to_string(), None),
            }
        };
        let default_port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
        let port = endpoint
            .endpoint()
            .port()
            .or(url_port)
            .unwrap_or(default_port);
        Ok(format!("{host}:{port}"))
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    #[instrument(skip_all, fields(hub = %request.hub, service_connection_id = %request.service_connection_id))]
    async fn connect(
        &self,
        endpoint: &HubServiceEndpoint,
        request: &ConnectRequest,
    ) -> Result<BoxedTransport> {
        let address = Self::address(endpoint)?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                RelayError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {address} timed out"),
                ))
            })??;
        stream.set_nodelay(true)?;
        debug!(%address, "Connected to relay");
        Ok(Box::new(stream))
    }
}

/// The relay side of an in-process connection
#[derive(Debug)]
pub struct MemoryConnection {
    /// Hub endpoint the server connected to
    pub endpoint: HubServiceEndpoint,
    /// Parameters of the attempt
    pub request: ConnectRequest,
    /// Relay half of the byte stream
    pub stream: DuplexStream,
}

/// Connects to an in-process relay through tokio duplex streams
#[derive(Debug)]
pub struct MemoryConnectionFactory {
    sender: mpsc::UnboundedSender<MemoryConnection>,
    buffer_size: usize,
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

/// Accepts connections made through a [`MemoryConnectionFactory`]
#[derive(Debug)]
pub struct MemoryListener {
    receiver: Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
}

impl MemoryConnectionFactory {
    /// Create a connected factory and listener pair
    pub fn pair() -> (Self, MemoryListener) {
        Self::with_buffer_size(64 * 1024)
    }

    /// Create a pair whose streams buffer up to `buffer_size` bytes each way
    pub fn with_buffer_size(buffer_size: usize) -> (Self, MemoryListener) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let factory = Self {
            sender,
            buffer_size,
            refusing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        };
        let listener = MemoryListener {
            receiver: Mutex::new(receiver),
        };
        (factory, listener)
    }

    /// Make subsequent connection attempts fail (or succeed again)
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Release);
    }

    /// Number of connection attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(
        &self,
        endpoint: &HubServiceEndpoint,
        request: &ConnectRequest,
    ) -> Result<BoxedTransport> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.refusing.load(Ordering::Acquire) {
            return Err(RelayError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{endpoint} refused the connection"),
            )));
        }
        let (local, remote) = tokio::io::duplex(self.buffer_size);
        self.sender
            .send(MemoryConnection {
                endpoint: endpoint.clone(),
                request: request.clone(),
                stream: remote,
            })
            .map_err(|_| {
                RelayError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "memory listener closed",
                ))
            })?;
        Ok(Box::new(local))
    }
}

impl MemoryListener {
    /// Wait for the next connection; `None` once the factory is dropped
    pub async fn accept(&self) -> Option<MemoryConnection> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ServiceEndpoint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;

    fn endpoint(connection_string: &str) -> HubServiceEndpoint {
        HubServiceEndpoint::new(
            "chat",
            ServiceEndpoint::from_connection_string(connection_string).unwrap(),
        )
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            hub: "chat".to_string(),
            service_connection_id: ServiceConnectionId::new(Uuid::nil()),
            connection_type: ServiceConnectionType::Default,
            target: None,
        }
    }

    #[test]
    fn test_tcp_address_resolution() {
        let cases = [
            ("Endpoint=https://relay.example.com;AccessKey=k", "relay.example.com:443"),
            ("Endpoint=http://relay.example.com;AccessKey=k", "relay.example.com:80"),
            ("Endpoint=http://localhost:7071/;AccessKey=k", "localhost:7071"),
            ("Endpoint=http://localhost:7071;AccessKey=k;Port=9000", "localhost:9000"),
            ("Endpoint=http://[::1]:7071;AccessKey=k", "[::1]:7071"),
        ];
        for (connection_string, expected) in cases {
            assert_eq!(
                TcpConnectionFactory::address(&endpoint(connection_string)).unwrap(),
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_memory_factory_round_trip() {
        let (factory, listener) = MemoryConnectionFactory::pair();
        let endpoint = endpoint("Endpoint=http://memory;AccessKey=k");

        let mut client = factory.connect(&endpoint, &request()).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.request.hub, "chat");

        client.write_all(b"ping").await.unwrap();
        let mut buffer = [0u8; 4];
        server.stream.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"ping");
        assert_eq!(factory.attempts(), 1);
    }

    #[tokio::test]
    async fn test_memory_factory_refusing() {
        let (factory, _listener) = MemoryConnectionFactory::pair();
        let endpoint = endpoint("Endpoint=http://memory;AccessKey=k");

        factory.set_refusing(true);
        let result = factory.connect(&endpoint, &request()).await;
        assert!(matches!(result, Err(RelayError::Io(_))));

        factory.set_refusing(false);
        assert!(factory.connect(&endpoint, &request()).await.is_ok());
        assert_eq!(factory.attempts(), 2);
    }
}
