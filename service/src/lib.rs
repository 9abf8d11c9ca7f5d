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

//! # Relaymux Service
//!
//! Offloads real-time client connections to a hosted relay while hub logic
//! stays on the application server. A handful of persistent, multiplexed
//! service connections per hub and endpoint carry every tunneled client
//! connection, with per-client ordering, reconnection, migration and graceful
//! shutdown.
//!
//! # Architecture
//!
//! ```text
//! ServiceHost
//!     ↓
//! MultiEndpointServiceConnectionContainer   (one per hub, routes by EndpointRouter)
//!     ↓
//! ServiceConnectionContainer                (one per endpoint, fixed slots)
//!     ↓
//! ServiceConnection → ClientConnectionContext → ConnectionDelegate
//! ```
//!
//! - [`ServiceConnection`] runs the handshake, the relay read loop and the
//!   keep-alive ping, and owns one task per tunneled client connection.
//! - [`ServiceConnectionContainer`] keeps `connection_count` connections alive
//!   with exponential backoff and pins partition keys to slots.
//! - [`ClientConnectionManager`] is the one registry of live client
//!   connections; a second registration of the same id fails.
//! - [`ConnectionScope`] keeps a flow of sends on the connection it started on.
//! - [`GracefulShutdownOptions`] controls how [`ServiceHost::shutdown`] drains
//!   clients and which per-hub callbacks it runs.
//!
//! # Example
//!
//! ```no_run
//! use relaymux_service::{
//!     ClientConnection, ConnectionContainer, ServiceEndpoint, ServiceHost, ServiceOptions,
//!     TcpConnectionFactory, delegate_fn,
//! };
//! use relaymux_protocol::ServiceMessage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = ServiceHost::new(ServiceOptions::default(), Arc::new(TcpConnectionFactory::new()))?;
//!     host.add_hub(
//!         "chat",
//!         vec![ServiceEndpoint::from_connection_string(
//!             "Endpoint=https://relay.example.com;AccessKey=secret",
//!         )?],
//!         Arc::new(delegate_fn(|mut connection: ClientConnection| async move {
//!             while let Some(frame) = connection.recv().await {
//!                 connection.send(frame).await?;
//!             }
//!             Ok::<(), relaymux_service::BoxError>(())
//!         })),
//!     )?;
//!     host.start().await?;
//!
//!     if let Some(chat) = host.container("chat") {
//!         chat.write_keyed("conn-1", ServiceMessage::connection_data("conn-1", "hello"))
//!             .await?;
//!     }
//!
//!     host.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(
    clippy::cargo,
    missing_docs,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms
)]
#![allow(
    clippy::option_if_let_else,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

mod ack;
mod config;
mod connection;
mod container;
mod context;
mod endpoint;
mod error;
mod handler;
mod host;
mod manager;
mod metrics;
mod multi_endpoint;
mod random;
mod router;
mod scope;
mod shutdown;
mod transport;
mod types;

pub use ack::AckHandler;
pub use config::{ReconnectPolicy, ServiceOptions};
pub use connection::{ConnectionDependencies, OFFLINE_CLOSE_REASON, ServiceConnection};
pub use container::{ConnectionContainer, ServiceConnectionContainer, partition_index};
pub use context::{ClientConnection, ClientConnectionContext, ClientSender, USER_ID_CLAIM, WriteState};
pub use endpoint::{EndpointType, HubServiceEndpoint, ServiceEndpoint};
pub use error::{BoxError, RelayError, Result};
pub use handler::{ConnectionDelegate, FnDelegate, delegate_fn};
pub use host::ServiceHost;
pub use manager::ClientConnectionManager;
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use multi_endpoint::MultiEndpointServiceConnectionContainer;
pub use random::{RandomSource, SeededRandom, ThreadRandom};
pub use router::{DefaultEndpointRouter, EndpointRouter};
pub use scope::{ConnectionScope, PinnedConnection};
pub use shutdown::{
    GracefulShutdownMode, GracefulShutdownOptions, ShutdownContext, ShutdownCoordinator,
    ShutdownReport,
};
pub use transport::{
    BoxedTransport, ConnectRequest, ConnectionFactory, MemoryConnection, MemoryConnectionFactory,
    MemoryListener, RelayTransport, TcpConnectionFactory,
};
pub use types::{
    HostSnapshot, ServiceConnectionId, ServiceConnectionInfo, ServiceConnectionStatus,
    StatusChange,
};
