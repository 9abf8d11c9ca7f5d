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

//! Service host
//!
//! The ServiceHost is the entry point for an application server. It owns the
//! client connection registry and the metrics shared by every hub, builds one
//! container per hub and coordinates start and graceful shutdown.

use crate::connection::ConnectionDependencies;
use crate::container::{ConnectionContainer, ServiceConnectionContainer};
use crate::endpoint::{HubServiceEndpoint, ServiceEndpoint};
use crate::handler::ConnectionDelegate;
use crate::manager::ClientConnectionManager;
use crate::metrics::RelayMetrics;
use crate::multi_endpoint::MultiEndpointServiceConnectionContainer;
use crate::random::{RandomSource, ThreadRandom};
use crate::router::{DefaultEndpointRouter, EndpointRouter};
use crate::shutdown::{ShutdownContext, ShutdownCoordinator, ShutdownReport};
use crate::transport::ConnectionFactory;
use crate::types::{HostSnapshot, ServiceConnectionStatus};
use crate::{RelayError, Result, ServiceOptions};
use futures::future::join_all;
use relaymux_protocol::{BinaryServiceProtocol, ServiceProtocol};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{info, instrument, warn};

struct Hub {
    name: String,
    endpoints: Vec<Arc<ServiceConnectionContainer>>,
    container: Arc<dyn ConnectionContainer>,
}

/// Relay service host
///
/// Register hubs with [`add_hub`](Self::add_hub), then call
/// [`start`](Self::start). Hubs cannot be added once the host runs.
///
/// # Example
///
/// ```no_run
/// use relaymux_service::{
///     ServiceEndpoint, ServiceHost, ServiceOptions, TcpConnectionFactory, delegate_fn,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let host = ServiceHost::new(ServiceOptions::default(), Arc::new(TcpConnectionFactory::new()))?;
///     let endpoint = ServiceEndpoint::from_connection_string(
///         "Endpoint=https://relay.example.com;AccessKey=secret;Version=1.0",
///     )?;
///     host.add_hub(
///         "chat",
///         vec![endpoint],
///         Arc::new(delegate_fn(|mut connection| async move {
///             while let Some(frame) = connection.recv().await {
///                 connection.send(frame).await?;
///             }
///             Ok::<(), relaymux_service::BoxError>(())
///         })),
///     )?;
///
///     host.start().await?;
///     // tokio::signal::ctrl_c().await?;
///     host.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct ServiceHost {
    /// Options shared by every hub
    options: ServiceOptions,
    /// Opens physical transports
    factory: Arc<dyn ConnectionFactory>,
    /// Serializes service messages
    protocol: Arc<dyn ServiceProtocol>,
    /// Endpoint selection for multi-endpoint hubs
    router: Arc<dyn EndpointRouter>,
    /// Randomness for ids and selection
    random: Arc<dyn RandomSource>,
    /// Registry shared by every hub
    client_manager: Arc<ClientConnectionManager>,
    /// Metrics shared by every hub
    metrics: Arc<RelayMetrics>,
    /// Registered hubs
    hubs: RwLock<Vec<Hub>>,
    /// Host creation time
    started_at: Instant,
    /// Running flag
    running: AtomicBool,
}

impl ServiceHost {
    /// Create a host after validating `options`
    pub fn new(options: ServiceOptions, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        options.validate()?;
        let protocol =
            Arc::new(BinaryServiceProtocol::new().with_max_frame_size(options.max_frame_size));
        Ok(Self {
            options,
            factory,
            protocol,
            router: Arc::new(DefaultEndpointRouter),
            random: Arc::new(ThreadRandom),
            client_manager: Arc::new(ClientConnectionManager::new()),
            metrics: Arc::new(RelayMetrics::new()),
            hubs: RwLock::new(Vec::new()),
            started_at: Instant::now(),
            running: AtomicBool::new(false),
        })
    }

    /// Use a different protocol for hubs added afterwards
    pub fn with_protocol(mut self, protocol: Arc<dyn ServiceProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Use a different endpoint router for hubs added afterwards
    pub fn with_router(mut self, router: Arc<dyn EndpointRouter>) -> Self {
        self.router = router;
        self
    }

    /// Use a different randomness source for hubs added afterwards
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Register a hub served by one or more endpoints
    pub fn add_hub(
        &self,
        name: impl Into<String>,
        endpoints: Vec<ServiceEndpoint>,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> Result<()> {
        let name = name.into();
        if self.is_running() {
            return Err(RelayError::InvalidArgument(format!(
                "hub '{name}' must be added before the host starts"
            )));
        }
        if name.is_empty() || endpoints.is_empty() {
            return Err(RelayError::InvalidArgument(format!(
                "hub '{name}' needs a name and at least one endpoint"
            )));
        }

        let mut hubs = self.hubs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if hubs.iter().any(|hub| hub.name == name) {
            return Err(RelayError::InvalidArgument(format!(
                "hub '{name}' is already registered"
            )));
        }

        let deps = ConnectionDependencies::new(
            Arc::clone(&self.factory),
            delegate,
            self.options.clone(),
        )
        .with_protocol(Arc::clone(&self.protocol))
        .with_client_manager(Arc::clone(&self.client_manager))
        .with_metrics(Arc::clone(&self.metrics))
        .with_random(Arc::clone(&self.random));

        let containers: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let endpoint = Arc::new(HubServiceEndpoint::new(name.clone(), endpoint));
                Arc::new(ServiceConnectionContainer::new(endpoint, deps.clone()))
            })
            .collect();
        let container: Arc<dyn ConnectionContainer> = match containers.as_slice() {
            [single] => Arc::clone(single) as Arc<dyn ConnectionContainer>,
            _ => Arc::new(MultiEndpointServiceConnectionContainer::from_containers(
                name.clone(),
                containers.clone(),
                Arc::clone(&self.router),
            )?),
        };

        info!(hub = %name, endpoints = containers.len(), "Hub registered");
        hubs.push(Hub {
            name,
            endpoints: containers,
            container,
        });
        Ok(())
    }

    /// Start every hub's container
    ///
    /// Waits for each connection's first attempt; connections that failed
    /// keep retrying in the background.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::Other("host already running".to_string()));
        }
        let containers = self.containers();
        info!(hubs = containers.len(), "Starting service host");

        let results = join_all(containers.iter().map(|container| container.start())).await;
        if let Some(Err(err)) = results.into_iter().find(Result::is_err) {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    /// Run the graceful shutdown sequence for every hub
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(RelayError::HostNotRunning);
        }
        info!("Shutting down service host");

        let contexts = {
            let hubs = self.hubs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            hubs.iter()
                .map(|hub| {
                    ShutdownContext::new(
                        hub.name.clone(),
                        Arc::clone(&hub.container),
                        Arc::clone(&self.client_manager),
                    )
                })
                .collect()
        };
        ShutdownCoordinator::new(
            self.options.graceful_shutdown.clone(),
            contexts,
            Arc::clone(&self.client_manager),
        )
        .run()
        .await
    }

    /// Container serving a hub
    pub fn container(&self, hub: &str) -> Option<Arc<dyn ConnectionContainer>> {
        self.hubs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|entry| entry.name == hub)
            .map(|entry| Arc::clone(&entry.container))
    }

    /// Per-endpoint containers of a hub, in registration order
    pub fn endpoint_containers(&self, hub: &str) -> Vec<Arc<ServiceConnectionContainer>> {
        self.hubs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|entry| entry.name == hub)
            .map(|entry| entry.endpoints.clone())
            .unwrap_or_default()
    }

    /// Names of the registered hubs
    pub fn hubs(&self) -> Vec<String> {
        self.hubs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|hub| hub.name.clone())
            .collect()
    }

    /// Check if the host is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the client connection registry
    pub fn client_manager(&self) -> Arc<ClientConnectionManager> {
        Arc::clone(&self.client_manager)
    }

    /// Get the host metrics
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Get the host options
    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Get a snapshot of the host state
    pub fn snapshot(&self) -> HostSnapshot {
        let containers = self.containers();
        HostSnapshot {
            hubs: self.hubs(),
            connected_hubs: containers
                .iter()
                .filter(|container| container.status() == ServiceConnectionStatus::Connected)
                .count(),
            client_connections: self.client_manager.count(),
            running: self.is_running(),
            uptime: self.started_at.elapsed(),
        }
    }

    fn containers(&self) -> Vec<Arc<dyn ConnectionContainer>> {
        self.hubs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|hub| Arc::clone(&hub.container))
            .collect()
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("hubs", &self.hubs())
            .field("running", &self.is_running())
            .field("client_connections", &self.client_manager.count())
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("ServiceHost dropped while still running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::delegate_fn;
    use crate::transport::MemoryConnectionFactory;

    fn endpoint(name: &str) -> ServiceEndpoint {
        ServiceEndpoint::from_connection_string("Endpoint=http://relay;AccessKey=k")
            .unwrap()
            .with_name(name)
    }

    fn host() -> ServiceHost {
        let (factory, _listener) = MemoryConnectionFactory::pair();
        ServiceHost::new(ServiceOptions::default(), Arc::new(factory)).unwrap()
    }

    fn echo() -> Arc<dyn ConnectionDelegate> {
        Arc::new(delegate_fn(|_connection| async { Ok::<(), crate::BoxError>(()) }))
    }

    #[test]
    fn test_invalid_options_rejected() {
        let (factory, _listener) = MemoryConnectionFactory::pair();
        let options = ServiceOptions::default().with_connection_count(0);
        assert!(ServiceHost::new(options, Arc::new(factory)).is_err());
    }

    #[test]
    fn test_add_hub() {
        let host = host();
        host.add_hub("chat", vec![endpoint("east")], echo()).unwrap();
        host.add_hub("news", vec![endpoint("east"), endpoint("west")], echo())
            .unwrap();

        assert_eq!(host.hubs(), ["chat", "news"]);
        assert!(host.container("chat").is_some());
        assert!(host.container("missing").is_none());
        assert_eq!(host.endpoint_containers("news").len(), 2);
        assert_eq!(
            host.container("news").unwrap().status(),
            ServiceConnectionStatus::Disconnected
        );

        let duplicate = host.add_hub("chat", vec![endpoint("east")], echo());
        assert!(matches!(duplicate, Err(RelayError::InvalidArgument(_))));
        let empty = host.add_hub("empty", Vec::new(), echo());
        assert!(matches!(empty, Err(RelayError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_shutdown_requires_running() {
        let host = host();
        assert!(matches!(host.shutdown().await, Err(RelayError::HostNotRunning)));
    }

    #[test]
    fn test_snapshot() {
        let host = host();
        host.add_hub("chat", vec![endpoint("east")], echo()).unwrap();
        let snapshot = host.snapshot();
        assert_eq!(snapshot.hubs, ["chat"]);
        assert_eq!(snapshot.connected_hubs, 0);
        assert_eq!(snapshot.client_connections, 0);
        assert!(!snapshot.running);
        assert!(snapshot.to_string().starts_with("ServiceHost { hubs: 1"));
    }
}
