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

//! Hubs served by several relay endpoints

use crate::connection::ConnectionDependencies;
use crate::container::{ConnectionContainer, ServiceConnectionContainer};
use crate::endpoint::HubServiceEndpoint;
use crate::router::EndpointRouter;
use crate::types::ServiceConnectionStatus;
use crate::{RelayError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use relaymux_protocol::ServiceMessage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// One [`ServiceConnectionContainer`] per endpoint behind a single container.
///
/// Every write asks the [`EndpointRouter`] which endpoints the message
/// belongs to and fans out to all of them concurrently. The write completes
/// once every selected endpoint finished; the first failure is returned after
/// that, and deliveries that succeeded are not rolled back.
pub struct MultiEndpointServiceConnectionContainer {
    hub: String,
    endpoints: Vec<Arc<HubServiceEndpoint>>,
    containers: Vec<Arc<ServiceConnectionContainer>>,
    router: Arc<dyn EndpointRouter>,
}

impl MultiEndpointServiceConnectionContainer {
    /// Create one container per endpoint
    pub fn new(
        hub: impl Into<String>,
        endpoints: Vec<Arc<HubServiceEndpoint>>,
        deps: &ConnectionDependencies,
        router: Arc<dyn EndpointRouter>,
    ) -> Result<Self> {
        let containers = endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(ServiceConnectionContainer::new(
                    Arc::clone(endpoint),
                    deps.clone(),
                ))
            })
            .collect();
        Self::from_containers(hub, containers, router)
    }

    /// Compose existing containers
    pub fn from_containers(
        hub: impl Into<String>,
        containers: Vec<Arc<ServiceConnectionContainer>>,
        router: Arc<dyn EndpointRouter>,
    ) -> Result<Self> {
        let hub = hub.into();
        if containers.is_empty() {
            return Err(RelayError::InvalidArgument(format!(
                "hub '{hub}' needs at least one endpoint"
            )));
        }
        if let Some(other) = containers.iter().find(|c| c.hub() != hub) {
            return Err(RelayError::InvalidArgument(format!(
                "container for hub '{}' cannot serve hub '{hub}'",
                other.hub()
            )));
        }
        let endpoints = containers.iter().map(|c| Arc::clone(c.endpoint())).collect();
        Ok(Self {
            hub,
            endpoints,
            containers,
            router,
        })
    }

    /// Endpoints of the hub, in configuration order
    pub fn endpoints(&self) -> &[Arc<HubServiceEndpoint>] {
        &self.endpoints
    }

    /// Per-endpoint containers, in configuration order
    pub fn containers(&self) -> &[Arc<ServiceConnectionContainer>] {
        &self.containers
    }

    /// Container of the endpoint with the given name
    pub fn container(&self, endpoint_name: &str) -> Option<&Arc<ServiceConnectionContainer>> {
        self.containers
            .iter()
            .find(|container| container.endpoint().name() == endpoint_name)
    }

    /// Endpoints the router selects for a message
    pub fn route(&self, message: &ServiceMessage) -> Vec<Arc<HubServiceEndpoint>> {
        let router = self.router.as_ref();
        let endpoints = self.endpoints.as_slice();
        match message {
            ServiceMessage::OpenConnection { connection_id, .. }
            | ServiceMessage::CloseConnection { connection_id, .. }
            | ServiceMessage::ConnectionData { connection_id, .. } => {
                router.endpoints_for_connection(connection_id, endpoints)
            }
            ServiceMessage::MultiConnectionData { connection_ids, .. } => self.union(
                connection_ids
                    .iter()
                    .map(|id| router.endpoints_for_connection(id, endpoints)),
            ),
            ServiceMessage::GroupBroadcastData { group, .. }
            | ServiceMessage::JoinGroupWithAck { group, .. }
            | ServiceMessage::LeaveGroupWithAck { group, .. } => {
                router.endpoints_for_group(group, endpoints)
            }
            ServiceMessage::MultiGroupBroadcastData { groups, .. } => self.union(
                groups
                    .iter()
                    .map(|group| router.endpoints_for_group(group, endpoints)),
            ),
            ServiceMessage::UserData { user_id, .. } => router.endpoints_for_user(user_id, endpoints),
            ServiceMessage::MultiUserData { user_ids, .. } => self.union(
                user_ids
                    .iter()
                    .map(|user| router.endpoints_for_user(user, endpoints)),
            ),
            _ => router.endpoints_for_broadcast(endpoints),
        }
    }

    fn union(
        &self,
        selections: impl Iterator<Item = Vec<Arc<HubServiceEndpoint>>>,
    ) -> Vec<Arc<HubServiceEndpoint>> {
        let mut selected = vec![false; self.endpoints.len()];
        for selection in selections {
            for endpoint in selection {
                if let Some(position) = self.endpoints.iter().position(|e| Arc::ptr_eq(e, &endpoint)) {
                    selected[position] = true;
                }
            }
        }
        self.endpoints
            .iter()
            .zip(selected)
            .filter(|(_, selected)| *selected)
            .map(|(endpoint, _)| Arc::clone(endpoint))
            .collect()
    }

    fn targets(&self, message: &ServiceMessage) -> Result<Vec<&Arc<ServiceConnectionContainer>>> {
        let selected = self.route(message);
        let targets: Vec<_> = self
            .containers
            .iter()
            .filter(|container| {
                selected
                    .iter()
                    .any(|endpoint| Arc::ptr_eq(endpoint, container.endpoint()))
            })
            .collect();
        if targets.is_empty() {
            return Err(RelayError::NoEndpointAvailable(self.hub.clone()));
        }
        debug!(hub = %self.hub, kind = %message.kind(), endpoints = targets.len(), "Routing message");
        Ok(targets)
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

#[async_trait]
impl ConnectionContainer for MultiEndpointServiceConnectionContainer {
    fn hub(&self) -> &str {
        &self.hub
    }

    fn status(&self) -> ServiceConnectionStatus {
        let statuses: Vec<_> = self.containers.iter().map(|c| c.status()).collect();
        if statuses.contains(&ServiceConnectionStatus::Connected) {
            ServiceConnectionStatus::Connected
        } else if statuses.contains(&ServiceConnectionStatus::Connecting) {
            ServiceConnectionStatus::Connecting
        } else {
            ServiceConnectionStatus::Disconnected
        }
    }

    #[instrument(skip(self), fields(hub = %self.hub))]
    async fn start(&self) -> Result<()> {
        first_error(join_all(self.containers.iter().map(|c| c.start())).await)
    }

    #[instrument(skip(self), fields(hub = %self.hub))]
    async fn stop(&self) -> Result<()> {
        first_error(join_all(self.containers.iter().map(|c| c.stop())).await)
    }

    async fn write(&self, message: ServiceMessage) -> Result<()> {
        let targets = self.targets(&message)?;
        first_error(join_all(targets.iter().map(|c| c.write(message.clone()))).await)
    }

    async fn write_keyed(&self, partition_key: &str, message: ServiceMessage) -> Result<()> {
        let targets = self.targets(&message)?;
        first_error(
            join_all(
                targets
                    .iter()
                    .map(|c| c.write_keyed(partition_key, message.clone())),
            )
            .await,
        )
    }

    async fn write_ackable(&self, message: ServiceMessage, timeout: Duration) -> Result<bool> {
        let targets = self.targets(&message)?;
        let results = join_all(
            targets
                .iter()
                .map(|c| c.write_ackable(message.clone(), timeout)),
        )
        .await;

        let mut first_err = None;
        let mut any_answer = false;
        for result in results {
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => any_answer = true,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) if !any_answer => Err(err),
            _ => Ok(false),
        }
    }

    async fn offline(&self, migratable: bool) -> Result<()> {
        first_error(join_all(self.containers.iter().map(|c| c.offline(migratable))).await)
    }
}

impl fmt::Debug for MultiEndpointServiceConnectionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiEndpointServiceConnectionContainer")
            .field("hub", &self.hub)
            .field("containers", &self.containers)
            .finish_non_exhaustive()
    }
}
