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

//! Client connection registry
//!
//! The ClientConnectionManager is responsible for:
//! - Holding the one canonical context per live client connection id
//! - Rejecting duplicate registrations
//! - Publishing the live connection count for graceful shutdown

use crate::context::ClientConnectionContext;
use crate::{RelayError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Registry of every live client connection across hubs and endpoints
#[derive(Debug)]
pub struct ClientConnectionManager {
    connections: DashMap<String, Arc<ClientConnectionContext>>,
    count: watch::Sender<usize>,
}

impl Default for ClientConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConnectionManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            count: watch::Sender::new(0),
        }
    }

    /// Register a context under its connection id
    pub fn add_client_connection(&self, context: Arc<ClientConnectionContext>) -> Result<()> {
        match self.connections.entry(context.connection_id().to_string()) {
            Entry::Occupied(entry) => {
                return Err(RelayError::DuplicateConnection(entry.key().clone()));
            }
            Entry::Vacant(entry) => {
                debug!(connection_id = %context.connection_id(), hub = %context.hub(), "Registered client connection");
                entry.insert(context);
            }
        }
        self.publish_count();
        Ok(())
    }

    /// Unregister a context; returns it when it was registered
    pub fn remove_client_connection(
        &self,
        connection_id: &str,
    ) -> Option<Arc<ClientConnectionContext>> {
        let removed = self.connections.remove(connection_id).map(|(_, context)| context);
        if removed.is_some() {
            debug!(connection_id, "Unregistered client connection");
            self.publish_count();
        }
        removed
    }

    /// Look up a context by connection id
    pub fn client_connection(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every registered context
    pub fn client_connections(&self) -> Vec<Arc<ClientConnectionContext>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Abort every registered connection's application and outgoing pump
    pub fn abort_all(&self) {
        let contexts = self.client_connections();
        if !contexts.is_empty() {
            info!(count = contexts.len(), "Aborting client connections");
        }
        for context in contexts {
            context.abort_application();
            context.abort_outgoing();
        }
    }

    /// Wait until the registry is empty; returns `false` on timeout
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let mut count = self.count.subscribe();
        tokio::time::timeout(timeout, count.wait_for(|count| *count == 0))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    fn publish_count(&self) {
        // read the length under the watch lock so the last publish always wins
        self.count.send_modify(|count| *count = self.connections.len());
    }
}
