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

//! Sticky connection selection for a logical flow of work
//!
//! Messages sent from one flow (for example, one hub method invocation) should
//! reach the relay in the order they were sent, even when they go out through
//! different container calls. Running the flow inside
//! [`ConnectionScope::run`] pins, per container, the physical connection the
//! first send selected; later sends in the same flow reuse it, keyed or not.
//! A partition key only chooses the slot when the flow has no pin yet for
//! that container. Every client connection's application already runs inside
//! its own scope.
//!
//! The scope lives in a tokio task-local, so it follows the future it wraps
//! but not tasks that future spawns. Capture [`ConnectionScope::current`] and
//! re-enter it with [`ConnectionScope::scope`] to share it with a spawned task.

use crate::types::ServiceConnectionId;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: Arc<ConnectionScope>;
}

/// A connection pinned by a scope for one container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedConnection {
    /// Slot index inside the container
    pub index: usize,
    /// Connection occupying the slot when it was pinned
    pub service_connection_id: ServiceConnectionId,
}

/// Per-flow record of the connection chosen by each container
#[derive(Debug, Default)]
pub struct ConnectionScope {
    pinned: DashMap<Uuid, PinnedConnection>,
    connection_changed: AtomicBool,
}

impl ConnectionScope {
    /// Create an empty scope
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `future` inside a new scope, or inside the current one if the
    /// caller is already scoped
    pub async fn run<F: Future>(future: F) -> F::Output {
        if Self::current().is_some() {
            future.await
        } else {
            CURRENT.scope(Self::new(), future).await
        }
    }

    /// Run `future` inside this scope.
    ///
    /// When the caller is already inside a scope that outer scope is kept.
    pub async fn scope<F: Future>(self: Arc<Self>, future: F) -> F::Output {
        if Self::current().is_some() {
            future.await
        } else {
            CURRENT.scope(self, future).await
        }
    }

    /// The scope of the running task, if any
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    /// Whether any pinned connection had to be replaced during the flow
    pub fn connection_changed(&self) -> bool {
        self.connection_changed.load(Ordering::Acquire)
    }

    /// Connection pinned for a container
    pub fn pinned(&self, container: Uuid) -> Option<PinnedConnection> {
        self.pinned.get(&container).map(|entry| *entry.value())
    }

    /// Pin a connection for a container.
    ///
    /// Replacing an existing pin with a different connection marks the scope
    /// as changed.
    pub fn pin(&self, container: Uuid, connection: PinnedConnection) {
        let previous = self.pinned.insert(container, connection);
        if previous.is_some_and(|previous| previous != connection) {
            self.connection_changed.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(index: usize, id: u128) -> PinnedConnection {
        PinnedConnection {
            index,
            service_connection_id: ServiceConnectionId::new(Uuid::from_u128(id)),
        }
    }

    #[tokio::test]
    async fn test_no_scope_outside_run() {
        assert!(ConnectionScope::current().is_none());
        let inside = ConnectionScope::run(async { ConnectionScope::current().is_some() }).await;
        assert!(inside);
    }

    #[tokio::test]
    async fn test_nested_run_reuses_outer_scope() {
        let container = Uuid::from_u128(1);
        ConnectionScope::run(async {
            let outer = ConnectionScope::current().unwrap();
            outer.pin(container, pin(2, 7));
            let inner = ConnectionScope::run(async { ConnectionScope::current().unwrap() }).await;
            assert!(Arc::ptr_eq(&outer, &inner));
            assert_eq!(inner.pinned(container), Some(pin(2, 7)));
        })
        .await;
    }

    #[test]
    fn test_repin_marks_changed() {
        let scope = ConnectionScope::new();
        let container = Uuid::from_u128(1);
        scope.pin(container, pin(0, 1));
        scope.pin(container, pin(0, 1));
        assert!(!scope.connection_changed());

        scope.pin(Uuid::from_u128(2), pin(1, 2));
        assert!(!scope.connection_changed());

        scope.pin(container, pin(3, 9));
        assert!(scope.connection_changed());
    }

    #[tokio::test]
    async fn test_explicit_scope_shared_with_spawned_task() {
        let scope = ConnectionScope::new();
        let container = Uuid::from_u128(5);
        let handle = tokio::spawn(scope.clone().scope(async move {
            ConnectionScope::current().unwrap().pin(container, pin(1, 1));
        }));
        handle.await.unwrap();
        assert_eq!(scope.pinned(container), Some(pin(1, 1)));
    }
}
