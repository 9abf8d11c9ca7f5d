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

//! Graceful shutdown of a service host
//!
//! Shutdown runs in four steps:
//!
//! 1. Every container goes offline, so the relay stops routing new clients
//!    here and, in [`GracefulShutdownMode::MigrateClients`], starts moving
//!    existing clients to other servers.
//! 2. Callbacks registered for the active hubs run, each in its own task.
//!    A failing or panicking callback is logged and does not hold back the
//!    others.
//! 3. Open client connections are given until the deadline to close on their
//!    own, or are aborted straight away in [`GracefulShutdownMode::Off`].
//! 4. Every container stops.
//!
//! Steps 1 to 3 share the [`GracefulShutdownOptions::timeout`] budget; the
//! stop step gets a budget of its own.

use crate::container::ConnectionContainer;
use crate::error::BoxError;
use crate::manager::ClientConnectionManager;
use crate::{RelayError, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// How client connections are treated when the host shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GracefulShutdownMode {
    /// Abort open client connections immediately
    Off,
    /// Wait for client connections to close on their own
    #[default]
    WaitForClientsClose,
    /// Ask the relay to migrate client connections to other servers
    MigrateClients,
}

impl GracefulShutdownMode {
    /// Whether the offline announcement allows migration
    pub fn is_migratable(self) -> bool {
        self == Self::MigrateClients
    }
}

impl fmt::Display for GracefulShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::WaitForClientsClose => write!(f, "wait-for-clients-close"),
            Self::MigrateClients => write!(f, "migrate-clients"),
        }
    }
}

/// What a shutdown callback can see of its hub
#[derive(Clone)]
pub struct ShutdownContext {
    hub: String,
    container: Arc<dyn ConnectionContainer>,
    client_manager: Arc<ClientConnectionManager>,
}

impl ShutdownContext {
    /// Create a context for one hub
    pub fn new(
        hub: impl Into<String>,
        container: Arc<dyn ConnectionContainer>,
        client_manager: Arc<ClientConnectionManager>,
    ) -> Self {
        Self {
            hub: hub.into(),
            container,
            client_manager,
        }
    }

    /// Hub name
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Container serving the hub, still able to write while callbacks run
    pub fn container(&self) -> &Arc<dyn ConnectionContainer> {
        &self.container
    }

    /// Registry of open client connections
    pub fn client_manager(&self) -> &Arc<ClientConnectionManager> {
        &self.client_manager
    }
}

impl fmt::Debug for ShutdownContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownContext")
            .field("hub", &self.hub)
            .field("clients", &self.client_manager.count())
            .finish_non_exhaustive()
    }
}

type CallbackFn = dyn Fn(ShutdownContext) -> BoxFuture<'static, std::result::Result<(), BoxError>>
    + Send
    + Sync;

/// Shutdown behavior and the per-hub callbacks to run
#[derive(Clone)]
pub struct GracefulShutdownOptions {
    /// How open client connections are treated
    pub mode: GracefulShutdownMode,
    /// Budget for going offline, running callbacks and draining clients
    pub timeout: Duration,
    callbacks: HashMap<String, Vec<Arc<CallbackFn>>>,
}

impl Default for GracefulShutdownOptions {
    fn default() -> Self {
        Self {
            mode: GracefulShutdownMode::default(),
            timeout: Duration::from_secs(30),
            callbacks: HashMap::new(),
        }
    }
}

impl GracefulShutdownOptions {
    /// Options with the default mode and timeout and no callbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mode
    pub fn with_mode(mut self, mode: GracefulShutdownMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a callback for the hub named after `H`
    pub fn add<H, F>(&mut self, callback: F) -> &mut Self
    where
        H: ?Sized + 'static,
        F: Fn() -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.add_for_hub(hub_name::<H>(), callback)
    }

    /// Register an async callback for the hub named after `H`
    pub fn add_async<H, F, Fut>(&mut self, callback: F) -> &mut Self
    where
        H: ?Sized + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.add_async_for_hub(hub_name::<H>(), callback)
    }

    /// Register a callback that receives the hub's [`ShutdownContext`]
    pub fn add_with_context<H, F>(&mut self, callback: F) -> &mut Self
    where
        H: ?Sized + 'static,
        F: Fn(&ShutdownContext) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.add_with_context_for_hub(hub_name::<H>(), callback)
    }

    /// Register an async callback that receives the hub's [`ShutdownContext`]
    pub fn add_async_with_context<H, F, Fut>(&mut self, callback: F) -> &mut Self
    where
        H: ?Sized + 'static,
        F: Fn(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.add_async_with_context_for_hub(hub_name::<H>(), callback)
    }

    /// Register a callback for a hub by name
    pub fn add_for_hub<F>(&mut self, hub: impl AsRef<str>, callback: F) -> &mut Self
    where
        F: Fn() -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.push(
            hub.as_ref(),
            Arc::new(move |_: ShutdownContext| std::future::ready(callback()).boxed()),
        )
    }

    /// Register an async callback for a hub by name
    pub fn add_async_for_hub<F, Fut>(&mut self, hub: impl AsRef<str>, callback: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.push(hub.as_ref(), Arc::new(move |_: ShutdownContext| callback().boxed()))
    }

    /// Register a context callback for a hub by name
    pub fn add_with_context_for_hub<F>(&mut self, hub: impl AsRef<str>, callback: F) -> &mut Self
    where
        F: Fn(&ShutdownContext) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.push(
            hub.as_ref(),
            Arc::new(move |context: ShutdownContext| {
                std::future::ready(callback(&context)).boxed()
            }),
        )
    }

    /// Register an async context callback for a hub by name
    pub fn add_async_with_context_for_hub<F, Fut>(
        &mut self,
        hub: impl AsRef<str>,
        callback: F,
    ) -> &mut Self
    where
        F: Fn(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.push(
            hub.as_ref(),
            Arc::new(move |context: ShutdownContext| callback(context).boxed()),
        )
    }

    /// Number of callbacks registered for a hub
    pub fn callback_count(&self, hub: &str) -> usize {
        self.callbacks
            .get(&hub.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }

    fn push(&mut self, hub: &str, callback: Arc<CallbackFn>) -> &mut Self {
        self.callbacks
            .entry(hub.to_ascii_lowercase())
            .or_default()
            .push(callback);
        self
    }

    fn callbacks_for(&self, hub: &str) -> &[Arc<CallbackFn>] {
        self.callbacks
            .get(&hub.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl fmt::Debug for GracefulShutdownOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks: HashMap<_, _> = self
            .callbacks
            .iter()
            .map(|(hub, callbacks)| (hub.as_str(), callbacks.len()))
            .collect();
        f.debug_struct("GracefulShutdownOptions")
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("callbacks", &callbacks)
            .finish()
    }
}

/// Hub key for a type: its name without module path or generics
fn hub_name<H: ?Sized + 'static>() -> &'static str {
    let name = std::any::type_name::<H>();
    let name = name.split('<').next().unwrap_or(name);
    name.rsplit("::").next().unwrap_or(name)
}

/// Outcome of a shutdown run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Mode the shutdown ran in
    pub mode: GracefulShutdownMode,
    /// Callbacks started
    pub callbacks_run: usize,
    /// Callbacks that returned an error, panicked or ran out of time
    pub callbacks_failed: usize,
    /// Whether every client connection closed before the deadline
    pub clients_drained: bool,
    /// Client connections aborted by the shutdown
    pub clients_aborted: usize,
    /// Time the whole shutdown took
    pub elapsed: Duration,
}

/// Runs the shutdown steps over a set of hubs
pub struct ShutdownCoordinator {
    options: GracefulShutdownOptions,
    hubs: Vec<ShutdownContext>,
    client_manager: Arc<ClientConnectionManager>,
}

impl ShutdownCoordinator {
    /// Create a coordinator for the given hubs
    pub fn new(
        options: GracefulShutdownOptions,
        hubs: Vec<ShutdownContext>,
        client_manager: Arc<ClientConnectionManager>,
    ) -> Self {
        Self {
            options,
            hubs,
            client_manager,
        }
    }

    /// Run every step and report what happened.
    ///
    /// Fails with [`RelayError::ShutdownTimeout`] only when stopping the
    /// containers overruns its own budget.
    #[instrument(skip(self), fields(mode = %self.options.mode, hubs = self.hubs.len()))]
    pub async fn run(self) -> Result<ShutdownReport> {
        let started = Instant::now();
        let deadline = started + self.options.timeout;
        let mode = self.options.mode;
        info!(timeout = ?self.options.timeout, "Graceful shutdown started");

        self.go_offline(mode).await;
        let (callbacks_run, callbacks_failed) = self.run_callbacks(deadline).await;

        let open = self.client_manager.count();
        let clients_drained = if mode == GracefulShutdownMode::Off {
            open == 0
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(clients = open, ?remaining, "Waiting for client connections to close");
            self.client_manager.wait_until_empty(remaining).await
        };
        let clients_aborted = if clients_drained {
            0
        } else {
            let count = self.client_manager.count();
            if mode != GracefulShutdownMode::Off {
                warn!(clients = count, "Client connections still open at shutdown deadline");
            }
            self.client_manager.abort_all();
            count
        };

        let stop_budget = self.options.timeout;
        let stopped = tokio::time::timeout(
            stop_budget,
            join_all(self.hubs.iter().map(|hub| hub.container.stop())),
        )
        .await;
        match stopped {
            Ok(results) => {
                for (hub, result) in self.hubs.iter().zip(results) {
                    if let Err(err) = result {
                        warn!(hub = %hub.hub, error = %err, "Failed to stop container");
                    }
                }
            }
            Err(_) => {
                error!(timeout = ?stop_budget, "Containers did not stop in time");
                return Err(RelayError::ShutdownTimeout(stop_budget));
            }
        }

        let report = ShutdownReport {
            mode,
            callbacks_run,
            callbacks_failed,
            clients_drained,
            clients_aborted,
            elapsed: started.elapsed(),
        };
        info!(
            callbacks_run,
            callbacks_failed,
            clients_drained,
            clients_aborted,
            elapsed = ?report.elapsed,
            "Graceful shutdown complete"
        );
        Ok(report)
    }

    async fn go_offline(&self, mode: GracefulShutdownMode) {
        let migratable = mode.is_migratable();
        let results = join_all(self.hubs.iter().map(|hub| hub.container.offline(migratable))).await;
        for (hub, result) in self.hubs.iter().zip(results) {
            if let Err(err) = result {
                warn!(hub = %hub.hub, error = %err, "Failed to take container offline");
            }
        }
    }

    async fn run_callbacks(&self, deadline: Instant) -> (usize, usize) {
        let mut tasks = JoinSet::new();
        for hub in &self.hubs {
            for callback in self.options.callbacks_for(&hub.hub) {
                let callback = Arc::clone(callback);
                let context = hub.clone();
                tasks.spawn(async move {
                    let name = context.hub.clone();
                    (name, callback(context).await)
                });
            }
        }
        let started = tasks.len();
        if started == 0 {
            return (0, 0);
        }

        let mut failed = 0;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((_, Ok(()))))) => {}
                Ok(Some(Ok((hub, Err(err))))) => {
                    failed += 1;
                    error!(hub = %hub, error = %err, "Shutdown callback failed");
                }
                Ok(Some(Err(err))) => {
                    failed += 1;
                    if err.is_panic() {
                        error!("Shutdown callback panicked");
                    } else {
                        error!(error = %err, "Shutdown callback was cancelled");
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    failed += tasks.len();
                    warn!(pending = tasks.len(), "Shutdown callbacks did not finish in time");
                    tasks.shutdown().await;
                    break;
                }
            }
        }
        (started, failed)
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("options", &self.options)
            .field("hubs", &self.hubs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceConnectionStatus;
    use async_trait::async_trait;
    use relaymux_protocol::ServiceMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ChatHub;

    mod nested {
        pub struct Generic<T>(pub T);
    }

    #[derive(Default)]
    struct RecordingContainer {
        offline: AtomicUsize,
        migratable: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionContainer for RecordingContainer {
        fn hub(&self) -> &str {
            "chat"
        }

        fn status(&self) -> ServiceConnectionStatus {
            ServiceConnectionStatus::Connected
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn write(&self, _message: ServiceMessage) -> Result<()> {
            Ok(())
        }

        async fn write_keyed(&self, _key: &str, _message: ServiceMessage) -> Result<()> {
            Ok(())
        }

        async fn write_ackable(&self, _message: ServiceMessage, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn offline(&self, migratable: bool) -> Result<()> {
            self.offline.fetch_add(1, Ordering::SeqCst);
            if migratable {
                self.migratable.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn coordinator(
        options: GracefulShutdownOptions,
    ) -> (ShutdownCoordinator, Arc<RecordingContainer>) {
        let container = Arc::new(RecordingContainer::default());
        let manager = Arc::new(ClientConnectionManager::new());
        let context = ShutdownContext::new("chat", container.clone(), manager.clone());
        (
            ShutdownCoordinator::new(options, vec![context], manager),
            container,
        )
    }

    #[test]
    fn test_hub_name() {
        assert_eq!(hub_name::<ChatHub>(), "ChatHub");
        assert_eq!(hub_name::<nested::Generic<u8>>(), "Generic");
    }

    #[test]
    fn test_callbacks_keyed_by_hub() {
        let mut options = GracefulShutdownOptions::new();
        options
            .add::<ChatHub, _>(|| Ok(()))
            .add_for_hub("chat", || Ok(()))
            .add_async_for_hub("Chat", || async { Ok::<(), BoxError>(()) });
        assert_eq!(options.callback_count("ChatHub"), 1);
        assert_eq!(options.callback_count("chat"), 2);
        assert_eq!(options.callback_count("other"), 0);
        assert!(format!("{options:?}").contains("WaitForClientsClose"));
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_block_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut options = GracefulShutdownOptions::new().with_timeout(Duration::from_secs(1));
        let first = calls.clone();
        let second = calls.clone();
        options
            .add_for_hub("chat", move || {
                first.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            })
            .add_async_with_context_for_hub("chat", move |context| {
                let second = second.clone();
                async move {
                    assert_eq!(context.hub(), "chat");
                    second.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), BoxError>(())
                }
            });

        let (coordinator, container) = coordinator(options);
        let report = coordinator.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.callbacks_run, 2);
        assert_eq!(report.callbacks_failed, 1);
        assert!(report.clients_drained);
        assert_eq!(container.offline.load(Ordering::SeqCst), 1);
        assert_eq!(container.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let mut options = GracefulShutdownOptions::new();
        options.add_for_hub("chat", || panic!("callback panic"));
        let (coordinator, container) = coordinator(options);
        let report = coordinator.run().await.unwrap();
        assert_eq!(report.callbacks_failed, 1);
        assert_eq!(container.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_callback_bounded_by_timeout() {
        let mut options = GracefulShutdownOptions::new().with_timeout(Duration::from_secs(2));
        options.add_async_for_hub("chat", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), BoxError>(())
        });
        let (coordinator, _container) = coordinator(options);
        let report = coordinator.run().await.unwrap();
        assert_eq!(report.callbacks_failed, 1);
        assert!(report.elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_migrate_mode_offlines_migratable() {
        let options =
            GracefulShutdownOptions::new().with_mode(GracefulShutdownMode::MigrateClients);
        let (coordinator, container) = coordinator(options);
        let report = coordinator.run().await.unwrap();
        assert_eq!(report.mode, GracefulShutdownMode::MigrateClients);
        assert_eq!(container.migratable.load(Ordering::SeqCst), 1);
    }
}
