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

//! Application entry points for tunneled client connections

use crate::context::ClientConnection;
use crate::error::BoxError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;

/// Application logic run for every client connection the relay opens.
///
/// The service connection calls [`on_connected`](Self::on_connected) on its
/// own task as soon as an `OpenConnection` arrives. The client connection
/// stays open until the returned future completes (the server closes it, with
/// the error text when one is returned) or the relay closes it (the
/// connection's inbound stream ends).
///
/// # Example
///
/// ```no_run
/// use relaymux_service::{BoxError, ClientConnection, ConnectionDelegate};
/// use async_trait::async_trait;
///
/// struct Echo;
///
/// #[async_trait]
/// impl ConnectionDelegate for Echo {
///     async fn on_connected(&self, mut connection: ClientConnection) -> Result<(), BoxError> {
///         while let Some(payload) = connection.recv().await {
///             connection.send(payload).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ConnectionDelegate: Send + Sync + 'static {
    /// Run the application for one client connection
    async fn on_connected(&self, connection: ClientConnection) -> Result<(), BoxError>;
}

/// Closure-based delegate
///
/// Wraps any `Fn(ClientConnection) -> Future` so small applications and tests
/// need not declare a type.
pub struct FnDelegate<F> {
    f: F,
}

/// Build a delegate from a closure
///
/// ```no_run
/// use relaymux_service::delegate_fn;
///
/// let delegate = delegate_fn(|mut connection| async move {
///     while connection.recv().await.is_some() {}
///     Ok::<(), relaymux_service::BoxError>(())
/// });
/// ```
pub fn delegate_fn<F, Fut>(f: F) -> FnDelegate<F>
where
    F: Fn(ClientConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    FnDelegate { f }
}

#[async_trait]
impl<F, Fut> ConnectionDelegate for FnDelegate<F>
where
    F: Fn(ClientConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn on_connected(&self, connection: ClientConnection) -> Result<(), BoxError> {
        (self.f)(connection).await
    }
}

impl<F> fmt::Debug for FnDelegate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDelegate").finish_non_exhaustive()
    }
}
