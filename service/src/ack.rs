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

//! Acknowledgement correlation for ackable messages

use crate::{RelayError, Result};
use dashmap::DashMap;
use relaymux_protocol::AckStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// Tracks ackable messages awaiting a relay `Ack`.
///
/// Ids are unique for the lifetime of the handler, so one handler can be
/// shared by every connection of a host.
#[derive(Debug, Default)]
pub struct AckHandler {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<AckStatus>>,
}

impl AckHandler {
    /// Create an empty handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an ack id and the receiver its status will arrive on
    pub fn register(&self) -> (u64, oneshot::Receiver<AckStatus>) {
        let ack_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(ack_id, sender);
        (ack_id, receiver)
    }

    /// Resolve a pending ack; returns `false` for unknown or expired ids
    pub fn trigger(&self, ack_id: u64, status: AckStatus) -> bool {
        match self.pending.remove(&ack_id) {
            Some((_, sender)) => sender.send(status).is_ok(),
            None => {
                trace!(ack_id, "Ack for unknown id");
                false
            }
        }
    }

    /// Forget a pending ack
    pub fn cancel(&self, ack_id: u64) {
        self.pending.remove(&ack_id);
    }

    /// Number of acks still outstanding
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the status of `ack_id`, forgetting it on timeout
    pub async fn wait(
        &self,
        ack_id: u64,
        receiver: oneshot::Receiver<AckStatus>,
        timeout: Duration,
    ) -> Result<AckStatus> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(RelayError::ConnectionClosed),
            Err(_) => {
                self.cancel(ack_id);
                Err(RelayError::AckTimeout { ack_id, timeout })
            }
        }
    }
}
