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

//! Configuration for relay service connections

use crate::random::RandomSource;
use crate::shutdown::GracefulShutdownOptions;
use crate::{RelayError, Result};
use relaymux_protocol::consts::DEFAULT_MAX_FRAME_SIZE;
use std::time::Duration;

/// Reconnect backoff for a container slot whose connection failed.
///
/// The delay before attempt `n` (1-based) is
/// `min(initial_delay * multiplier^(n-1), max_delay)` plus a random jitter of
/// at most `max_jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor between retries
    pub multiplier: f64,
    /// Cap on the exponential part of the delay
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay
    pub max_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before retry `attempt` (1-based)
    pub fn delay(&self, attempt: u32, random: &dyn RandomSource) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let base = if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        };
        base + random.jitter(self.max_jitter)
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the growth factor
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter bound
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }
}

/// Service connection options
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Physical connections per (hub, endpoint) container
    pub connection_count: usize,

    /// Time allowed for the relay to answer the handshake
    pub handshake_timeout: Duration,

    /// Interval between keep-alive pings
    pub keep_alive_interval: Duration,

    /// Silence from the relay after which a connection is considered dead
    pub service_timeout: Duration,

    /// Time allowed for one client connection to finish closing
    pub close_timeout: Duration,

    /// Time allowed for a migrated connection's stray handshake response
    pub migration_handshake_timeout: Duration,

    /// Capacity of each client connection's application pipes
    pub application_buffer: usize,

    /// Largest frame accepted or produced by the protocol
    pub max_frame_size: usize,

    /// Retry policy for failed connections
    pub reconnect: ReconnectPolicy,

    /// Graceful shutdown behavior
    pub graceful_shutdown: GracefulShutdownOptions,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            connection_count: 5,
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(5),
            service_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            migration_handshake_timeout: Duration::from_secs(5),
            application_buffer: 128,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reconnect: ReconnectPolicy::default(),
            graceful_shutdown: GracefulShutdownOptions::default(),
        }
    }
}

impl ServiceOptions {
    /// Create options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connections per container
    pub fn with_connection_count(mut self, count: usize) -> Self {
        self.connection_count = count;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the keep-alive interval
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the service liveness timeout
    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    /// Set the per-client close timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the migration handshake timeout
    pub fn with_migration_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.migration_handshake_timeout = timeout;
        self
    }

    /// Set the application pipe capacity
    pub fn with_application_buffer(mut self, capacity: usize) -> Self {
        self.application_buffer = capacity;
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the graceful shutdown options
    pub fn with_graceful_shutdown(mut self, options: GracefulShutdownOptions) -> Self {
        self.graceful_shutdown = options;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(RelayError::InvalidConfiguration(message.to_string()));

        if self.connection_count == 0 {
            return invalid("connection_count must be greater than 0");
        }
        if self.handshake_timeout.is_zero() {
            return invalid("handshake_timeout must be greater than 0");
        }
        if self.keep_alive_interval.is_zero() {
            return invalid("keep_alive_interval must be greater than 0");
        }
        if self.service_timeout <= self.keep_alive_interval {
            return invalid("service_timeout must be greater than keep_alive_interval");
        }
        if self.close_timeout.is_zero() {
            return invalid("close_timeout must be greater than 0");
        }
        if self.application_buffer == 0 {
            return invalid("application_buffer must be greater than 0");
        }
        if self.max_frame_size < 64 {
            return invalid("max_frame_size must be at least 64 bytes");
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return invalid("reconnect multiplier must be at least 1.0");
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return invalid("reconnect max_delay must not be below initial_delay");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn test_default_options() {
        let options = ServiceOptions::default();
        assert_eq!(options.connection_count, 5);
        assert_eq!(options.handshake_timeout, Duration::from_secs(15));
        assert_eq!(options.close_timeout, Duration::from_secs(5));
        assert_eq!(options.application_buffer, 128);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let options = ServiceOptions::new()
            .with_connection_count(2)
            .with_keep_alive_interval(Duration::from_millis(100))
            .with_service_timeout(Duration::from_secs(1));

        assert_eq!(options.connection_count, 2);
        assert_eq!(options.keep_alive_interval, Duration::from_millis(100));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut options = ServiceOptions::default();
        options.connection_count = 0;
        assert!(matches!(
            options.validate(),
            Err(RelayError::InvalidConfiguration(_))
        ));

        let options = ServiceOptions::default().with_service_timeout(Duration::from_secs(5));
        assert!(options.validate().is_err());

        let options = ServiceOptions::default()
            .with_reconnect(ReconnectPolicy::default().with_multiplier(0.5));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_reconnect_delay_growth_and_cap() {
        let random = SeededRandom::new(3);
        let policy = ReconnectPolicy::default().with_max_jitter(Duration::ZERO);

        assert_eq!(policy.delay(1, &random), Duration::from_secs(1));
        assert_eq!(policy.delay(2, &random), Duration::from_secs(2));
        assert_eq!(policy.delay(4, &random), Duration::from_secs(8));
        assert_eq!(policy.delay(10, &random), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX, &random), Duration::from_secs(60));
    }

    #[test]
    fn test_reconnect_delay_jitter() {
        let random = SeededRandom::new(3);
        let policy = ReconnectPolicy::default().with_max_jitter(Duration::from_millis(500));
        for attempt in 1..5 {
            let delay = policy.delay(attempt, &random);
            let base = policy
                .clone()
                .with_max_jitter(Duration::ZERO)
                .delay(attempt, &random);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(500));
        }
    }
}
