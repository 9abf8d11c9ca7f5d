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

//! Injectable randomness for slot selection, identifiers and backoff jitter

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Source of randomness used by containers and connections.
///
/// Production code uses [`ThreadRandom`]; tests inject [`SeededRandom`] to make
/// slot selection and retry timing reproducible.
pub trait RandomSource: Send + Sync + 'static {
    /// A uniformly distributed index in `0..bound`. `bound` is never zero.
    fn index(&self, bound: usize) -> usize;

    /// A random (version 4) UUID
    fn uuid(&self) -> Uuid;

    /// A uniformly distributed duration in `0..=max`
    fn jitter(&self, max: Duration) -> Duration;
}

/// Randomness backed by the thread-local generator
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn index(&self, bound: usize) -> usize {
        rand::rng().random_range(0..bound.max(1))
    }

    fn uuid(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn jitter(&self, max: Duration) -> Duration {
        jitter_with(&mut rand::rng(), max)
    }
}

/// Deterministic randomness from a fixed seed
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Create a generator from a seed
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

impl RandomSource for SeededRandom {
    fn index(&self, bound: usize) -> usize {
        self.with_rng(|rng| rng.random_range(0..bound.max(1)))
    }

    fn uuid(&self) -> Uuid {
        let bytes: [u8; 16] = self.with_rng(|rng| rng.random());
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    fn jitter(&self, max: Duration) -> Duration {
        self.with_rng(|rng| jitter_with(rng, max))
    }
}

fn jitter_with<R: Rng + ?Sized>(rng: &mut R, max: Duration) -> Duration {
    let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..=max_millis))
}
