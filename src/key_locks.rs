//! # Per-Key Lock Registry
//!
//! Serializes catalog upserts on the same (source, page, bbox) key while letting
//! different keys proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::errors::PipelineError;

/// Registry of async mutexes keyed by string.
///
/// Entries are created on first request and dropped again once no guard or waiter
/// holds them, so the map stays proportional to the keys in flight.
///
/// Guards are `Send` and may be held across `.await` points.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive access to one key; released on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `key`.
    ///
    /// Returns `CatalogConflict` when another holder keeps the key for longer.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<KeyGuard, PipelineError> {
        let lock = {
            let mut locks = self.locks.lock();
            // Only the map holds these entries, nobody is waiting on them
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let started = Instant::now();
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "Key lock acquired");
                Ok(KeyGuard {
                    key: key.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => Err(PipelineError::CatalogConflict {
                key: key.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
