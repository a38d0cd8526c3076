//! Latest-value buffers for data that updates faster than its storage grain.

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Delay from `now` until the next minute boundary.
pub fn until_next_minute(now: DateTime<Utc>) -> Duration {
    Duration::from_secs(60 - u64::from(now.second()))
}

/// Single-slot-per-key buffer: every `put` overwrites, `take` drains.
pub struct LatestValueBuffer<K, V> {
    slots: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> LatestValueBuffer<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    /// Swap the contents out, leaving the buffer empty.
    pub fn take(&self) -> HashMap<K, V> {
        std::mem::take(&mut *self.lock())
    }

    /// Put back values from a failed flush. Keys updated since `take` keep
    /// their newer value.
    pub fn restore(&self, drained: HashMap<K, V>) {
        let mut slots = self.lock();
        for (key, value) in drained {
            slots.entry(key).or_insert(value);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<K: Eq + Hash, V> Default for LatestValueBuffer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
