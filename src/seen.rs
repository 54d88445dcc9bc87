//! Time-bounded memory of recently seen message identifiers.
//!
//! Duplicate suppression for the gossip flood: a message id stays known for
//! [`MEMORY_DURATION`] after first sight, long enough for every copy still
//! circulating under the hop limit to come home and be dropped.
//!
//! SECURITY: The map is additionally capped by an LRU bound so a flood of
//! unique ids cannot grow it without limit between sweeps.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

/// How long a message id is remembered.
pub const MEMORY_DURATION: Duration = Duration::from_secs(60);

/// Hard cap on tracked ids, independent of the time bound.
const MAX_SEEN_ENTRIES: usize = 65_536;

pub struct SeenMemory {
    entries: LruCache<String, Instant>,
}

impl SeenMemory {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_SEEN_ENTRIES).expect("cap is non-zero");
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// Record `id` as seen now.
    pub fn add(&mut self, id: &str) {
        self.entries.put(id.to_string(), Instant::now());
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    /// Evict every entry older than [`MEMORY_DURATION`].
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, inserted)| now.duration_since(**inserted) > MEMORY_DURATION)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.entries.pop(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn add_at(&mut self, id: &str, at: Instant) {
        self.entries.put(id.to_string(), at);
    }
}

impl Default for SeenMemory {
    fn default() -> Self {
        Self::new()
    }
}
