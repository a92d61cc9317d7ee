use crate::prelude::*;
use crate::inverter::packet::DeviceFunction;

use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Shape of a read request, independent of which client asked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CacheKey {
    pub function: u8,
    pub start_register: u16,
    pub register_count: u16,
}

impl CacheKey {
    pub fn new(function: DeviceFunction, start_register: u16, register_count: u16) -> Self {
        Self {
            function: function.into(),
            start_register,
            register_count,
        }
    }

    fn end_register(&self) -> u32 {
        self.start_register as u32 + self.register_count as u32
    }

    /// True when `[start, start + count)` shares a register with this key.
    pub fn overlaps(&self, start: u16, count: u16) -> bool {
        let end = start as u32 + count as u32;
        (self.start_register as u32) < end && (start as u32) < self.end_register()
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// The complete client response, ready to send.
    pub response: Bytes,
    pub created: Instant,
    pub last_access: Instant,
    pub hit_count: u32,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

// {{{ FallbackCache
/// Last-known-good read responses, served only when a live exchange fails.
#[derive(Debug)]
pub struct FallbackCache {
    capacity: usize,
    ttl: Duration,
    entries: BTreeMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    invalidations: u64,
    evictions: u64,
}

impl FallbackCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: BTreeMap::new(),
            hits: 0,
            misses: 0,
            invalidations: 0,
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.created) > self.ttl
    }

    /// Stores `response` under `key`, replacing any previous entry for it.
    ///
    /// Expired entries go first; if the cache is still full the entry with
    /// the oldest creation time is evicted.
    pub fn insert(&mut self, key: CacheKey, response: Bytes) {
        let now = Instant::now();

        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.created) <= ttl);
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!("cache: purged {} expired entries", purged);
            self.invalidations += purged as u64;
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .values()
                .min_by_key(|e| e.created)
                .map(|e| e.key);
            if let Some(oldest) = oldest {
                debug!("cache: evicting {:?}", oldest);
                self.entries.remove(&oldest);
                self.evictions += 1;
            }
        }

        trace!("cache: storing {:?} ({} bytes)", key, response.len());
        self.entries.insert(
            key,
            CacheEntry {
                key,
                response,
                created: now,
                last_access: now,
                hit_count: 0,
            },
        );
    }

    /// Returns the cached response for `key` if present and fresh.
    pub fn lookup(&mut self, key: &CacheKey) -> Option<Bytes> {
        let now = Instant::now();

        let stale = match self.entries.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => self.expired(entry, now),
        };

        if stale {
            debug!("cache: {:?} expired", key);
            self.entries.remove(key);
            self.invalidations += 1;
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.entries.get_mut(key).map(|entry| {
            entry.last_access = now;
            entry.hit_count += 1;
            entry.response.clone()
        })
    }

    /// Drops every entry covering a register in `[start, start + count)`.
    /// Only holding registers can change through a write.
    pub fn invalidate_range(&mut self, start: u16, count: u16) -> usize {
        let hold: u8 = DeviceFunction::ReadHold.into();
        let before = self.entries.len();
        self.entries
            .retain(|k, _| !(k.function == hold && k.overlaps(start, count)));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("cache: write to {}+{} invalidated {} entries", start, count, removed);
            self.invalidations += removed as u64;
        }
        removed
    }

    pub fn clear(&mut self) {
        let n = self.entries.len();
        self.entries.clear();
        self.invalidations += n as u64;
        info!("cache cleared ({} entries)", n);
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            invalidations: self.invalidations,
            evictions: self.evictions,
        }
    }
}
// }}}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap() {
        let key = CacheKey::new(DeviceFunction::ReadHold, 10, 5);
        assert!(key.overlaps(14, 1));
        assert!(key.overlaps(0, 11));
        assert!(!key.overlaps(15, 3));
        assert!(!key.overlaps(0, 10));
    }
}
