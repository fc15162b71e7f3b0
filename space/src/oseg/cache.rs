use std::num::NonZeroUsize;

use lru::LruCache;
use parsec_shared::{ObjectId, SpaceDuration, SpaceInstant};

use crate::oseg::OsegEntry;

struct CachedEntry {
    entry: OsegEntry,
    inserted: SpaceInstant,
}

/// Bounded LRU of directory answers. Staleness is tolerated by the routing
/// layer, but entries are invalidated eagerly on MigrateAck/OsegUpdate and
/// lazily by TTL since the invalidation broadcast is only best-effort.
pub struct OsegCache {
    entries: LruCache<ObjectId, CachedEntry>,
    ttl: SpaceDuration,
}

impl OsegCache {
    pub fn new(capacity: usize, ttl: SpaceDuration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn get(&mut self, object: &ObjectId, now: SpaceInstant) -> Option<OsegEntry> {
        let expired = match self.entries.get(object) {
            Some(cached) => now >= cached.inserted + self.ttl,
            None => return None,
        };
        if expired {
            self.entries.pop(object);
            return None;
        }
        self.entries.get(object).map(|cached| cached.entry)
    }

    /// A possibly-stale read that ignores the TTL, for fallback when the
    /// directory is unreachable.
    pub fn get_stale(&mut self, object: &ObjectId) -> Option<OsegEntry> {
        self.entries.get(object).map(|cached| cached.entry)
    }

    pub fn insert(&mut self, object: ObjectId, entry: OsegEntry, now: SpaceInstant) {
        self.entries.put(
            object,
            CachedEntry {
                entry,
                inserted: now,
            },
        );
    }

    pub fn invalidate(&mut self, object: &ObjectId) {
        self.entries.pop(object);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
