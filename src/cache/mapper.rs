//! Per-shard-map cache mappers.
//!
//! A list mapper probes by exact point key; a range mapper binary-searches
//! a sorted map of range lows. Both store [`CacheMapping`] snapshots with
//! a growing time-to-live: 5s initially, doubled on each successful
//! re-validation, capped (defaults; see
//! [`CacheTtlConfig`](crate::config::CacheTtlConfig)).

use crate::config::CacheTtlConfig;
use crate::key::ShardKey;
use crate::store::{StoreMapping, StoreShard};
use crate::types::ShardMapKind;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Policy for inserting a mapping into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStorePolicy {
    /// Replace whatever is cached; the entry starts with a fresh initial
    /// TTL.
    OverwriteExisting,
    /// The store re-validated the entry. If the cached entry is the
    /// *same* mapping id, its staleness clock resets and its TTL doubles;
    /// a different id means the cache was stale and is overwritten.
    UpdateTimeToLive,
}

/// A cached mapping snapshot: never authoritative, always reconcilable by
/// re-fetching from the store.
#[derive(Debug, Clone)]
pub struct CacheMapping {
    /// The mapping row as last fetched.
    pub mapping: StoreMapping,
    /// The target shard row as last fetched.
    pub shard: StoreShard,
    created_at: Instant,
    ttl: Duration,
}

impl CacheMapping {
    fn new(mapping: StoreMapping, shard: StoreShard, ttl: Duration) -> Self {
        Self {
            mapping,
            shard,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Whether the staleness window has lapsed. An expired entry is still
    /// returned by lookups; the caller re-validates it against the store.
    pub fn has_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }

    /// Current time-to-live window.
    pub fn time_to_live(&self) -> Duration {
        self.ttl
    }

    fn refresh(&mut self, mapping: StoreMapping, shard: StoreShard, ttl_cfg: &CacheTtlConfig) {
        self.mapping = mapping;
        self.shard = shard;
        self.ttl = ttl_cfg.grow(self.ttl);
        self.created_at = Instant::now();
    }
}

/// Point- or range-keyed mapper for one cached shard map.
///
/// Both variants key the sorted map by the mapping's range low bound;
/// list maps hold unit ranges so an exact probe suffices.
#[derive(Debug)]
pub enum CacheMapper {
    /// Exact point probes.
    List(BTreeMap<ShardKey, CacheMapping>),
    /// Binary-searched range containment.
    Range(BTreeMap<ShardKey, CacheMapping>),
}

impl CacheMapper {
    /// Create an empty mapper of the map's kind.
    pub fn new(kind: ShardMapKind) -> Self {
        match kind {
            ShardMapKind::List => CacheMapper::List(BTreeMap::new()),
            ShardMapKind::Range => CacheMapper::Range(BTreeMap::new()),
        }
    }

    fn entries(&self) -> &BTreeMap<ShardKey, CacheMapping> {
        match self {
            CacheMapper::List(map) | CacheMapper::Range(map) => map,
        }
    }

    fn entries_mut(&mut self) -> &mut BTreeMap<ShardKey, CacheMapping> {
        match self {
            CacheMapper::List(map) | CacheMapper::Range(map) => map,
        }
    }

    /// Number of cached mappings.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the mapper holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Find the cached mapping covering `key`, expired or not.
    pub fn lookup(&self, key: &ShardKey) -> Option<&CacheMapping> {
        match self {
            CacheMapper::List(map) => map.get(key),
            CacheMapper::Range(map) => map
                .range(..=key.clone())
                .next_back()
                .map(|(_, cached)| cached)
                .filter(|cached| cached.mapping.range.contains(key)),
        }
    }

    /// Insert or refresh a mapping snapshot.
    pub fn add_or_update(
        &mut self,
        mapping: StoreMapping,
        shard: StoreShard,
        policy: CacheStorePolicy,
        ttl_cfg: &CacheTtlConfig,
    ) {
        let low = mapping.range.low().clone();

        if policy == CacheStorePolicy::UpdateTimeToLive {
            if let Some(cached) = self.entries_mut().get_mut(&low) {
                if cached.mapping.id == mapping.id {
                    cached.refresh(mapping, shard, ttl_cfg);
                    return;
                }
            }
        }

        // Stale cache entries can be coarser or finer than the new truth
        // (split/merge fragment or coalesce what is cached), so every
        // intersecting entry has to go before the insert.
        self.remove_intersecting(&mapping);
        self.entries_mut()
            .insert(low, CacheMapping::new(mapping, shard, ttl_cfg.initial));
    }

    /// Evict every cached entry whose range intersects the mapping's.
    pub fn remove_intersecting(&mut self, mapping: &StoreMapping) {
        let map = match self {
            CacheMapper::List(map) => {
                map.remove(mapping.range.low());
                return;
            }
            CacheMapper::Range(map) => map,
        };
        let victims: Vec<ShardKey> = map
            .range(..mapping.range.high().clone())
            .filter(|(_, cached)| cached.mapping.range.intersects(&mapping.range))
            .map(|(low, _)| low.clone())
            .collect();
        for low in victims {
            map.remove(&low);
        }
    }
}
