//! Client-side read-through cache for shard maps and mappings.
//!
//! Two-level structure under two-level locking: a root directory
//! (shard-map name/id lookup) guarded by one reader/writer lock, and one
//! mapper per cached shard map guarded by its own lock, so lookups on
//! different maps never contend and readers never block each other.
//!
//! The cache is not authoritative. The operation framework evicts
//! affected entries before any commit attempt and refreshes them only
//! after a confirmed commit; entries age out through the growing TTL and
//! get re-validated from the store.

pub mod mapper;

pub use mapper::{CacheMapper, CacheMapping, CacheStorePolicy};

use crate::config::CacheTtlConfig;
use crate::key::ShardKey;
use crate::store::{StoreMapping, StoreShard, StoreShardMap};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Directory {
    by_name: HashMap<String, Uuid>,
    by_id: HashMap<Uuid, Arc<CachedShardMap>>,
}

/// One cached shard map: its metadata row plus its mapper, under the
/// mapper's own lock.
#[derive(Debug)]
pub struct CachedShardMap {
    shard_map: StoreShardMap,
    mapper: RwLock<CacheMapper>,
}

impl CachedShardMap {
    fn new(shard_map: StoreShardMap) -> Self {
        let mapper = RwLock::new(CacheMapper::new(shard_map.kind));
        Self { shard_map, mapper }
    }

    /// The cached shard map row.
    pub fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }
}

/// Root cache store: directory of cached shard maps.
#[derive(Debug)]
pub struct CacheStore {
    ttl: CacheTtlConfig,
    directory: RwLock<Directory>,
}

impl CacheStore {
    /// Create an empty cache with the given TTL parameters.
    pub fn new(ttl: CacheTtlConfig) -> Self {
        Self {
            ttl,
            directory: RwLock::new(Directory::default()),
        }
    }

    /// Cache or refresh a shard map row. An entry already cached under
    /// the same id keeps its cached mappings; a name that re-points to a
    /// new id evicts the stale entry.
    pub fn add_or_update_shard_map(&self, shard_map: &StoreShardMap) {
        let mut dir = self.directory.write();
        if let Some(stale) = dir.by_name.insert(shard_map.name.clone(), shard_map.id) {
            if stale != shard_map.id {
                dir.by_id.remove(&stale);
            }
        }
        dir.by_id
            .entry(shard_map.id)
            .or_insert_with(|| Arc::new(CachedShardMap::new(shard_map.clone())));
    }

    /// Evict a shard map and every mapping cached under it.
    pub fn delete_shard_map(&self, shard_map_id: Uuid) {
        let mut dir = self.directory.write();
        if let Some(cached) = dir.by_id.remove(&shard_map_id) {
            dir.by_name.remove(&cached.shard_map.name);
        }
    }

    /// Cached shard map row by name.
    pub fn lookup_shard_map_by_name(&self, name: &str) -> Option<StoreShardMap> {
        let dir = self.directory.read();
        let id = dir.by_name.get(name)?;
        dir.by_id.get(id).map(|c| c.shard_map.clone())
    }

    fn cached_map(&self, shard_map_id: Uuid) -> Option<Arc<CachedShardMap>> {
        self.directory.read().by_id.get(&shard_map_id).cloned()
    }

    /// Cache or refresh a mapping snapshot under its shard map. A no-op
    /// when the shard map itself is not cached.
    pub fn add_or_update_mapping(
        &self,
        mapping: &StoreMapping,
        shard: &StoreShard,
        policy: CacheStorePolicy,
    ) {
        if let Some(cached) = self.cached_map(mapping.shard_map_id) {
            trace!(mapping_id = %mapping.id, ?policy, "cache mapping");
            cached
                .mapper
                .write()
                .add_or_update(mapping.clone(), shard.clone(), policy, &self.ttl);
        }
    }

    /// Evict the mapping and every cached range intersecting it.
    pub fn delete_mapping(&self, mapping: &StoreMapping) {
        if let Some(cached) = self.cached_map(mapping.shard_map_id) {
            trace!(mapping_id = %mapping.id, "evict mapping");
            cached.mapper.write().remove_intersecting(mapping);
        }
    }

    /// Cached mapping covering `key`, expired entries included; the
    /// caller decides whether to re-validate.
    pub fn lookup_mapping_by_key(&self, shard_map_id: Uuid, key: &ShardKey) -> Option<CacheMapping> {
        let cached = self.cached_map(shard_map_id)?;
        let mapper = cached.mapper.read();
        mapper.lookup(key).cloned()
    }
}
