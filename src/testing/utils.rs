//! Shared fixtures for the integration tests.

use crate::config::{CacheTtlConfig, RetryConfig, ShardMapManagerConfig};
use crate::key::ShardKeyType;
use crate::manager::ShardMapManager;
use crate::shard_map::{RangeShardMap, Shard};
use crate::store::StoreService;
use crate::types::ShardLocation;
use std::sync::Arc;
use std::time::Duration;

/// Install a test subscriber once; later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A manager with fast retries and default cache TTLs.
pub(crate) fn manager_over(store: Arc<dyn StoreService>) -> ShardMapManager {
    ShardMapManager::new(
        store,
        ShardMapManagerConfig::new().with_retry(RetryConfig::fast()),
    )
}

/// A manager whose cache entries expire immediately, forcing every
/// lookup to re-validate against the store.
pub(crate) fn manager_without_cache_reuse(store: Arc<dyn StoreService>) -> ShardMapManager {
    ShardMapManager::new(
        store,
        ShardMapManagerConfig::new()
            .with_retry(RetryConfig::fast())
            .with_cache_ttl(CacheTtlConfig::new(Duration::ZERO, Duration::ZERO)),
    )
}

/// Shorthand for a location on a local test server.
pub(crate) fn loc(name: &str) -> ShardLocation {
    ShardLocation::new("test-server", name)
}

/// A range map over `Int32` with one shard per database name.
pub(crate) async fn range_map_with_shards(
    manager: &ShardMapManager,
    name: &str,
    databases: &[&str],
) -> (RangeShardMap, Vec<Shard>) {
    let map = manager
        .create_range_shard_map(name, ShardKeyType::Int32)
        .await
        .unwrap();
    let mut shards = Vec::with_capacity(databases.len());
    for db in databases {
        shards.push(map.shard_map().create_shard(loc(db)).await.unwrap());
    }
    (map, shards)
}
