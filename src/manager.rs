//! The shard map manager: the application's entry point.
//!
//! A manager owns one store service, one cache and one retry policy, all
//! injected at construction. Applications create one manager per GSM and
//! share it; every map and recovery handle it produces clones the same
//! context.

use crate::cache::CacheStore;
use crate::config::ShardMapManagerConfig;
use crate::error::{Error, ErrorCategory, Result, ShardManagementErrorCode};
use crate::key::ShardKeyType;
use crate::operations::{GlobalOperation, OperationContext, RetryPolicy};
use crate::recovery::RecoveryManager;
use crate::shard_map::{ListShardMap, RangeShardMap, ShardMap};
use crate::store::{GlobalOpInput, StoreResultCode, StoreService, StoreShardMap, TransactionScope};
use crate::types::ShardMapKind;
use std::sync::Arc;
use tracing::info;

/// Manages the shard maps of one GSM.
#[derive(Debug, Clone)]
pub struct ShardMapManager {
    ctx: OperationContext,
}

impl ShardMapManager {
    /// Create a manager over the given store with the given
    /// configuration.
    pub fn new(store: Arc<dyn StoreService>, config: ShardMapManagerConfig) -> Self {
        let ctx = OperationContext {
            store,
            cache: Arc::new(CacheStore::new(config.cache_ttl)),
            retry: RetryPolicy::new(config.retry),
        };
        Self { ctx }
    }

    /// Create a manager with default configuration.
    pub fn with_defaults(store: Arc<dyn StoreService>) -> Self {
        Self::new(store, ShardMapManagerConfig::default())
    }

    pub(crate) fn context(&self) -> &OperationContext {
        &self.ctx
    }

    async fn create_shard_map(
        &self,
        name: &str,
        kind: ShardMapKind,
        key_type: ShardKeyType,
    ) -> Result<StoreShardMap> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("shard map name must not be empty".into()));
        }
        let row = StoreShardMap::new(name, kind, key_type);
        let op = GlobalOperation::new(&self.ctx, "CreateShardMap", ErrorCategory::ShardMap);
        op.execute(
            GlobalOpInput::AddShardMap(row.clone()),
            TransactionScope::ReadWrite,
        )
        .await?;
        self.ctx.cache.add_or_update_shard_map(&row);
        info!(shard_map = name, %kind, ?key_type, "shard map created");
        Ok(row)
    }

    /// Create a shard map with range semantics.
    pub async fn create_range_shard_map(
        &self,
        name: &str,
        key_type: ShardKeyType,
    ) -> Result<RangeShardMap> {
        let row = self.create_shard_map(name, ShardMapKind::Range, key_type).await?;
        Ok(RangeShardMap::new(ShardMap::new(self.ctx.clone(), row)))
    }

    /// Create a shard map with list (point) semantics.
    pub async fn create_list_shard_map(
        &self,
        name: &str,
        key_type: ShardKeyType,
    ) -> Result<ListShardMap> {
        let row = self.create_shard_map(name, ShardMapKind::List, key_type).await?;
        Ok(ListShardMap::new(ShardMap::new(self.ctx.clone(), row)))
    }

    async fn lookup_shard_map(&self, name: &str) -> Result<Option<StoreShardMap>> {
        if let Some(row) = self.ctx.cache.lookup_shard_map_by_name(name) {
            return Ok(Some(row));
        }
        let op = GlobalOperation::new(&self.ctx, "GetShardMap", ErrorCategory::ShardMap);
        let results = op
            .execute_raw(
                GlobalOpInput::FindShardMapByName { name: name.into() },
                TransactionScope::ReadOnly,
            )
            .await?;
        if results.is_success() {
            let row = results.shard_maps.into_iter().next();
            if let Some(row) = &row {
                self.ctx.cache.add_or_update_shard_map(row);
            }
            Ok(row)
        } else if results.result == StoreResultCode::ShardMapDoesNotExist {
            Ok(None)
        } else {
            Err(crate::operations::management_error(
                results.result,
                ErrorCategory::ShardMap,
                "GetShardMap",
            ))
        }
    }

    /// The shard map named `name`, if it exists, kind unchecked.
    pub async fn try_get_shard_map(&self, name: &str) -> Result<Option<ShardMap>> {
        Ok(self
            .lookup_shard_map(name)
            .await?
            .map(|row| ShardMap::new(self.ctx.clone(), row)))
    }

    /// The shard map named `name`, or `ShardMapDoesNotExist`.
    pub async fn get_shard_map(&self, name: &str) -> Result<ShardMap> {
        self.try_get_shard_map(name).await?.ok_or_else(|| {
            Error::shard_management(
                ErrorCategory::ShardMap,
                ShardManagementErrorCode::ShardMapDoesNotExist,
                "GetShardMap",
                format!("no shard map named '{name}'"),
            )
        })
    }

    fn check_kind(map: ShardMap, expected: ShardMapKind) -> Result<ShardMap> {
        if map.kind() == expected {
            Ok(map)
        } else {
            Err(Error::InvalidArgument(format!(
                "shard map '{}' is a {} map, not a {} map",
                map.name(),
                map.kind(),
                expected
            )))
        }
    }

    /// The range shard map named `name`.
    pub async fn get_range_shard_map(&self, name: &str) -> Result<RangeShardMap> {
        let map = self.get_shard_map(name).await?;
        Ok(RangeShardMap::new(Self::check_kind(map, ShardMapKind::Range)?))
    }

    /// The list shard map named `name`.
    pub async fn get_list_shard_map(&self, name: &str) -> Result<ListShardMap> {
        let map = self.get_shard_map(name).await?;
        Ok(ListShardMap::new(Self::check_kind(map, ShardMapKind::List)?))
    }

    /// Every shard map, ordered by name.
    pub async fn get_shard_maps(&self) -> Result<Vec<ShardMap>> {
        let op = GlobalOperation::new(&self.ctx, "GetShardMaps", ErrorCategory::ShardMap);
        let results = op
            .execute(GlobalOpInput::GetAllShardMaps, TransactionScope::ReadOnly)
            .await?;
        let mut rows = results.shard_maps;
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows
            .into_iter()
            .map(|row| ShardMap::new(self.ctx.clone(), row))
            .collect())
    }

    /// Delete a shard map. Fails with `ShardMapHasShards` while shards
    /// remain registered.
    pub async fn delete_shard_map(&self, map: &ShardMap) -> Result<()> {
        let op = GlobalOperation::new(&self.ctx, "DeleteShardMap", ErrorCategory::ShardMap);
        op.execute(
            GlobalOpInput::RemoveShardMap { shard_map_id: map.id() },
            TransactionScope::ReadWrite,
        )
        .await?;
        self.ctx.cache.delete_shard_map(map.id());
        info!(shard_map = map.name(), "shard map deleted");
        Ok(())
    }

    /// The recovery manager over the same store, cache and retry policy.
    pub fn recovery_manager(&self) -> RecoveryManager {
        RecoveryManager::new(self.ctx.clone())
    }
}
