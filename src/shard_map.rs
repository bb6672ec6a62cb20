//! Public shard-map surface: shards, mappings, and the list/range map
//! façades through which applications manage and route.
//!
//! Every mutating call builds a [`StoreLogEntry`] and hands it to the
//! operation driver; every key lookup goes through the cache first and
//! falls back to the GSM, re-validating expired entries in place.

use crate::cache::CacheStorePolicy;
use crate::error::{Error, ErrorCategory, Result, ShardManagementErrorCode};
use crate::key::{ShardKey, ShardKeyType, ShardRange};
use crate::operations::{GlobalOperation, OperationContext, StoreOperation};
use crate::store::{
    GlobalOpInput, LockOpKind, StoreLogEntry, StoreMapping, StoreOperationCode,
    StoreOperationState, StoreShard, StoreShardMap, TransactionScope,
};
use crate::types::{LockOwnerId, MappingStatus, ShardLocation, ShardMapKind, ShardStatus};
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// Shards and mappings
// ============================================================================

/// A registered shard: one physical data source within a shard map.
///
/// Carries the version snapshot mutating operations CAS against; hold a
/// fresh instance when mutating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub(crate) store: StoreShard,
}

impl Shard {
    pub(crate) fn new(store: StoreShard) -> Self {
        Self { store }
    }

    /// Stable identifier.
    pub fn id(&self) -> Uuid {
        self.store.id
    }

    /// Physical endpoint.
    pub fn location(&self) -> &ShardLocation {
        &self.store.location
    }

    /// Availability status.
    pub fn status(&self) -> ShardStatus {
        self.store.status
    }
}

/// A key-range-to-shard assignment, joined with its target shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub(crate) store: StoreMapping,
    pub(crate) shard: Shard,
}

impl Mapping {
    pub(crate) fn new(store: StoreMapping, shard: StoreShard) -> Self {
        Self {
            store,
            shard: Shard::new(shard),
        }
    }

    /// Stable identifier. Split, merge, move and update all retire this
    /// id and mint new ones.
    pub fn id(&self) -> Uuid {
        self.store.id
    }

    /// Covered key range. Point mappings cover a unit range.
    pub fn range(&self) -> &ShardRange {
        &self.store.range
    }

    /// Availability status.
    pub fn status(&self) -> MappingStatus {
        self.store.status
    }

    /// The shard this mapping routes to.
    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    /// Whether an advisory lock is held on the mapping.
    pub fn is_locked(&self) -> bool {
        !self.store.lock_owner_id.is_nil()
    }

    /// Current lock owner, nil when unlocked.
    pub fn lock_owner_id(&self) -> LockOwnerId {
        self.store.lock_owner_id
    }
}

/// Requested changes for [`ShardMap::update_mapping`]: flip the status,
/// move to another shard, or both. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct MappingUpdate {
    status: Option<MappingStatus>,
    shard: Option<Shard>,
}

impl MappingUpdate {
    /// An empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the new status.
    pub fn with_status(mut self, status: MappingStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Move the mapping to another shard. The mapping must be offline.
    pub fn with_shard(mut self, shard: Shard) -> Self {
        self.shard = Some(shard);
        self
    }
}

// ============================================================================
// Shared map core
// ============================================================================

/// Common core behind [`RangeShardMap`] and [`ListShardMap`]: shard
/// lifecycle plus the mapping machinery both kinds share.
#[derive(Debug, Clone)]
pub struct ShardMap {
    ctx: OperationContext,
    store: StoreShardMap,
}

impl ShardMap {
    pub(crate) fn new(ctx: OperationContext, store: StoreShardMap) -> Self {
        Self { ctx, store }
    }

    /// Stable identifier.
    pub fn id(&self) -> Uuid {
        self.store.id
    }

    /// Unique name.
    pub fn name(&self) -> &str {
        &self.store.name
    }

    /// List or range semantics.
    pub fn kind(&self) -> ShardMapKind {
        self.store.kind
    }

    /// Key type shared by every mapping.
    pub fn key_type(&self) -> ShardKeyType {
        self.store.key_type
    }

    fn entry_template(&self, code: StoreOperationCode, source: ShardLocation) -> StoreLogEntry {
        StoreLogEntry {
            id: Uuid::nil(),
            code,
            state: StoreOperationState::GlobalBegin,
            shard_map: self.store.clone(),
            source,
            target: None,
            shards_involved: vec![],
            shards_added: vec![],
            shards_removed: vec![],
            mappings_added: vec![],
            mappings_removed: vec![],
            lock_claims: vec![],
        }
    }

    fn check_key_type(&self, key_type: ShardKeyType) -> Result<()> {
        if key_type == self.store.key_type {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "key type {key_type:?} does not match shard map '{}' ({:?})",
                self.store.name, self.store.key_type
            )))
        }
    }

    // ------------------------------------------------------------------
    // Shard lifecycle
    // ------------------------------------------------------------------

    /// Register a shard and mirror the map's metadata to its LSM.
    pub async fn create_shard(&self, location: ShardLocation) -> Result<Shard> {
        let shard = StoreShard::new(self.store.id, location.clone());
        let mut entry = self.entry_template(StoreOperationCode::AddShard, location);
        entry.shards_added = vec![shard.clone()];

        StoreOperation::new(self.ctx.clone(), "CreateShard", ErrorCategory::Shard, entry)
            .execute()
            .await?;
        debug!(shard_map = %self.store.name, shard = %shard.location, "shard created");
        Ok(Shard::new(shard))
    }

    /// Remove a shard. Fails with `ShardHasMappings` while mappings still
    /// target it, and with `ShardVersionMismatch` if the caller's shard
    /// snapshot is stale.
    pub async fn delete_shard(&self, shard: &Shard) -> Result<()> {
        let mut entry =
            self.entry_template(StoreOperationCode::RemoveShard, shard.store.location.clone());
        entry.shards_involved = vec![shard.store.clone()];
        entry.shards_removed = vec![shard.store.clone()];

        StoreOperation::new(self.ctx.clone(), "DeleteShard", ErrorCategory::Shard, entry)
            .execute()
            .await?;
        debug!(shard_map = %self.store.name, shard = %shard.store.location, "shard deleted");
        Ok(())
    }

    /// Replace a shard's status.
    pub async fn update_shard(&self, shard: &Shard, status: ShardStatus) -> Result<Shard> {
        let mut updated = shard.store.clone();
        updated.status = status;
        updated.version = Uuid::new_v4();

        let mut entry =
            self.entry_template(StoreOperationCode::UpdateShard, shard.store.location.clone());
        entry.shards_involved = vec![shard.store.clone()];
        entry.shards_removed = vec![shard.store.clone()];
        entry.shards_added = vec![updated.clone()];

        let results =
            StoreOperation::new(self.ctx.clone(), "UpdateShard", ErrorCategory::Shard, entry)
                .execute()
                .await?;
        let current = results
            .shards
            .into_iter()
            .find(|s| s.id == shard.store.id)
            .unwrap_or(updated);
        Ok(Shard::new(current))
    }

    /// The shard at `location`, or `ShardDoesNotExist`.
    pub async fn get_shard(&self, location: &ShardLocation) -> Result<Shard> {
        self.try_get_shard(location).await?.ok_or_else(|| {
            Error::shard_management(
                ErrorCategory::Shard,
                ShardManagementErrorCode::ShardDoesNotExist,
                "GetShard",
                format!("no shard at {location} in shard map '{}'", self.store.name),
            )
        })
    }

    /// The shard at `location`, if registered.
    pub async fn try_get_shard(&self, location: &ShardLocation) -> Result<Option<Shard>> {
        let op = GlobalOperation::new(&self.ctx, "GetShard", ErrorCategory::Shard);
        let results = op
            .execute_raw(
                GlobalOpInput::FindShardByLocation {
                    shard_map_id: self.store.id,
                    location: location.clone(),
                },
                TransactionScope::ReadOnly,
            )
            .await?;
        if results.is_success() {
            Ok(results.shards.into_iter().next().map(Shard::new))
        } else if results.result == crate::store::StoreResultCode::ShardDoesNotExist {
            Ok(None)
        } else {
            Err(crate::operations::management_error(
                results.result,
                ErrorCategory::Shard,
                "GetShard",
            ))
        }
    }

    /// Every registered shard.
    pub async fn get_shards(&self) -> Result<Vec<Shard>> {
        let op = GlobalOperation::new(&self.ctx, "GetShards", ErrorCategory::Shard);
        let results = op
            .execute(
                GlobalOpInput::GetAllShards {
                    shard_map_id: self.store.id,
                },
                TransactionScope::ReadOnly,
            )
            .await?;
        let mut shards: Vec<Shard> = results.shards.into_iter().map(Shard::new).collect();
        shards.sort_by(|a, b| a.store.location.to_string().cmp(&b.store.location.to_string()));
        Ok(shards)
    }

    // ------------------------------------------------------------------
    // Mapping machinery (shared by list and range façades)
    // ------------------------------------------------------------------

    /// Post-begin shard row for `shard_id`, falling back to the caller's
    /// snapshot. Begin bumps shard versions, so the returned mapping must
    /// carry the bumped row for follow-up operations to CAS cleanly.
    fn fresh_shard(results: &crate::store::StoreResults, fallback: &StoreShard) -> StoreShard {
        results
            .shards
            .iter()
            .find(|s| s.id == fallback.id)
            .cloned()
            .unwrap_or_else(|| fallback.clone())
    }

    pub(crate) async fn add_mapping(&self, range: ShardRange, shard: &Shard) -> Result<Mapping> {
        self.check_key_type(range.key_type())?;
        let mapping = StoreMapping::new(self.store.id, range, shard.store.id);

        let mut entry =
            self.entry_template(StoreOperationCode::AddMapping, shard.store.location.clone());
        entry.shards_involved = vec![shard.store.clone()];
        entry.mappings_added = vec![mapping.clone()];

        let results =
            StoreOperation::new(self.ctx.clone(), "AddMapping", ErrorCategory::Mapping, entry)
                .execute()
                .await?;
        let fresh = Self::fresh_shard(&results, &shard.store);
        Ok(Mapping::new(mapping, fresh))
    }

    pub(crate) async fn remove_mapping(
        &self,
        mapping: &Mapping,
        lock_token: Option<LockOwnerId>,
    ) -> Result<()> {
        let mut entry = self.entry_template(
            StoreOperationCode::RemoveMapping,
            mapping.shard.store.location.clone(),
        );
        entry.shards_involved = vec![mapping.shard.store.clone()];
        entry.mappings_removed = vec![mapping.store.clone()];
        if let Some(token) = lock_token {
            entry.lock_claims = vec![(mapping.store.id, token)];
        }

        StoreOperation::new(self.ctx.clone(), "RemoveMapping", ErrorCategory::Mapping, entry)
            .execute()
            .await?;
        Ok(())
    }

    pub(crate) async fn update_mapping(
        &self,
        mapping: &Mapping,
        update: MappingUpdate,
        lock_token: Option<LockOwnerId>,
    ) -> Result<Mapping> {
        let target_shard = update.shard.unwrap_or_else(|| mapping.shard.clone());
        let moving = target_shard.store.id != mapping.shard.store.id;

        let mut replacement = mapping.store.clone();
        replacement.id = Uuid::new_v4();
        replacement.shard_id = target_shard.store.id;
        if let Some(status) = update.status {
            replacement.status = status;
        }

        let (code, name) = if moving {
            (StoreOperationCode::MoveMapping, "MoveMapping")
        } else {
            (StoreOperationCode::UpdateMapping, "UpdateMapping")
        };
        let mut entry = self.entry_template(code, mapping.shard.store.location.clone());
        entry.shards_involved = vec![mapping.shard.store.clone()];
        if moving {
            entry.target = Some(target_shard.store.location.clone());
            entry.shards_involved.push(target_shard.store.clone());
        }
        entry.mappings_removed = vec![mapping.store.clone()];
        entry.mappings_added = vec![replacement.clone()];
        if let Some(token) = lock_token {
            entry.lock_claims = vec![(mapping.store.id, token)];
        }

        let results = StoreOperation::new(self.ctx.clone(), name, ErrorCategory::Mapping, entry)
            .execute()
            .await?;
        let fresh = Self::fresh_shard(&results, &target_shard.store);
        Ok(Mapping::new(replacement, fresh))
    }

    pub(crate) async fn lookup_mapping(&self, key: &ShardKey, for_routing: bool) -> Result<Mapping> {
        self.check_key_type(key.key_type())?;
        let operation = if for_routing { "RouteForKey" } else { "GetMappingForKey" };

        if let Some(cached) = self.ctx.cache.lookup_mapping_by_key(self.store.id, key) {
            if !cached.has_expired() {
                return self.routing_check(
                    Mapping::new(cached.mapping, cached.shard),
                    for_routing,
                    operation,
                );
            }
        }

        let op = GlobalOperation::new(&self.ctx, "FindMappingByKey", ErrorCategory::Mapping);
        let results = op
            .execute_raw(
                GlobalOpInput::FindMappingByKey {
                    shard_map_id: self.store.id,
                    key: key.clone(),
                },
                TransactionScope::ReadOnly,
            )
            .await?;
        if !results.is_success() {
            return Err(crate::operations::management_error(
                results.result,
                ErrorCategory::Mapping,
                operation,
            ));
        }
        let mapping = results
            .mappings
            .into_iter()
            .next()
            .zip(results.shards.into_iter().next())
            .map(|(m, s)| Mapping::new(m, s))
            .ok_or_else(|| Error::Internal("mapping lookup returned no rows".into()))?;

        self.ctx.cache.add_or_update_mapping(
            &mapping.store,
            &mapping.shard.store,
            CacheStorePolicy::UpdateTimeToLive,
        );
        self.routing_check(mapping, for_routing, operation)
    }

    fn routing_check(&self, mapping: Mapping, for_routing: bool, operation: &str) -> Result<Mapping> {
        if for_routing && mapping.store.status == MappingStatus::Offline {
            return Err(Error::shard_management(
                ErrorCategory::Mapping,
                ShardManagementErrorCode::MappingIsOffline,
                operation,
                format!("mapping {} covering the key is offline", mapping.store.id),
            ));
        }
        Ok(mapping)
    }

    pub(crate) async fn try_lookup_mapping(&self, key: &ShardKey) -> Result<Option<Mapping>> {
        match self.lookup_mapping(key, false).await {
            Ok(mapping) => Ok(Some(mapping)),
            Err(err)
                if err.management_code()
                    == Some(ShardManagementErrorCode::MappingNotFoundForKey) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn list_mappings(
        &self,
        range: Option<ShardRange>,
        shard: Option<&Shard>,
    ) -> Result<Vec<Mapping>> {
        if let Some(range) = &range {
            self.check_key_type(range.key_type())?;
        }
        let op = GlobalOperation::new(&self.ctx, "GetMappings", ErrorCategory::Mapping);
        let results = op
            .execute(
                GlobalOpInput::GetAllMappings {
                    shard_map_id: self.store.id,
                    shard_id: shard.map(|s| s.store.id),
                    range,
                },
                TransactionScope::ReadOnly,
            )
            .await?;
        let shards = results.shards;
        results
            .mappings
            .into_iter()
            .map(|m| {
                shards
                    .iter()
                    .find(|s| s.id == m.shard_id)
                    .cloned()
                    .map(|s| Mapping::new(m, s))
                    .ok_or_else(|| Error::Internal("mapping without shard row".into()))
            })
            .collect()
    }

    pub(crate) async fn fetch_mapping(&self, mapping_id: Uuid, operation: &'static str) -> Result<Mapping> {
        let op = GlobalOperation::new(&self.ctx, operation, ErrorCategory::Mapping);
        let results = op
            .execute(
                GlobalOpInput::FindMappingById {
                    shard_map_id: self.store.id,
                    mapping_id,
                },
                TransactionScope::ReadOnly,
            )
            .await?;
        results
            .mappings
            .into_iter()
            .next()
            .zip(results.shards.into_iter().next())
            .map(|(m, s)| Mapping::new(m, s))
            .ok_or_else(|| Error::Internal("mapping fetch returned no rows".into()))
    }

    // ------------------------------------------------------------------
    // Advisory locks
    // ------------------------------------------------------------------

    pub(crate) async fn lock_op(
        &self,
        mapping: Option<&Mapping>,
        lock_owner_id: LockOwnerId,
        op: LockOpKind,
        operation: &'static str,
    ) -> Result<()> {
        if lock_owner_id.is_nil() {
            return Err(Error::InvalidArgument(
                "lock owner id must not be the nil uuid".into(),
            ));
        }
        let global = GlobalOperation::new(&self.ctx, operation, ErrorCategory::Mapping);
        let results = global
            .execute(
                GlobalOpInput::LockOrUnlockMappings {
                    shard_map_id: self.store.id,
                    mapping_id: mapping.map(|m| m.store.id),
                    lock_owner_id,
                    op,
                },
                TransactionScope::ReadWrite,
            )
            .await?;
        // Lock state lives on the mapping rows: anything the CAS touched
        // must be re-fetched on next lookup.
        for touched in &results.mappings {
            self.ctx.cache.delete_mapping(touched);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Split / merge (range maps; list maps never call these)
    // ------------------------------------------------------------------

    pub(crate) async fn split(
        &self,
        mapping: &Mapping,
        split_point: ShardKey,
        lock_token: Option<LockOwnerId>,
    ) -> Result<(Mapping, Mapping)> {
        self.check_key_type(split_point.key_type())?;
        let range = &mapping.store.range;
        if !range.contains(&split_point) || &split_point == range.low() {
            return Err(Error::InvalidArgument(format!(
                "split point {split_point} is not strictly inside {range}"
            )));
        }

        let token = lock_token.unwrap_or_else(LockOwnerId::nil);
        let make_child = |low: ShardKey, high: ShardKey| -> Result<StoreMapping> {
            let mut child = StoreMapping::new(
                self.store.id,
                ShardRange::new(low, high)?,
                mapping.store.shard_id,
            );
            child.status = mapping.store.status;
            child.lock_owner_id = token;
            Ok(child)
        };
        let left = make_child(range.low().clone(), split_point.clone())?;
        let right = make_child(split_point, range.high().clone())?;

        let mut entry = self.entry_template(
            StoreOperationCode::SplitMapping,
            mapping.shard.store.location.clone(),
        );
        entry.shards_involved = vec![mapping.shard.store.clone()];
        entry.mappings_removed = vec![mapping.store.clone()];
        entry.mappings_added = vec![left.clone(), right.clone()];
        if let Some(token) = lock_token {
            entry.lock_claims = vec![(mapping.store.id, token)];
        }

        let results =
            StoreOperation::new(self.ctx.clone(), "SplitMapping", ErrorCategory::Mapping, entry)
                .execute()
                .await?;
        let fresh = Self::fresh_shard(&results, &mapping.shard.store);
        Ok((Mapping::new(left, fresh.clone()), Mapping::new(right, fresh)))
    }

    pub(crate) async fn merge(
        &self,
        left: &Mapping,
        right: &Mapping,
        left_token: Option<LockOwnerId>,
        right_token: Option<LockOwnerId>,
    ) -> Result<Mapping> {
        if left.store.shard_id != right.store.shard_id {
            return Err(Error::InvalidArgument(
                "mappings to merge must live on the same shard".into(),
            ));
        }
        if !left.store.range.is_adjacent_to(&right.store.range) {
            return Err(Error::InvalidArgument(format!(
                "mappings {} and {} are not adjacent",
                left.store.range, right.store.range
            )));
        }

        // The merged row keeps the left side's lock owner.
        let mut merged = StoreMapping::new(
            self.store.id,
            ShardRange::new(
                left.store.range.low().clone(),
                right.store.range.high().clone(),
            )?,
            left.store.shard_id,
        );
        merged.status = left.store.status;
        merged.lock_owner_id = left.store.lock_owner_id;

        let mut entry = self.entry_template(
            StoreOperationCode::MergeMappings,
            left.shard.store.location.clone(),
        );
        entry.shards_involved = vec![left.shard.store.clone()];
        entry.mappings_removed = vec![left.store.clone(), right.store.clone()];
        entry.mappings_added = vec![merged.clone()];
        if let Some(token) = left_token {
            entry.lock_claims.push((left.store.id, token));
        }
        if let Some(token) = right_token {
            entry.lock_claims.push((right.store.id, token));
        }

        let results =
            StoreOperation::new(self.ctx.clone(), "MergeMappings", ErrorCategory::Mapping, entry)
                .execute()
                .await?;
        let fresh = Self::fresh_shard(&results, &left.shard.store);
        Ok(Mapping::new(merged, fresh))
    }
}

// ============================================================================
// Range façade
// ============================================================================

/// A shard map with range semantics: mappings cover half-open key ranges
/// `[low, high)` and lookups binary-search for containment.
#[derive(Debug, Clone)]
pub struct RangeShardMap {
    base: ShardMap,
}

impl RangeShardMap {
    pub(crate) fn new(base: ShardMap) -> Self {
        Self { base }
    }

    /// The shared shard-lifecycle surface.
    pub fn shard_map(&self) -> &ShardMap {
        &self.base
    }

    /// Map a half-open key range onto a shard. Fails with
    /// `MappingRangeAlreadyMapped` when any committed mapping intersects.
    pub async fn create_range_mapping(&self, range: ShardRange, shard: &Shard) -> Result<Mapping> {
        self.base.add_mapping(range, shard).await
    }

    /// Delete an offline mapping. `lock_token` must match the owner when
    /// the mapping is locked.
    pub async fn delete_mapping(
        &self,
        mapping: &Mapping,
        lock_token: Option<LockOwnerId>,
    ) -> Result<()> {
        self.base.remove_mapping(mapping, lock_token).await
    }

    /// Apply a status flip and/or a move to another shard. Moves require
    /// the mapping be offline first.
    pub async fn update_mapping(
        &self,
        mapping: &Mapping,
        update: MappingUpdate,
        lock_token: Option<LockOwnerId>,
    ) -> Result<Mapping> {
        self.base.update_mapping(mapping, update, lock_token).await
    }

    /// Take the mapping offline.
    pub async fn mark_mapping_offline(&self, mapping: &Mapping) -> Result<Mapping> {
        self.base
            .update_mapping(mapping, MappingUpdate::new().with_status(MappingStatus::Offline), None)
            .await
    }

    /// Bring the mapping back online.
    pub async fn mark_mapping_online(&self, mapping: &Mapping) -> Result<Mapping> {
        self.base
            .update_mapping(mapping, MappingUpdate::new().with_status(MappingStatus::Online), None)
            .await
    }

    /// Split one mapping into two at `split_point`, which must fall
    /// strictly inside the range. Both children inherit `lock_token`.
    pub async fn split_mapping(
        &self,
        mapping: &Mapping,
        split_point: ShardKey,
        lock_token: Option<LockOwnerId>,
    ) -> Result<(Mapping, Mapping)> {
        self.base.split(mapping, split_point, lock_token).await
    }

    /// Merge two adjacent mappings on the same shard into one covering
    /// their union. The merged mapping keeps the left side's lock owner.
    pub async fn merge_mappings(
        &self,
        left: &Mapping,
        right: &Mapping,
        left_token: Option<LockOwnerId>,
        right_token: Option<LockOwnerId>,
    ) -> Result<Mapping> {
        self.base.merge(left, right, left_token, right_token).await
    }

    /// Acquire the advisory lock. Fails `MappingIsAlreadyLocked` when any
    /// token holds it.
    pub async fn lock_mapping(&self, mapping: &Mapping, token: LockOwnerId) -> Result<()> {
        self.base
            .lock_op(Some(mapping), token, LockOpKind::Lock, "LockMapping")
            .await
    }

    /// Release the advisory lock. Fails `MappingLockOwnerIdDoesNotMatch`
    /// unless `token` holds it.
    pub async fn unlock_mapping(&self, mapping: &Mapping, token: LockOwnerId) -> Result<()> {
        self.base
            .lock_op(Some(mapping), token, LockOpKind::Unlock, "UnlockMapping")
            .await
    }

    /// Release every mapping in the map held by `token`.
    pub async fn unlock_all_mappings(&self, token: LockOwnerId) -> Result<()> {
        self.base
            .lock_op(None, token, LockOpKind::UnlockAll, "UnlockAllMappings")
            .await
    }

    /// The mapping covering `key`, offline or not, or
    /// `MappingNotFoundForKey`.
    pub async fn get_mapping_for_key(&self, key: &ShardKey) -> Result<Mapping> {
        self.base.lookup_mapping(key, false).await
    }

    /// The mapping covering `key`, if any.
    pub async fn try_get_mapping_for_key(&self, key: &ShardKey) -> Result<Option<Mapping>> {
        self.base.try_lookup_mapping(key).await
    }

    /// Data-dependent routing: the location to open a connection against
    /// for `key`. An offline mapping fails with `MappingIsOffline`.
    pub async fn route_for_key(&self, key: &ShardKey) -> Result<ShardLocation> {
        let mapping = self.base.lookup_mapping(key, true).await?;
        Ok(mapping.shard.store.location.clone())
    }

    /// Every mapping, ordered by range.
    pub async fn get_mappings(&self) -> Result<Vec<Mapping>> {
        self.base.list_mappings(None, None).await
    }

    /// Mappings intersecting `range`, ordered by range.
    pub async fn get_mappings_for_range(&self, range: ShardRange) -> Result<Vec<Mapping>> {
        self.base.list_mappings(Some(range), None).await
    }

    /// Mappings on one shard, ordered by range.
    pub async fn get_mappings_for_shard(&self, shard: &Shard) -> Result<Vec<Mapping>> {
        self.base.list_mappings(None, Some(shard)).await
    }

    /// Re-fetch a mapping row for a fresh snapshot.
    pub async fn get_mapping(&self, mapping_id: Uuid) -> Result<Mapping> {
        self.base.fetch_mapping(mapping_id, "GetMapping").await
    }
}

// ============================================================================
// List façade
// ============================================================================

/// A shard map with list semantics: each mapping assigns a single point
/// key, modeled internally as the unit range `[key, successor(key))`.
#[derive(Debug, Clone)]
pub struct ListShardMap {
    base: ShardMap,
}

impl ListShardMap {
    pub(crate) fn new(base: ShardMap) -> Self {
        Self { base }
    }

    /// The shared shard-lifecycle surface.
    pub fn shard_map(&self) -> &ShardMap {
        &self.base
    }

    /// Map a single point key onto a shard.
    pub async fn create_point_mapping(&self, key: &ShardKey, shard: &Shard) -> Result<Mapping> {
        let range = ShardRange::point(key)?;
        self.base.add_mapping(range, shard).await
    }

    /// Delete an offline mapping.
    pub async fn delete_mapping(
        &self,
        mapping: &Mapping,
        lock_token: Option<LockOwnerId>,
    ) -> Result<()> {
        self.base.remove_mapping(mapping, lock_token).await
    }

    /// Apply a status flip and/or a move to another shard.
    pub async fn update_mapping(
        &self,
        mapping: &Mapping,
        update: MappingUpdate,
        lock_token: Option<LockOwnerId>,
    ) -> Result<Mapping> {
        self.base.update_mapping(mapping, update, lock_token).await
    }

    /// Take the mapping offline.
    pub async fn mark_mapping_offline(&self, mapping: &Mapping) -> Result<Mapping> {
        self.base
            .update_mapping(mapping, MappingUpdate::new().with_status(MappingStatus::Offline), None)
            .await
    }

    /// Bring the mapping back online.
    pub async fn mark_mapping_online(&self, mapping: &Mapping) -> Result<Mapping> {
        self.base
            .update_mapping(mapping, MappingUpdate::new().with_status(MappingStatus::Online), None)
            .await
    }

    /// Acquire the advisory lock.
    pub async fn lock_mapping(&self, mapping: &Mapping, token: LockOwnerId) -> Result<()> {
        self.base
            .lock_op(Some(mapping), token, LockOpKind::Lock, "LockMapping")
            .await
    }

    /// Release the advisory lock.
    pub async fn unlock_mapping(&self, mapping: &Mapping, token: LockOwnerId) -> Result<()> {
        self.base
            .lock_op(Some(mapping), token, LockOpKind::Unlock, "UnlockMapping")
            .await
    }

    /// Release every mapping in the map held by `token`.
    pub async fn unlock_all_mappings(&self, token: LockOwnerId) -> Result<()> {
        self.base
            .lock_op(None, token, LockOpKind::UnlockAll, "UnlockAllMappings")
            .await
    }

    /// The mapping for `key`, offline or not.
    pub async fn get_mapping_for_key(&self, key: &ShardKey) -> Result<Mapping> {
        self.base.lookup_mapping(key, false).await
    }

    /// The mapping for `key`, if any.
    pub async fn try_get_mapping_for_key(&self, key: &ShardKey) -> Result<Option<Mapping>> {
        self.base.try_lookup_mapping(key).await
    }

    /// Data-dependent routing for `key`; offline mappings fail with
    /// `MappingIsOffline`.
    pub async fn route_for_key(&self, key: &ShardKey) -> Result<ShardLocation> {
        let mapping = self.base.lookup_mapping(key, true).await?;
        Ok(mapping.shard.store.location.clone())
    }

    /// Every point mapping.
    pub async fn get_mappings(&self) -> Result<Vec<Mapping>> {
        self.base.list_mappings(None, None).await
    }

    /// Point mappings on one shard.
    pub async fn get_mappings_for_shard(&self, shard: &Shard) -> Result<Vec<Mapping>> {
        self.base.list_mappings(None, Some(shard)).await
    }
}
