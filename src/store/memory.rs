//! In-memory reference implementation of the two-tier store.
//!
//! One `MemoryStoreService` holds the GSM plus one LSM per shard
//! location, all behind `parking_lot` locks. Every validation rule the
//! protocol relies on lives here: range-overlap detection, shard version
//! CAS, lock-token CAS, offline-before-delete, and pending-operation
//! blocking. Each `execute_*` call is one atomic transactional unit.

use super::*;
use crate::error::Result;
use crate::types::{LockOwnerId, MappingStatus, ShardLocation};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Schema version this store implements.
const SCHEMA_VERSION: StoreVersion = StoreVersion { major: 1, minor: 0 };

#[derive(Debug, Default)]
struct GlobalState {
    shard_maps: HashMap<Uuid, StoreShardMap>,
    shards: HashMap<Uuid, StoreShard>,
    mappings: HashMap<Uuid, StoreMapping>,
    log: HashMap<Uuid, StoreLogEntry>,
}

#[derive(Debug, Default)]
struct LocalState {
    shard_maps: HashMap<Uuid, StoreShardMap>,
    shards: HashMap<Uuid, StoreShard>,
    mappings: HashMap<Uuid, StoreMapping>,
}

/// In-memory GSM plus per-location LSMs.
#[derive(Debug, Default)]
pub struct MemoryStoreService {
    gsm: RwLock<GlobalState>,
    lsms: RwLock<HashMap<ShardLocation, LocalState>>,
}

impl MemoryStoreService {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_version<T>(request: &StoreRequest<T>) -> Option<StoreResults> {
        if request.version > STORE_PROTOCOL_VERSION {
            Some(StoreResults::failure(StoreResultCode::StoreVersionMismatch))
        } else {
            None
        }
    }
}

// ============================================================================
// Global operations
// ============================================================================

impl MemoryStoreService {
    fn global_execute(&self, input: GlobalOpInput) -> StoreResults {
        let mut gsm = self.gsm.write();
        match input {
            GlobalOpInput::AddShardMap(map) => add_shard_map(&mut gsm, map),
            GlobalOpInput::RemoveShardMap { shard_map_id } => {
                remove_shard_map(&mut gsm, shard_map_id)
            }
            GlobalOpInput::GetAllShardMaps => {
                let mut results = StoreResults::success();
                results.shard_maps = gsm.shard_maps.values().cloned().collect();
                results.store_version = Some(SCHEMA_VERSION);
                results
            }
            GlobalOpInput::FindShardMapByName { name } => {
                match gsm.shard_maps.values().find(|m| m.name == name) {
                    Some(map) => {
                        let mut results = StoreResults::success();
                        results.shard_maps = vec![map.clone()];
                        results
                    }
                    None => StoreResults::failure(StoreResultCode::ShardMapDoesNotExist),
                }
            }
            GlobalOpInput::GetAllShards { shard_map_id } => {
                if !gsm.shard_maps.contains_key(&shard_map_id) {
                    return StoreResults::failure(StoreResultCode::ShardMapDoesNotExist);
                }
                let mut results = StoreResults::success();
                results.shards = gsm
                    .shards
                    .values()
                    .filter(|s| s.shard_map_id == shard_map_id)
                    .cloned()
                    .collect();
                results
            }
            GlobalOpInput::FindShardByLocation {
                shard_map_id,
                location,
            } => {
                match gsm
                    .shards
                    .values()
                    .find(|s| s.shard_map_id == shard_map_id && s.location == location)
                {
                    Some(shard) => {
                        let mut results = StoreResults::success();
                        results.shards = vec![shard.clone()];
                        results
                    }
                    None => StoreResults::failure(StoreResultCode::ShardDoesNotExist),
                }
            }
            GlobalOpInput::GetAllMappings {
                shard_map_id,
                shard_id,
                range,
            } => {
                if !gsm.shard_maps.contains_key(&shard_map_id) {
                    return StoreResults::failure(StoreResultCode::ShardMapDoesNotExist);
                }
                let mut mappings: Vec<StoreMapping> = gsm
                    .mappings
                    .values()
                    .filter(|m| m.shard_map_id == shard_map_id)
                    .filter(|m| shard_id.map_or(true, |id| m.shard_id == id))
                    .filter(|m| range.as_ref().map_or(true, |r| m.range.intersects(r)))
                    .cloned()
                    .collect();
                mappings.sort_by(|a, b| a.range.cmp(&b.range));
                let mut results = StoreResults::success();
                let mut shards: HashMap<Uuid, StoreShard> = HashMap::new();
                for mapping in &mappings {
                    if let Some(shard) = gsm.shards.get(&mapping.shard_id) {
                        shards.insert(shard.id, shard.clone());
                    }
                }
                results.shards = shards.into_values().collect();
                results.mappings = mappings;
                results
            }
            GlobalOpInput::FindMappingByKey { shard_map_id, key } => {
                let found = gsm
                    .mappings
                    .values()
                    .find(|m| m.shard_map_id == shard_map_id && m.range.contains(&key));
                match found {
                    Some(mapping) => {
                        let mut results = StoreResults::success();
                        results.shards =
                            gsm.shards.get(&mapping.shard_id).cloned().into_iter().collect();
                        results.mappings = vec![mapping.clone()];
                        results
                    }
                    None => StoreResults::failure(StoreResultCode::MappingNotFoundForKey),
                }
            }
            GlobalOpInput::FindMappingById {
                shard_map_id,
                mapping_id,
            } => match gsm.mappings.get(&mapping_id) {
                Some(mapping) if mapping.shard_map_id == shard_map_id => {
                    let mut results = StoreResults::success();
                    results.shards =
                        gsm.shards.get(&mapping.shard_id).cloned().into_iter().collect();
                    results.mappings = vec![mapping.clone()];
                    results
                }
                _ => StoreResults::failure(StoreResultCode::MappingDoesNotExist),
            },
            GlobalOpInput::LockOrUnlockMappings {
                shard_map_id,
                mapping_id,
                lock_owner_id,
                op,
            } => lock_or_unlock(&mut gsm, shard_map_id, mapping_id, lock_owner_id, op),
            GlobalOpInput::AttachShard { shard_map, shard } => attach_shard(&mut gsm, shard_map, shard),
            GlobalOpInput::DetachShard {
                shard_map_id,
                location,
            } => detach_shard(&mut gsm, shard_map_id, location),
            GlobalOpInput::GetOperationLog { shard_map_id } => {
                let mut results = StoreResults::success();
                results.log_entries = gsm
                    .log
                    .values()
                    .filter(|e| shard_map_id.map_or(true, |id| e.shard_map.id == id))
                    .cloned()
                    .collect();
                results
            }
            GlobalOpInput::BeginOperation { entry } => begin_operation(&mut gsm, entry),
            GlobalOpInput::AdvanceOperation {
                operation_id,
                state,
            } => match gsm.log.get_mut(&operation_id) {
                Some(entry) => {
                    entry.state = state;
                    StoreResults::success()
                }
                None => StoreResults::failure(StoreResultCode::OperationDoesNotExist),
            },
            GlobalOpInput::EndOperation { operation_id } => {
                if gsm.log.remove(&operation_id).is_some() {
                    StoreResults::success()
                } else {
                    StoreResults::failure(StoreResultCode::OperationDoesNotExist)
                }
            }
            GlobalOpInput::UndoOperation { entry } => undo_operation(&mut gsm, entry),
        }
    }
}

fn add_shard_map(gsm: &mut GlobalState, map: StoreShardMap) -> StoreResults {
    if gsm.shard_maps.values().any(|m| m.name == map.name) {
        return StoreResults::failure(StoreResultCode::ShardMapExists);
    }
    let mut results = StoreResults::success();
    results.shard_maps = vec![map.clone()];
    gsm.shard_maps.insert(map.id, map);
    results
}

fn remove_shard_map(gsm: &mut GlobalState, shard_map_id: Uuid) -> StoreResults {
    if !gsm.shard_maps.contains_key(&shard_map_id) {
        return StoreResults::failure(StoreResultCode::ShardMapDoesNotExist);
    }
    if gsm.shards.values().any(|s| s.shard_map_id == shard_map_id) {
        return StoreResults::failure(StoreResultCode::ShardMapHasShards);
    }
    gsm.shard_maps.remove(&shard_map_id);
    StoreResults::success()
}

fn lock_or_unlock(
    gsm: &mut GlobalState,
    shard_map_id: Uuid,
    mapping_id: Option<Uuid>,
    lock_owner_id: LockOwnerId,
    op: LockOpKind,
) -> StoreResults {
    match op {
        LockOpKind::Lock | LockOpKind::Unlock => {
            let Some(id) = mapping_id else {
                return StoreResults::failure(StoreResultCode::UnexpectedError);
            };
            let Some(mapping) = gsm.mappings.get_mut(&id).filter(|m| m.shard_map_id == shard_map_id)
            else {
                return StoreResults::failure(StoreResultCode::MappingDoesNotExist);
            };
            match op {
                LockOpKind::Lock => {
                    if !mapping.lock_owner_id.is_nil() {
                        return StoreResults::failure(StoreResultCode::MappingIsAlreadyLocked);
                    }
                    mapping.lock_owner_id = lock_owner_id;
                }
                LockOpKind::Unlock => {
                    if mapping.lock_owner_id != lock_owner_id {
                        return StoreResults::failure(
                            StoreResultCode::MappingLockOwnerIdDoesNotMatch,
                        );
                    }
                    mapping.lock_owner_id = LockOwnerId::nil();
                }
                LockOpKind::UnlockAll => unreachable!(),
            }
            let mut results = StoreResults::success();
            results.mappings = vec![mapping.clone()];
            results
        }
        LockOpKind::UnlockAll => {
            let mut released = Vec::new();
            for mapping in gsm
                .mappings
                .values_mut()
                .filter(|m| m.shard_map_id == shard_map_id && m.lock_owner_id == lock_owner_id)
            {
                mapping.lock_owner_id = LockOwnerId::nil();
                released.push(mapping.clone());
            }
            let mut results = StoreResults::success();
            results.mappings = released;
            results
        }
    }
}

fn attach_shard(gsm: &mut GlobalState, shard_map: StoreShardMap, shard: StoreShard) -> StoreResults {
    gsm.shard_maps.entry(shard_map.id).or_insert(shard_map);
    if gsm
        .shards
        .values()
        .any(|s| s.shard_map_id == shard.shard_map_id && s.location == shard.location)
    {
        return StoreResults::failure(StoreResultCode::ShardExists);
    }
    let mut results = StoreResults::success();
    results.shards = vec![shard.clone()];
    gsm.shards.insert(shard.id, shard);
    results
}

fn detach_shard(gsm: &mut GlobalState, shard_map_id: Uuid, location: ShardLocation) -> StoreResults {
    let Some(shard_id) = gsm
        .shards
        .values()
        .find(|s| s.shard_map_id == shard_map_id && s.location == location)
        .map(|s| s.id)
    else {
        return StoreResults::failure(StoreResultCode::ShardDoesNotExist);
    };
    gsm.shards.remove(&shard_id);
    gsm.mappings.retain(|_, m| m.shard_id != shard_id);
    StoreResults::success()
}

/// Validate and begin a multi-step operation: one transaction covering
/// the pending-operation check, every domain validation, the GSM deltas
/// and the log-entry insert.
fn begin_operation(gsm: &mut GlobalState, entry: StoreLogEntry) -> StoreResults {
    // Pending operations on the same shard map serialize through the
    // log: the caller must undo them before making progress.
    let pending: Vec<StoreLogEntry> = gsm
        .log
        .values()
        .filter(|e| e.shard_map.id == entry.shard_map.id)
        .cloned()
        .collect();
    if !pending.is_empty() {
        let mut results = StoreResults::failure(StoreResultCode::PendingOperation);
        results.log_entries = pending;
        return results;
    }

    if !gsm.shard_maps.contains_key(&entry.shard_map.id) {
        return StoreResults::failure(StoreResultCode::ShardMapDoesNotExist);
    }

    // Shard version CAS against the caller's snapshots.
    for snapshot in &entry.shards_involved {
        match gsm.shards.get(&snapshot.id) {
            None => return StoreResults::failure(StoreResultCode::ShardDoesNotExist),
            Some(current) if current.version != snapshot.version => {
                return StoreResults::failure(StoreResultCode::ShardVersionMismatch)
            }
            Some(_) => {}
        }
    }

    // Per-code shard validations.
    match entry.code {
        StoreOperationCode::AddShard => {
            for shard in &entry.shards_added {
                if gsm
                    .shards
                    .values()
                    .any(|s| s.shard_map_id == shard.shard_map_id && s.location == shard.location)
                {
                    return StoreResults::failure(StoreResultCode::ShardExists);
                }
            }
        }
        StoreOperationCode::RemoveShard => {
            for shard in &entry.shards_removed {
                match gsm.shards.get(&shard.id) {
                    None => return StoreResults::failure(StoreResultCode::ShardDoesNotExist),
                    Some(current) if current.version != shard.version => {
                        return StoreResults::failure(StoreResultCode::ShardVersionMismatch)
                    }
                    Some(_) => {}
                }
                if gsm.mappings.values().any(|m| m.shard_id == shard.id) {
                    return StoreResults::failure(StoreResultCode::ShardHasMappings);
                }
            }
        }
        _ => {}
    }

    // Mapping removals: existence, lock CAS, offline requirement.
    let requires_offline = matches!(
        entry.code,
        StoreOperationCode::RemoveMapping | StoreOperationCode::MoveMapping
    );
    for snapshot in &entry.mappings_removed {
        let Some(current) = gsm.mappings.get(&snapshot.id) else {
            // Recovery replacement tolerates rows that are already gone.
            if entry.code == StoreOperationCode::ReplaceMappings {
                continue;
            }
            return StoreResults::failure(StoreResultCode::MappingDoesNotExist);
        };
        if entry.code != StoreOperationCode::ReplaceMappings {
            if !current.lock_owner_id.is_nil()
                && current.lock_owner_id != entry.claimed_token(snapshot.id)
            {
                return StoreResults::failure(StoreResultCode::MappingLockOwnerIdDoesNotMatch);
            }
            if requires_offline && current.status != MappingStatus::Offline {
                return StoreResults::failure(StoreResultCode::MappingIsNotOffline);
            }
        }
    }

    // Mapping additions: no intersection with surviving committed rows.
    for added in &entry.mappings_added {
        let conflict = gsm.mappings.values().any(|existing| {
            existing.shard_map_id == entry.shard_map.id
                && existing.id != added.id
                && !entry.mappings_removed.iter().any(|r| r.id == existing.id)
                && existing.range.intersects(&added.range)
        });
        if conflict {
            return StoreResults::failure(StoreResultCode::MappingRangeAlreadyMapped);
        }
    }

    // Apply the GSM deltas.
    for removed in &entry.mappings_removed {
        gsm.mappings.remove(&removed.id);
    }
    for added in &entry.mappings_added {
        gsm.mappings.insert(added.id, added.clone());
    }
    for removed in &entry.shards_removed {
        gsm.shards.remove(&removed.id);
    }
    for added in &entry.shards_added {
        gsm.shards.insert(added.id, added.clone());
    }
    for snapshot in &entry.shards_involved {
        if let Some(current) = gsm.shards.get_mut(&snapshot.id) {
            current.version = Uuid::new_v4();
        }
    }

    debug!(operation_id = %entry.id, code = ?entry.code, "begin operation");

    let mut results = StoreResults::success();
    results.mappings = entry.mappings_added.clone();
    results.shards = entry
        .shards_involved
        .iter()
        .chain(entry.shards_added.iter())
        .filter_map(|s| gsm.shards.get(&s.id))
        .cloned()
        .collect();
    gsm.log.insert(entry.id, entry);
    results
}

/// Undo a pending operation's GSM effects and delete its log entry.
/// A missing entry means someone else already resolved it; that is a
/// success, which makes undo safe to re-run any number of times.
fn undo_operation(gsm: &mut GlobalState, entry: StoreLogEntry) -> StoreResults {
    if gsm.log.remove(&entry.id).is_none() {
        return StoreResults::success();
    }
    for added in &entry.mappings_added {
        gsm.mappings.remove(&added.id);
    }
    for removed in &entry.mappings_removed {
        gsm.mappings.insert(removed.id, removed.clone());
    }
    for added in &entry.shards_added {
        gsm.shards.remove(&added.id);
    }
    for removed in &entry.shards_removed {
        gsm.shards.insert(removed.id, removed.clone());
    }
    for snapshot in &entry.shards_involved {
        if let Some(current) = gsm.shards.get_mut(&snapshot.id) {
            current.version = snapshot.version;
        }
    }
    debug!(operation_id = %entry.id, code = ?entry.code, "undo operation");
    StoreResults::success()
}

// ============================================================================
// Local operations
// ============================================================================

impl MemoryStoreService {
    fn local_execute(&self, location: &ShardLocation, input: LocalOpInput) -> StoreResults {
        let mut lsms = self.lsms.write();
        match input {
            LocalOpInput::AddShard { shard_map, shard } => {
                let lsm = lsms.entry(location.clone()).or_default();
                lsm.shard_maps.insert(shard_map.id, shard_map);
                lsm.shards.insert(shard.id, shard);
                StoreResults::success()
            }
            LocalOpInput::RemoveShard {
                shard_map_id,
                shard_id,
            } => {
                if let Some(lsm) = lsms.get_mut(location) {
                    lsm.shards.remove(&shard_id);
                    lsm.mappings
                        .retain(|_, m| !(m.shard_map_id == shard_map_id && m.shard_id == shard_id));
                }
                StoreResults::success()
            }
            LocalOpInput::ReplaceMappings {
                shard_map_id: _,
                remove_ids,
                add,
            } => {
                let lsm = lsms.entry(location.clone()).or_default();
                for id in &remove_ids {
                    lsm.mappings.remove(id);
                }
                for mapping in add {
                    lsm.mappings.insert(mapping.id, mapping);
                }
                StoreResults::success()
            }
            LocalOpInput::GetAllShardMaps => {
                let mut results = StoreResults::success();
                if let Some(lsm) = lsms.get(location) {
                    results.shard_maps = lsm.shard_maps.values().cloned().collect();
                }
                results
            }
            LocalOpInput::GetMappings {
                shard_map_id,
                shard_id,
            } => {
                let mut results = StoreResults::success();
                if let Some(lsm) = lsms.get(location) {
                    let mut mappings: Vec<StoreMapping> = lsm
                        .mappings
                        .values()
                        .filter(|m| m.shard_map_id == shard_map_id)
                        .filter(|m| shard_id.map_or(true, |id| m.shard_id == id))
                        .cloned()
                        .collect();
                    mappings.sort_by(|a, b| a.range.cmp(&b.range));
                    results.shards = lsm.shards.values().cloned().collect();
                    results.mappings = mappings;
                }
                results
            }
        }
    }
}

#[async_trait]
impl StoreService for MemoryStoreService {
    async fn execute_global(
        &self,
        request: StoreRequest<GlobalOpInput>,
        _scope: TransactionScope,
    ) -> Result<StoreResults> {
        if let Some(mismatch) = Self::check_version(&request) {
            return Ok(mismatch);
        }
        Ok(self.global_execute(request.input))
    }

    async fn execute_local(
        &self,
        location: &ShardLocation,
        request: StoreRequest<LocalOpInput>,
        _scope: TransactionScope,
    ) -> Result<StoreResults> {
        if let Some(mismatch) = Self::check_version(&request) {
            return Ok(mismatch);
        }
        Ok(self.local_execute(location, request.input))
    }
}
