//! Store model and contract for the two-tier metadata store.
//!
//! The Global Shard Map store (GSM) is the single authoritative store for
//! all shard maps, shards, mappings and the pending-operations log. Each
//! shard additionally carries a Local Shard Map store (LSM) mirroring the
//! mappings that live on it.
//!
//! The transport behind a store is a collaborator detail. This module
//! defines the records exchanged with it, the typed request inputs (a
//! versioned, schema-evolvable encoding), the result codes the store may
//! report, and the [`StoreService`] seam the operation framework executes
//! against. [`MemoryStoreService`] is the in-process reference
//! implementation.

pub mod memory;

pub use memory::MemoryStoreService;

use crate::key::{ShardKey, ShardKeyType, ShardRange};
use crate::types::{LockOwnerId, MappingStatus, ShardLocation, ShardMapKind, ShardStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version tag carried by every store request. A store that only
/// understands an older version rejects the request with
/// [`StoreResultCode::StoreVersionMismatch`].
pub const STORE_PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Records
// ============================================================================

/// A shard map row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreShardMap {
    /// Stable identifier.
    pub id: Uuid,
    /// Unique name within the GSM.
    pub name: String,
    /// List or range semantics.
    pub kind: ShardMapKind,
    /// Key type shared by every mapping in the map.
    pub key_type: ShardKeyType,
}

impl StoreShardMap {
    /// Create a shard map row with a fresh id.
    pub fn new(name: impl Into<String>, kind: ShardMapKind, key_type: ShardKeyType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            key_type,
        }
    }
}

/// A shard row: one physical data source owned by one shard map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreShard {
    /// Stable identifier.
    pub id: Uuid,
    /// Version, replaced on every mutating operation touching the shard.
    /// Operations CAS on it to detect concurrent writers.
    pub version: Uuid,
    /// Owning shard map.
    pub shard_map_id: Uuid,
    /// Physical endpoint.
    pub location: ShardLocation,
    /// Availability status.
    pub status: ShardStatus,
}

impl StoreShard {
    /// Create a shard row with fresh id and version.
    pub fn new(shard_map_id: Uuid, location: ShardLocation) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: Uuid::new_v4(),
            shard_map_id,
            location,
            status: ShardStatus::Online,
        }
    }
}

/// A mapping row: one key range assigned to one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMapping {
    /// Stable identifier.
    pub id: Uuid,
    /// Owning shard map.
    pub shard_map_id: Uuid,
    /// Covered key range (point mappings are unit ranges).
    pub range: ShardRange,
    /// Availability status.
    pub status: MappingStatus,
    /// Advisory lock owner; nil means unlocked.
    pub lock_owner_id: LockOwnerId,
    /// Target shard.
    pub shard_id: Uuid,
}

impl StoreMapping {
    /// Create a mapping row with a fresh id.
    pub fn new(shard_map_id: Uuid, range: ShardRange, shard_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            shard_map_id,
            range,
            status: MappingStatus::Online,
            lock_owner_id: LockOwnerId::nil(),
            shard_id,
        }
    }
}

/// Store schema version row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVersion {
    /// Major schema version.
    pub major: u32,
    /// Minor schema version.
    pub minor: u32,
}

// ============================================================================
// Pending-operation log
// ============================================================================

/// Operation kinds persisted in the pending-operations log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOperationCode {
    /// Register a new shard and mirror it to its LSM.
    AddShard,
    /// Remove an empty shard from the GSM and its LSM.
    RemoveShard,
    /// Replace a shard row in place (status change).
    UpdateShard,
    /// Create a point or range mapping.
    AddMapping,
    /// Delete an offline mapping.
    RemoveMapping,
    /// Replace a mapping in place (status flip).
    UpdateMapping,
    /// Move an offline mapping to a different shard.
    MoveMapping,
    /// Split one mapping into two covering the same range.
    SplitMapping,
    /// Merge two adjacent mappings on the same shard.
    MergeMappings,
    /// Wholesale replacement of a shard's mappings (recovery).
    ReplaceMappings,
}

/// Durable checkpoint of how far a multi-step operation progressed.
///
/// The log entry is inserted at `GlobalBegin` and deleted once every step
/// confirmed; the enum records the last *known* committed local step. A
/// local step may have committed without the checkpoint advancing (crash
/// in between), which is why the undo direction is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreOperationState {
    /// GSM transaction committed: log entry inserted, GSM deltas applied.
    GlobalBegin,
    /// Source-LSM transaction committed.
    LocalSourceDone,
    /// Target-LSM transaction committed (two-shard moves only).
    LocalTargetDone,
}

/// A persisted in-flight operation: everything needed to redo or undo
/// each step after a crash, in either this or a different process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreLogEntry {
    /// Operation instance id (fresh per attempt).
    pub id: Uuid,
    /// Operation kind.
    pub code: StoreOperationCode,
    /// Last known committed step.
    pub state: StoreOperationState,
    /// The shard map the operation mutates.
    pub shard_map: StoreShardMap,
    /// Source shard location (first local step).
    pub source: ShardLocation,
    /// Target shard location (second local step, move-type operations).
    pub target: Option<ShardLocation>,
    /// Pre-operation snapshots of every touched shard; used for version
    /// CAS at begin and version restore at undo.
    pub shards_involved: Vec<StoreShard>,
    /// Shard rows inserted by the operation.
    pub shards_added: Vec<StoreShard>,
    /// Shard rows deleted by the operation (pre-operation snapshots).
    pub shards_removed: Vec<StoreShard>,
    /// Mapping rows inserted by the operation.
    pub mappings_added: Vec<StoreMapping>,
    /// Mapping rows deleted by the operation (pre-operation snapshots).
    pub mappings_removed: Vec<StoreMapping>,
    /// Lock tokens the caller claims for locked mappings it touches:
    /// `(mapping id, claimed token)`.
    pub lock_claims: Vec<(Uuid, LockOwnerId)>,
}

impl StoreLogEntry {
    /// Serialize for persistence in the operations log.
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| crate::error::Error::Internal(e.to_string()))
    }

    /// Deserialize a logged entry.
    pub fn from_bytes(data: &[u8]) -> crate::error::Result<Self> {
        bincode::deserialize(data).map_err(|e| crate::error::Error::Internal(e.to_string()))
    }

    /// The claimed lock token for a mapping, nil when no claim was made.
    pub fn claimed_token(&self, mapping_id: Uuid) -> LockOwnerId {
        self.lock_claims
            .iter()
            .find(|(id, _)| *id == mapping_id)
            .map(|(_, token)| *token)
            .unwrap_or_else(LockOwnerId::nil)
    }

    /// Resolve the location of the shard a mapping points at, searching
    /// the involved and added shard snapshots.
    pub fn location_of(&self, shard_id: Uuid) -> Option<&ShardLocation> {
        self.shards_involved
            .iter()
            .chain(self.shards_added.iter())
            .chain(self.shards_removed.iter())
            .find(|s| s.id == shard_id)
            .map(|s| &s.location)
    }

    /// Mappings this operation adds whose shard lives at `location`.
    pub fn mappings_added_at(&self, location: &ShardLocation) -> Vec<StoreMapping> {
        self.mappings_added
            .iter()
            .filter(|m| self.location_of(m.shard_id) == Some(location))
            .cloned()
            .collect()
    }

    /// Mappings this operation removes whose shard lives at `location`.
    pub fn mappings_removed_at(&self, location: &ShardLocation) -> Vec<StoreMapping> {
        self.mappings_removed
            .iter()
            .filter(|m| self.location_of(m.shard_id) == Some(location))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Result codes a store execution can report.
///
/// Everything except `Success` and `PendingOperation` is a terminal
/// domain conflict; `PendingOperation` triggers the undo-then-retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreResultCode {
    /// The operation committed.
    Success,
    /// A shard map with the same name exists.
    ShardMapExists,
    /// The shard map does not exist.
    ShardMapDoesNotExist,
    /// The shard map still holds shards.
    ShardMapHasShards,
    /// A shard exists at the same location.
    ShardExists,
    /// The shard does not exist.
    ShardDoesNotExist,
    /// The shard still holds mappings.
    ShardHasMappings,
    /// Shard version CAS failed (concurrent writer).
    ShardVersionMismatch,
    /// The mapping does not exist.
    MappingDoesNotExist,
    /// The new range intersects a committed mapping.
    MappingRangeAlreadyMapped,
    /// No mapping covers the key.
    MappingNotFoundForKey,
    /// The mapping is online but must be offline.
    MappingIsNotOffline,
    /// The mapping is offline (routing lookups only).
    MappingIsOffline,
    /// The mapping is locked by a different owner.
    MappingIsAlreadyLocked,
    /// The supplied lock token does not match the owner.
    MappingLockOwnerIdDoesNotMatch,
    /// The request's protocol version is not supported.
    StoreVersionMismatch,
    /// Pending operations block this one; the blocking log entries are
    /// returned in [`StoreResults::log_entries`].
    PendingOperation,
    /// Advance/end referenced a log entry that no longer exists.
    OperationDoesNotExist,
    /// Catch-all for malformed requests.
    UnexpectedError,
}

/// Typed rowsets plus status returned by one store execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreResults {
    /// Status code.
    pub result: StoreResultCode,
    /// Shard map rows.
    pub shard_maps: Vec<StoreShardMap>,
    /// Shard rows.
    pub shards: Vec<StoreShard>,
    /// Mapping rows.
    pub mappings: Vec<StoreMapping>,
    /// Pending-operation log entries.
    pub log_entries: Vec<StoreLogEntry>,
    /// Store schema version, when the request asked for it.
    pub store_version: Option<StoreVersion>,
}

impl Default for StoreResultCode {
    fn default() -> Self {
        StoreResultCode::Success
    }
}

impl StoreResults {
    /// A bare success with no rowsets.
    pub fn success() -> Self {
        Self::default()
    }

    /// A terminal failure with the given code.
    pub fn failure(result: StoreResultCode) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    /// Whether the execution committed.
    pub fn is_success(&self) -> bool {
        self.result == StoreResultCode::Success
    }

    /// Whether pending log entries block the caller.
    pub fn has_pending_operations(&self) -> bool {
        self.result == StoreResultCode::PendingOperation
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Transaction scope for one store execution. Each execution is a single
/// transactional unit: committed when it returns, rolled back on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionScope {
    /// Snapshot read; never blocks writers.
    ReadOnly,
    /// Repeatable-read write transaction.
    ReadWrite,
}

/// Lock operation kinds for [`GlobalOpInput::LockOrUnlockMappings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOpKind {
    /// Acquire the lock (fails if held by anyone).
    Lock,
    /// Release the lock (fails unless held by the given token).
    Unlock,
    /// Release every mapping in the map held by the given token.
    UnlockAll,
}

/// Typed operations against the GSM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GlobalOpInput {
    /// Insert a shard map row.
    AddShardMap(StoreShardMap),
    /// Delete an empty shard map.
    RemoveShardMap {
        /// Shard map to delete.
        shard_map_id: Uuid,
    },
    /// Fetch every shard map row.
    GetAllShardMaps,
    /// Fetch a shard map row by name.
    FindShardMapByName {
        /// Name to match exactly.
        name: String,
    },
    /// Fetch every shard of a map.
    GetAllShards {
        /// Owning shard map.
        shard_map_id: Uuid,
    },
    /// Fetch the shard at a location.
    FindShardByLocation {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Endpoint to match.
        location: ShardLocation,
    },
    /// Fetch mappings, optionally restricted to a shard and/or a range.
    GetAllMappings {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Restrict to one shard.
        shard_id: Option<Uuid>,
        /// Restrict to ranges intersecting this one.
        range: Option<ShardRange>,
    },
    /// Fetch the mapping covering a key, joined with its shard row.
    FindMappingByKey {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Key to locate.
        key: ShardKey,
    },
    /// Fetch a mapping row by id, joined with its shard row.
    FindMappingById {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Mapping to fetch.
        mapping_id: Uuid,
    },
    /// Compare-and-swap a mapping's lock owner.
    LockOrUnlockMappings {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Mapping to lock/unlock; `None` with `UnlockAll` targets every
        /// mapping held by the token.
        mapping_id: Option<Uuid>,
        /// The caller's token.
        lock_owner_id: LockOwnerId,
        /// Lock, unlock, or unlock-all.
        op: LockOpKind,
    },
    /// Upsert an orphaned shard's metadata (recovery).
    AttachShard {
        /// Shard map the shard claims to belong to.
        shard_map: StoreShardMap,
        /// The shard row to upsert.
        shard: StoreShard,
    },
    /// Remove a shard row and its GSM mappings without touching the LSM
    /// (recovery).
    DetachShard {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Endpoint to detach.
        location: ShardLocation,
    },
    /// Fetch pending-operation log entries, optionally for one map.
    GetOperationLog {
        /// Restrict to one shard map.
        shard_map_id: Option<Uuid>,
    },
    /// Begin a multi-step operation: validate, insert the log entry and
    /// apply the GSM deltas in one transaction.
    BeginOperation {
        /// The operation to begin.
        entry: StoreLogEntry,
    },
    /// Advance the log entry's checkpoint after a local step committed.
    AdvanceOperation {
        /// Operation instance.
        operation_id: Uuid,
        /// New checkpoint.
        state: StoreOperationState,
    },
    /// Delete the log entry: the operation is complete.
    EndOperation {
        /// Operation instance.
        operation_id: Uuid,
    },
    /// Undo a pending operation: restore the GSM snapshots and delete
    /// the log entry in one transaction. Idempotent.
    UndoOperation {
        /// The logged entry to undo.
        entry: StoreLogEntry,
    },
}

/// Typed operations against one shard's LSM. All mutations are
/// idempotent so the undo direction can re-run them safely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalOpInput {
    /// Upsert the shard map metadata and the shard's own row.
    AddShard {
        /// Shard map metadata mirror.
        shard_map: StoreShardMap,
        /// The shard row.
        shard: StoreShard,
    },
    /// Remove the shard row (and its mappings) if present.
    RemoveShard {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Shard to remove.
        shard_id: Uuid,
    },
    /// Remove then upsert mapping rows in one transaction.
    ReplaceMappings {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Mapping ids to remove if present.
        remove_ids: Vec<Uuid>,
        /// Mapping rows to upsert.
        add: Vec<StoreMapping>,
    },
    /// Fetch the shard map metadata rows mirrored on this LSM.
    GetAllShardMaps,
    /// Fetch this LSM's mapping rows for a map, optionally one shard.
    GetMappings {
        /// Owning shard map.
        shard_map_id: Uuid,
        /// Restrict to one shard.
        shard_id: Option<Uuid>,
    },
}

/// A versioned request envelope: the schema-evolvable structured encoding
/// handed to the store transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest<T> {
    /// Protocol version of the input encoding.
    pub version: u32,
    /// The typed operation.
    pub input: T,
}

impl<T> StoreRequest<T> {
    /// Wrap an input at the current protocol version.
    pub fn new(input: T) -> Self {
        Self {
            version: STORE_PROTOCOL_VERSION,
            input,
        }
    }
}

// ============================================================================
// Service contract
// ============================================================================

/// Execution seam between the operation framework and the metadata
/// stores.
///
/// One call is one transactional unit against the named store: committed
/// when the call returns `Ok`, rolled back otherwise. Transport failures
/// surface as [`Error::Transient`](crate::Error::Transient) (retryable)
/// or [`Error::Store`](crate::Error::Store) (terminal); domain conflicts
/// come back inside [`StoreResults`] and are never Rust errors.
#[async_trait]
pub trait StoreService: Send + Sync + std::fmt::Debug {
    /// Execute one operation against the GSM.
    async fn execute_global(
        &self,
        request: StoreRequest<GlobalOpInput>,
        scope: TransactionScope,
    ) -> crate::error::Result<StoreResults>;

    /// Execute one operation against the LSM at `location`.
    async fn execute_local(
        &self,
        location: &ShardLocation,
        request: StoreRequest<LocalOpInput>,
        scope: TransactionScope,
    ) -> crate::error::Result<StoreResults>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> StoreLogEntry {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let shard = StoreShard::new(map.id, ShardLocation::new("s0", "db0"));
        let range = ShardRange::new(
            crate::key::ShardKey::from_i32(0),
            crate::key::ShardKey::from_i32(10),
        )
        .unwrap();
        let mapping = StoreMapping::new(map.id, range, shard.id);
        StoreLogEntry {
            id: Uuid::new_v4(),
            code: StoreOperationCode::AddMapping,
            state: StoreOperationState::GlobalBegin,
            shard_map: map,
            source: shard.location.clone(),
            target: None,
            shards_involved: vec![shard],
            shards_added: vec![],
            shards_removed: vec![],
            mappings_added: vec![mapping],
            mappings_removed: vec![],
            lock_claims: vec![],
        }
    }

    #[test]
    fn log_entry_round_trips_through_bytes() {
        let entry = sample_entry();
        let bytes = entry.to_bytes().unwrap();
        let back = StoreLogEntry::from_bytes(&bytes).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn log_entry_locates_mappings_by_shard() {
        let entry = sample_entry();
        let loc = entry.source.clone();
        assert_eq!(entry.mappings_added_at(&loc).len(), 1);
        assert!(entry.mappings_removed_at(&loc).is_empty());
        let elsewhere = ShardLocation::new("other", "db");
        assert!(entry.mappings_added_at(&elsewhere).is_empty());
    }

    #[test]
    fn claimed_token_defaults_to_nil() {
        let mut entry = sample_entry();
        let mapping_id = entry.mappings_added[0].id;
        assert!(entry.claimed_token(mapping_id).is_nil());
        let token = Uuid::new_v4();
        entry.lock_claims.push((mapping_id, token));
        assert_eq!(entry.claimed_token(mapping_id), token);
    }

    #[test]
    fn request_envelope_carries_protocol_version() {
        let req = StoreRequest::new(GlobalOpInput::GetAllShardMaps);
        assert_eq!(req.version, STORE_PROTOCOL_VERSION);
    }
}
