//! The store-operation framework: the multi-step state machine every
//! mutating request runs through.
//!
//! A mutating call becomes a [`StoreLogEntry`] describing its GSM and
//! LSM deltas, executed by one generic driver:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ loop:                                                          │
//! │   1. GSM BeginOperation  (validate + log insert + GSM deltas)  │
//! │      └─ PendingOperation? undo each blocking entry, loop again │
//! │   2. evict affected cache entries                              │
//! │   3. source-LSM delta, then advance checkpoint                 │
//! │   4. target-LSM delta (moves only), then advance checkpoint    │
//! │   5. GSM EndOperation    (log delete)                          │
//! │   6. refresh cache from confirmed rows                         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! GSM effects commit before any LSM step runs, and LSM steps run before
//! the log entry is cleared, so the log entry always bounds how far an
//! operation got. A crash at any point leaves the entry pending; the next
//! caller on the same shard map discovers it, replays the undo direction
//! (idempotent at every step) and then proceeds with its own intent.
//! Conflicting operations serialize through the log, not through a lock
//! manager.

pub mod retry;

pub use retry::RetryPolicy;

use crate::cache::{CacheStore, CacheStorePolicy};
use crate::error::{Error, ErrorCategory, Result, ShardManagementErrorCode};
use crate::store::{
    GlobalOpInput, LocalOpInput, StoreLogEntry, StoreOperationState, StoreRequest, StoreResultCode,
    StoreResults, StoreService, TransactionScope,
};
use crate::types::ShardLocation;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Translate a store-reported conflict code into the typed management
/// error. The single seam where store codes become domain errors.
pub(crate) fn management_error(
    result: StoreResultCode,
    category: ErrorCategory,
    operation: &str,
) -> Error {
    use ShardManagementErrorCode as Code;
    let code = match result {
        StoreResultCode::ShardMapExists => Code::ShardMapAlreadyExists,
        StoreResultCode::ShardMapDoesNotExist => Code::ShardMapDoesNotExist,
        StoreResultCode::ShardMapHasShards => Code::ShardMapHasShards,
        StoreResultCode::ShardExists => Code::ShardAlreadyExists,
        StoreResultCode::ShardDoesNotExist => Code::ShardDoesNotExist,
        StoreResultCode::ShardHasMappings => Code::ShardHasMappings,
        StoreResultCode::ShardVersionMismatch => Code::ShardVersionMismatch,
        StoreResultCode::MappingDoesNotExist => Code::MappingDoesNotExist,
        StoreResultCode::MappingRangeAlreadyMapped => Code::MappingRangeAlreadyMapped,
        StoreResultCode::MappingNotFoundForKey => Code::MappingNotFoundForKey,
        StoreResultCode::MappingIsNotOffline => Code::MappingIsNotOffline,
        StoreResultCode::MappingIsOffline => Code::MappingIsOffline,
        StoreResultCode::MappingIsAlreadyLocked => Code::MappingIsAlreadyLocked,
        StoreResultCode::MappingLockOwnerIdDoesNotMatch => Code::MappingLockOwnerIdDoesNotMatch,
        StoreResultCode::StoreVersionMismatch => Code::StoreVersionMismatch,
        StoreResultCode::OperationDoesNotExist => Code::OperationAborted,
        StoreResultCode::Success
        | StoreResultCode::PendingOperation
        | StoreResultCode::UnexpectedError => Code::UnexpectedStoreError,
    };
    Error::shard_management(category, code, operation, format!("store reported {result:?}"))
}

/// Shared execution context handed to every operation instance.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Store transport.
    pub store: Arc<dyn StoreService>,
    /// Client-side cache.
    pub cache: Arc<CacheStore>,
    /// Retry policy for transient faults.
    pub retry: RetryPolicy,
}

// ============================================================================
// Single-tier operations
// ============================================================================

/// A single transactional GSM call wrapped in retry and error
/// translation. Used for reads and for one-step mutations (shard-map
/// create/delete, lock CAS, attach/detach).
#[derive(Debug)]
pub struct GlobalOperation<'a> {
    ctx: &'a OperationContext,
    name: &'static str,
    category: ErrorCategory,
}

impl<'a> GlobalOperation<'a> {
    /// Create a named single-tier operation.
    pub fn new(ctx: &'a OperationContext, name: &'static str, category: ErrorCategory) -> Self {
        Self { ctx, name, category }
    }

    /// Execute with retry; the caller inspects the result code.
    pub async fn execute_raw(
        &self,
        input: GlobalOpInput,
        scope: TransactionScope,
    ) -> Result<StoreResults> {
        let store = self.ctx.store.clone();
        self.ctx
            .retry
            .run(self.name, || {
                let request = StoreRequest::new(input.clone());
                let store = store.clone();
                async move { store.execute_global(request, scope).await }
            })
            .await
    }

    /// Execute with retry, translating any non-success code.
    pub async fn execute(
        &self,
        input: GlobalOpInput,
        scope: TransactionScope,
    ) -> Result<StoreResults> {
        let results = self.execute_raw(input, scope).await?;
        if results.is_success() {
            Ok(results)
        } else {
            Err(management_error(results.result, self.category, self.name))
        }
    }
}

/// A single transactional LSM call wrapped in retry and error
/// translation. Used by recovery to read a shard's local truth.
#[derive(Debug)]
pub struct LocalOperation<'a> {
    ctx: &'a OperationContext,
    name: &'static str,
    category: ErrorCategory,
}

impl<'a> LocalOperation<'a> {
    /// Create a named single-tier local operation.
    pub fn new(ctx: &'a OperationContext, name: &'static str, category: ErrorCategory) -> Self {
        Self { ctx, name, category }
    }

    /// Execute with retry, translating any non-success code.
    pub async fn execute(
        &self,
        location: &ShardLocation,
        input: LocalOpInput,
        scope: TransactionScope,
    ) -> Result<StoreResults> {
        let store = self.ctx.store.clone();
        let results = self
            .ctx
            .retry
            .run(self.name, || {
                let request = StoreRequest::new(input.clone());
                let store = store.clone();
                let location = location.clone();
                async move { store.execute_local(&location, request, scope).await }
            })
            .await?;
        if results.is_success() {
            Ok(results)
        } else {
            Err(management_error(results.result, self.category, self.name))
        }
    }
}

// ============================================================================
// Multi-step operations
// ============================================================================

/// Direction a local delta is derived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Do,
    Undo,
}

/// Derive the LSM calls for one location of an operation, in the given
/// direction. All derived calls are idempotent, so the undo direction can
/// run regardless of whether the forward step actually committed.
fn local_deltas(
    entry: &StoreLogEntry,
    location: &ShardLocation,
    direction: Direction,
) -> Vec<LocalOpInput> {
    let mut inputs = Vec::new();

    let added_shards = entry
        .shards_added
        .iter()
        .filter(|s| &s.location == location);
    // A shard id appearing on both sides is an in-place replace: the LSM
    // row is upserted forward and upserted back on undo, never dropped.
    let replaced = |id: Uuid| {
        entry.shards_added.iter().any(|s| s.id == id)
            && entry.shards_removed.iter().any(|s| s.id == id)
    };
    let removed_shards = entry
        .shards_removed
        .iter()
        .filter(|s| &s.location == location);

    match direction {
        Direction::Do => {
            for shard in added_shards {
                inputs.push(LocalOpInput::AddShard {
                    shard_map: entry.shard_map.clone(),
                    shard: shard.clone(),
                });
            }
            for shard in removed_shards.filter(|s| !replaced(s.id)) {
                inputs.push(LocalOpInput::RemoveShard {
                    shard_map_id: entry.shard_map.id,
                    shard_id: shard.id,
                });
            }
            let remove_ids: Vec<Uuid> = entry
                .mappings_removed_at(location)
                .iter()
                .map(|m| m.id)
                .collect();
            let add = entry.mappings_added_at(location);
            if !remove_ids.is_empty() || !add.is_empty() {
                inputs.push(LocalOpInput::ReplaceMappings {
                    shard_map_id: entry.shard_map.id,
                    remove_ids,
                    add,
                });
            }
        }
        Direction::Undo => {
            let remove_ids: Vec<Uuid> = entry
                .mappings_added_at(location)
                .iter()
                .map(|m| m.id)
                .collect();
            let add = entry.mappings_removed_at(location);
            if !remove_ids.is_empty() || !add.is_empty() {
                inputs.push(LocalOpInput::ReplaceMappings {
                    shard_map_id: entry.shard_map.id,
                    remove_ids,
                    add,
                });
            }
            for shard in added_shards.filter(|s| !replaced(s.id)) {
                inputs.push(LocalOpInput::RemoveShard {
                    shard_map_id: entry.shard_map.id,
                    shard_id: shard.id,
                });
            }
            for shard in removed_shards {
                inputs.push(LocalOpInput::AddShard {
                    shard_map: entry.shard_map.clone(),
                    shard: shard.clone(),
                });
            }
        }
    }
    inputs
}

/// Replay the undo direction of a pending operation found in the log:
/// local deltas reversed (target first), then one GSM transaction that
/// restores the snapshots and deletes the entry. Safe to run repeatedly
/// and from any process.
pub async fn undo_pending(ctx: &OperationContext, entry: &StoreLogEntry) -> Result<()> {
    warn!(
        operation_id = %entry.id,
        code = ?entry.code,
        state = ?entry.state,
        shard_map = %entry.shard_map.name,
        "undoing pending operation"
    );

    let mut locations: Vec<ShardLocation> = Vec::new();
    if let Some(target) = &entry.target {
        locations.push(target.clone());
    }
    if !locations.contains(&entry.source) {
        locations.push(entry.source.clone());
    }

    for location in &locations {
        for input in local_deltas(entry, location, Direction::Undo) {
            let results = ctx
                .retry
                .run("UndoPendingStoreOperations", || {
                    let request = StoreRequest::new(input.clone());
                    let store = ctx.store.clone();
                    let location = location.clone();
                    async move {
                        store
                            .execute_local(&location, request, TransactionScope::ReadWrite)
                            .await
                    }
                })
                .await?;
            if !results.is_success() {
                return Err(management_error(
                    results.result,
                    ErrorCategory::General,
                    "UndoPendingStoreOperations",
                ));
            }
        }
    }

    let results = ctx
        .retry
        .run("UndoPendingStoreOperations", || {
            let request = StoreRequest::new(GlobalOpInput::UndoOperation {
                entry: entry.clone(),
            });
            let store = ctx.store.clone();
            async move {
                store
                    .execute_global(request, TransactionScope::ReadWrite)
                    .await
            }
        })
        .await?;
    if !results.is_success() {
        return Err(management_error(
            results.result,
            ErrorCategory::General,
            "UndoPendingStoreOperations",
        ));
    }

    // Nothing the undone operation touched can be trusted in the cache.
    for mapping in entry.mappings_added.iter().chain(entry.mappings_removed.iter()) {
        ctx.cache.delete_mapping(mapping);
    }

    info!(operation_id = %entry.id, code = ?entry.code, "pending operation undone");
    Ok(())
}

/// The generic multi-step operation driver.
pub struct StoreOperation {
    ctx: OperationContext,
    name: &'static str,
    category: ErrorCategory,
    template: StoreLogEntry,
}

impl StoreOperation {
    /// Create a multi-step operation from its log-entry template. The
    /// driver assigns a fresh operation id per attempt.
    pub fn new(
        ctx: OperationContext,
        name: &'static str,
        category: ErrorCategory,
        template: StoreLogEntry,
    ) -> Self {
        Self {
            ctx,
            name,
            category,
            template,
        }
    }

    /// Execute the full lifecycle, including the undo-then-retry loop for
    /// pending operations left by prior failed attempts.
    pub async fn execute(self) -> Result<StoreResults> {
        loop {
            let mut entry = self.template.clone();
            entry.id = Uuid::new_v4();
            entry.state = StoreOperationState::GlobalBegin;

            debug!(operation = self.name, operation_id = %entry.id, "begin");
            let begin = self
                .global(GlobalOpInput::BeginOperation {
                    entry: entry.clone(),
                })
                .await?;

            if begin.has_pending_operations() {
                for pending in &begin.log_entries {
                    undo_pending(&self.ctx, pending).await?;
                }
                continue;
            }

            // Never trust cached state across a commit attempt.
            self.update_cache_pre(&entry);

            if !begin.is_success() {
                return Err(management_error(begin.result, self.category, self.name));
            }

            self.run_local(&entry, &entry.source).await?;
            self.advance(&entry, StoreOperationState::LocalSourceDone)
                .await?;

            if let Some(target) = entry.target.clone() {
                self.run_local(&entry, &target).await?;
                self.advance(&entry, StoreOperationState::LocalTargetDone)
                    .await?;
            }

            let end = self
                .global(GlobalOpInput::EndOperation {
                    operation_id: entry.id,
                })
                .await?;
            if !end.is_success() {
                return Err(management_error(end.result, self.category, self.name));
            }

            self.update_cache_post(&entry, &begin);
            info!(operation = self.name, operation_id = %entry.id, "committed");
            return Ok(begin);
        }
    }

    async fn global(&self, input: GlobalOpInput) -> Result<StoreResults> {
        let store = self.ctx.store.clone();
        self.ctx
            .retry
            .run(self.name, || {
                let request = StoreRequest::new(input.clone());
                let store = store.clone();
                async move {
                    store
                        .execute_global(request, TransactionScope::ReadWrite)
                        .await
                }
            })
            .await
    }

    async fn run_local(&self, entry: &StoreLogEntry, location: &ShardLocation) -> Result<()> {
        for input in local_deltas(entry, location, Direction::Do) {
            let store = self.ctx.store.clone();
            let results = self
                .ctx
                .retry
                .run(self.name, || {
                    let request = StoreRequest::new(input.clone());
                    let store = store.clone();
                    let location = location.clone();
                    async move {
                        store
                            .execute_local(&location, request, TransactionScope::ReadWrite)
                            .await
                    }
                })
                .await?;
            if !results.is_success() {
                return Err(management_error(results.result, self.category, self.name));
            }
        }
        Ok(())
    }

    async fn advance(&self, entry: &StoreLogEntry, state: StoreOperationState) -> Result<()> {
        let results = self
            .global(GlobalOpInput::AdvanceOperation {
                operation_id: entry.id,
                state,
            })
            .await?;
        if !results.is_success() {
            return Err(management_error(results.result, self.category, self.name));
        }
        Ok(())
    }

    fn update_cache_pre(&self, entry: &StoreLogEntry) {
        for mapping in entry
            .mappings_removed
            .iter()
            .chain(entry.mappings_added.iter())
        {
            self.ctx.cache.delete_mapping(mapping);
        }
    }

    fn update_cache_post(&self, entry: &StoreLogEntry, begin: &StoreResults) {
        for mapping in &entry.mappings_added {
            let shard = begin
                .shards
                .iter()
                .find(|s| s.id == mapping.shard_id)
                .or_else(|| {
                    entry
                        .shards_involved
                        .iter()
                        .chain(entry.shards_added.iter())
                        .find(|s| s.id == mapping.shard_id)
                });
            if let Some(shard) = shard {
                self.ctx
                    .cache
                    .add_or_update_mapping(mapping, shard, CacheStorePolicy::OverwriteExisting);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ShardKey, ShardKeyType, ShardRange};
    use crate::store::{StoreMapping, StoreOperationCode, StoreShard, StoreShardMap};
    use crate::types::ShardMapKind;

    fn entry_with_move() -> StoreLogEntry {
        let map = StoreShardMap::new("m", ShardMapKind::Range, ShardKeyType::Int32);
        let source = StoreShard::new(map.id, ShardLocation::new("s0", "db0"));
        let target = StoreShard::new(map.id, ShardLocation::new("s1", "db1"));
        let range = ShardRange::new(ShardKey::from_i32(0), ShardKey::from_i32(10)).unwrap();
        let old = StoreMapping::new(map.id, range.clone(), source.id);
        let mut new = StoreMapping::new(map.id, range, target.id);
        new.id = old.id;
        StoreLogEntry {
            id: Uuid::new_v4(),
            code: StoreOperationCode::MoveMapping,
            state: StoreOperationState::GlobalBegin,
            shard_map: map,
            source: source.location.clone(),
            target: Some(target.location.clone()),
            shards_involved: vec![source, target],
            shards_added: vec![],
            shards_removed: vec![],
            mappings_added: vec![new],
            mappings_removed: vec![old],
            lock_claims: vec![],
        }
    }

    #[test]
    fn move_deltas_touch_both_locations() {
        let entry = entry_with_move();
        let target = entry.target.clone().unwrap();

        let source_do = local_deltas(&entry, &entry.source, Direction::Do);
        assert_eq!(source_do.len(), 1);
        match &source_do[0] {
            LocalOpInput::ReplaceMappings { remove_ids, add, .. } => {
                assert_eq!(remove_ids.len(), 1);
                assert!(add.is_empty());
            }
            other => panic!("unexpected delta {other:?}"),
        }

        let target_do = local_deltas(&entry, &target, Direction::Do);
        assert_eq!(target_do.len(), 1);
        match &target_do[0] {
            LocalOpInput::ReplaceMappings { remove_ids, add, .. } => {
                assert!(remove_ids.is_empty());
                assert_eq!(add.len(), 1);
            }
            other => panic!("unexpected delta {other:?}"),
        }
    }

    #[test]
    fn undo_deltas_invert_do_deltas() {
        let entry = entry_with_move();
        let target = entry.target.clone().unwrap();

        let source_undo = local_deltas(&entry, &entry.source, Direction::Undo);
        match &source_undo[0] {
            LocalOpInput::ReplaceMappings { remove_ids, add, .. } => {
                assert!(remove_ids.is_empty());
                assert_eq!(add.len(), 1, "undo restores the removed source row");
            }
            other => panic!("unexpected delta {other:?}"),
        }

        let target_undo = local_deltas(&entry, &target, Direction::Undo);
        match &target_undo[0] {
            LocalOpInput::ReplaceMappings { remove_ids, add, .. } => {
                assert_eq!(remove_ids.len(), 1, "undo drops the row added at the target");
                assert!(add.is_empty());
            }
            other => panic!("unexpected delta {other:?}"),
        }
    }

    #[test]
    fn add_shard_deltas_carry_map_metadata() {
        let map = StoreShardMap::new("m", ShardMapKind::List, ShardKeyType::Int64);
        let shard = StoreShard::new(map.id, ShardLocation::new("s0", "db0"));
        let entry = StoreLogEntry {
            id: Uuid::new_v4(),
            code: StoreOperationCode::AddShard,
            state: StoreOperationState::GlobalBegin,
            shard_map: map.clone(),
            source: shard.location.clone(),
            target: None,
            shards_involved: vec![],
            shards_added: vec![shard.clone()],
            shards_removed: vec![],
            mappings_added: vec![],
            mappings_removed: vec![],
            lock_claims: vec![],
        };
        let deltas = local_deltas(&entry, &entry.source, Direction::Do);
        assert_eq!(deltas.len(), 1);
        match &deltas[0] {
            LocalOpInput::AddShard { shard_map, shard: s } => {
                assert_eq!(shard_map.id, map.id);
                assert_eq!(s.id, shard.id);
            }
            other => panic!("unexpected delta {other:?}"),
        }
        let undo = local_deltas(&entry, &entry.source, Direction::Undo);
        assert!(matches!(undo[0], LocalOpInput::RemoveShard { .. }));
    }
}
