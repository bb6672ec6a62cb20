//! Recovery manager: detect and repair divergence between the GSM and a
//! shard's LSM.
//!
//! Two failure classes meet here. Known partial operations are replayed
//! through the pending-operations log before anything else runs. Anything
//! left after that is *detectable* divergence: rows present on one side
//! only, or present on both with disagreeing boundaries or targets. Those
//! are reported as opaque [`RecoveryToken`]s and repaired one shard map at
//! a time, never under a system-wide lock.

use crate::error::{Error, ErrorCategory, Result};
use crate::key::{ShardKey, ShardRange};
use crate::operations::{
    undo_pending, GlobalOperation, LocalOperation, OperationContext, StoreOperation,
};
use crate::store::{
    GlobalOpInput, LocalOpInput, StoreLogEntry, StoreMapping, StoreOperationCode,
    StoreOperationState, StoreResultCode, StoreShard, StoreShardMap, TransactionScope,
};
use crate::types::ShardLocation;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

/// Opaque handle over one detected discrepancy set (one shard map at one
/// location).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecoveryToken(Uuid);

impl RecoveryToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RecoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which side of the two-tier store holds a diverged range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingLocation {
    /// Only the GSM maps the range.
    GlobalOnly,
    /// Only the LSM maps the range.
    LocalOnly,
    /// Both sides map the range but disagree on the row.
    Both,
}

/// How to repair a discrepancy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingDifferenceResolution {
    /// The GSM wins: rebuild the LSM from the global rows.
    KeepGlobalMapping,
    /// The LSM wins: rebuild the GSM from the local rows.
    KeepLocalMapping,
}

#[derive(Debug)]
struct DifferenceSet {
    shard_map: StoreShardMap,
    location: ShardLocation,
    /// The GSM shard row, when the shard is registered globally.
    global_shard: Option<StoreShard>,
    global_mappings: Vec<StoreMapping>,
    local_mappings: Vec<StoreMapping>,
    differences: BTreeMap<ShardRange, MappingLocation>,
}

/// Detects and repairs GSM/LSM divergence for one store.
///
/// Obtained from
/// [`ShardMapManager::recovery_manager`](crate::ShardMapManager::recovery_manager);
/// shares the manager's store, cache and retry policy.
#[derive(Debug)]
pub struct RecoveryManager {
    ctx: OperationContext,
    tokens: RwLock<BTreeMap<Uuid, DifferenceSet>>,
}

impl RecoveryManager {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self {
            ctx,
            tokens: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replay the undo direction of every pending log entry. Divergence
    /// detection must not run against a store with in-flight operations.
    async fn resolve_pending_operations(&self) -> Result<()> {
        let op = GlobalOperation::new(&self.ctx, "GetOperationLog", ErrorCategory::Recovery);
        let results = op
            .execute(
                GlobalOpInput::GetOperationLog { shard_map_id: None },
                TransactionScope::ReadOnly,
            )
            .await?;
        for entry in &results.log_entries {
            warn!(operation_id = %entry.id, "resolving leftover pending operation");
            undo_pending(&self.ctx, entry).await?;
        }
        Ok(())
    }

    /// Compare the LSM at `location` against the GSM and return one token
    /// per shard map present at the location on either side, each covering
    /// that map's discrepancies (possibly none).
    pub async fn detect_mapping_differences(
        &self,
        location: &ShardLocation,
    ) -> Result<Vec<RecoveryToken>> {
        self.resolve_pending_operations().await?;

        let local = LocalOperation::new(&self.ctx, "DetectMappingDifferences", ErrorCategory::Recovery);
        let mut shard_maps = local
            .execute(location, LocalOpInput::GetAllShardMaps, TransactionScope::ReadOnly)
            .await?
            .shard_maps;

        // A wiped store lists nothing locally; GSM maps with a shard
        // registered at the location still need a token so their rows
        // surface as GlobalOnly.
        let global = GlobalOperation::new(&self.ctx, "DetectMappingDifferences", ErrorCategory::Recovery);
        let global_maps = global
            .execute(GlobalOpInput::GetAllShardMaps, TransactionScope::ReadOnly)
            .await?
            .shard_maps;
        for shard_map in global_maps {
            if shard_maps.iter().any(|m| m.id == shard_map.id) {
                continue;
            }
            let results = global
                .execute_raw(
                    GlobalOpInput::FindShardByLocation {
                        shard_map_id: shard_map.id,
                        location: location.clone(),
                    },
                    TransactionScope::ReadOnly,
                )
                .await?;
            match results.result {
                StoreResultCode::Success => shard_maps.push(shard_map),
                StoreResultCode::ShardDoesNotExist | StoreResultCode::ShardMapDoesNotExist => {}
                other => {
                    return Err(crate::operations::management_error(
                        other,
                        ErrorCategory::Recovery,
                        "DetectMappingDifferences",
                    ))
                }
            }
        }

        let mut tokens = Vec::with_capacity(shard_maps.len());
        for shard_map in shard_maps {
            let set = self.diff_shard_map(shard_map, location).await?;
            let token = RecoveryToken::new();
            info!(
                %token,
                shard_map = set.shard_map.name,
                location = %location,
                differences = set.differences.len(),
                "mapping differences detected"
            );
            self.tokens.write().insert(token.0, set);
            tokens.push(token);
        }
        Ok(tokens)
    }

    async fn diff_shard_map(
        &self,
        shard_map: StoreShardMap,
        location: &ShardLocation,
    ) -> Result<DifferenceSet> {
        let local = LocalOperation::new(&self.ctx, "DetectMappingDifferences", ErrorCategory::Recovery);
        let local_results = local
            .execute(
                location,
                LocalOpInput::GetMappings {
                    shard_map_id: shard_map.id,
                    shard_id: None,
                },
                TransactionScope::ReadOnly,
            )
            .await?;
        let local_mappings = local_results.mappings;

        let global = GlobalOperation::new(&self.ctx, "DetectMappingDifferences", ErrorCategory::Recovery);
        let shard_results = global
            .execute_raw(
                GlobalOpInput::FindShardByLocation {
                    shard_map_id: shard_map.id,
                    location: location.clone(),
                },
                TransactionScope::ReadOnly,
            )
            .await?;
        let global_shard = match shard_results.result {
            StoreResultCode::Success => shard_results.shards.into_iter().next(),
            StoreResultCode::ShardDoesNotExist | StoreResultCode::ShardMapDoesNotExist => None,
            other => {
                return Err(crate::operations::management_error(
                    other,
                    ErrorCategory::Recovery,
                    "DetectMappingDifferences",
                ))
            }
        };

        let global_mappings = match &global_shard {
            Some(shard) => {
                global
                    .execute(
                        GlobalOpInput::GetAllMappings {
                            shard_map_id: shard_map.id,
                            shard_id: Some(shard.id),
                            range: None,
                        },
                        TransactionScope::ReadOnly,
                    )
                    .await?
                    .mappings
            }
            None => Vec::new(),
        };

        let differences = boundary_sweep(&global_mappings, &local_mappings);
        Ok(DifferenceSet {
            shard_map,
            location: location.clone(),
            global_shard,
            global_mappings,
            local_mappings,
            differences,
        })
    }

    /// The diverged ranges behind a token, keyed by range.
    pub fn get_mapping_differences(
        &self,
        token: RecoveryToken,
    ) -> Result<BTreeMap<ShardRange, MappingLocation>> {
        self.tokens
            .read()
            .get(&token.0)
            .map(|set| set.differences.clone())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown recovery token {token}")))
    }

    /// Repair the discrepancy set behind a token, consuming the token.
    pub async fn resolve_mapping_differences(
        &self,
        token: RecoveryToken,
        resolution: MappingDifferenceResolution,
    ) -> Result<()> {
        let set = self
            .tokens
            .write()
            .remove(&token.0)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown recovery token {token}")))?;
        if set.differences.is_empty() {
            return Ok(());
        }
        info!(
            %token,
            shard_map = set.shard_map.name,
            location = %set.location,
            ?resolution,
            "resolving mapping differences"
        );
        match resolution {
            MappingDifferenceResolution::KeepGlobalMapping => self.rebuild_local(&set).await,
            MappingDifferenceResolution::KeepLocalMapping => self.rebuild_global(&set).await,
        }
    }

    /// The GSM wins: one local transaction replaces the LSM's mapping
    /// rows with the global ones.
    async fn rebuild_local(&self, set: &DifferenceSet) -> Result<()> {
        let local = LocalOperation::new(&self.ctx, "ResolveMappingDifferences", ErrorCategory::Recovery);
        local
            .execute(
                &set.location,
                LocalOpInput::ReplaceMappings {
                    shard_map_id: set.shard_map.id,
                    remove_ids: set.local_mappings.iter().map(|m| m.id).collect(),
                    add: set.global_mappings.clone(),
                },
                TransactionScope::ReadWrite,
            )
            .await?;
        Ok(())
    }

    /// The LSM wins: a two-step replacement operation swaps the shard's
    /// GSM rows for the local ones, logged and undoable like any other
    /// mutation.
    async fn rebuild_global(&self, set: &DifferenceSet) -> Result<()> {
        let shard = set.global_shard.clone().ok_or_else(|| {
            Error::shard_management(
                ErrorCategory::Recovery,
                crate::error::ShardManagementErrorCode::ShardDoesNotExist,
                "ResolveMappingDifferences",
                format!(
                    "shard at {} is not registered in the GSM; attach it first",
                    set.location
                ),
            )
        })?;

        let replacements: Vec<StoreMapping> = set
            .local_mappings
            .iter()
            .cloned()
            .map(|mut m| {
                m.shard_id = shard.id;
                m
            })
            .collect();

        let entry = StoreLogEntry {
            id: Uuid::nil(),
            code: StoreOperationCode::ReplaceMappings,
            state: StoreOperationState::GlobalBegin,
            shard_map: set.shard_map.clone(),
            source: set.location.clone(),
            target: None,
            shards_involved: vec![shard],
            shards_added: vec![],
            shards_removed: vec![],
            mappings_added: replacements,
            mappings_removed: set.global_mappings.clone(),
            lock_claims: vec![],
        };
        StoreOperation::new(
            self.ctx.clone(),
            "ResolveMappingDifferences",
            ErrorCategory::Recovery,
            entry,
        )
        .execute()
        .await?;
        Ok(())
    }

    /// Register an orphaned shard's metadata in the GSM from what its LSM
    /// says about itself, without moving any data. The shard maps it
    /// mirrors are upserted too.
    pub async fn attach_shard(&self, location: &ShardLocation) -> Result<()> {
        let local = LocalOperation::new(&self.ctx, "AttachShard", ErrorCategory::Recovery);
        let local_maps = local
            .execute(location, LocalOpInput::GetAllShardMaps, TransactionScope::ReadOnly)
            .await?
            .shard_maps;
        if local_maps.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "no shard map metadata found on the store at {location}"
            )));
        }

        let global = GlobalOperation::new(&self.ctx, "AttachShard", ErrorCategory::Recovery);
        for shard_map in local_maps {
            let rows = local
                .execute(
                    location,
                    LocalOpInput::GetMappings {
                        shard_map_id: shard_map.id,
                        shard_id: None,
                    },
                    TransactionScope::ReadOnly,
                )
                .await?;
            let Some(shard) = rows
                .shards
                .into_iter()
                .find(|s| s.shard_map_id == shard_map.id && &s.location == location)
            else {
                continue;
            };
            info!(shard_map = shard_map.name, location = %location, "attaching shard");
            global
                .execute(
                    GlobalOpInput::AttachShard {
                        shard_map: shard_map.clone(),
                        shard,
                    },
                    TransactionScope::ReadWrite,
                )
                .await?;
        }
        Ok(())
    }

    /// Remove a shard's rows from the GSM without touching the store at
    /// the location. The inverse of [`attach_shard`](Self::attach_shard).
    pub async fn detach_shard(&self, location: &ShardLocation) -> Result<()> {
        let global = GlobalOperation::new(&self.ctx, "DetachShard", ErrorCategory::Recovery);
        let maps = global
            .execute(GlobalOpInput::GetAllShardMaps, TransactionScope::ReadOnly)
            .await?
            .shard_maps;
        for shard_map in maps {
            let results = global
                .execute_raw(
                    GlobalOpInput::DetachShard {
                        shard_map_id: shard_map.id,
                        location: location.clone(),
                    },
                    TransactionScope::ReadWrite,
                )
                .await?;
            match results.result {
                StoreResultCode::Success => {
                    info!(shard_map = shard_map.name, location = %location, "shard detached");
                    self.ctx.cache.delete_shard_map(shard_map.id);
                }
                StoreResultCode::ShardDoesNotExist => {}
                other => {
                    return Err(crate::operations::management_error(
                        other,
                        ErrorCategory::Recovery,
                        "DetachShard",
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Sweep both mapping sets across their combined range boundaries and tag
/// every elementary interval where the sides disagree.
fn boundary_sweep(
    global: &[StoreMapping],
    local: &[StoreMapping],
) -> BTreeMap<ShardRange, MappingLocation> {
    let mut bounds: Vec<ShardKey> = Vec::new();
    for mapping in global.iter().chain(local.iter()) {
        bounds.push(mapping.range.low().clone());
        bounds.push(mapping.range.high().clone());
    }
    bounds.sort();
    bounds.dedup();

    let covering = |set: &[StoreMapping], key: &ShardKey| -> Option<StoreMapping> {
        set.iter().find(|m| m.range.contains(key)).cloned()
    };

    let mut differences = BTreeMap::new();
    for window in bounds.windows(2) {
        let (low, high) = (&window[0], &window[1]);
        let g = covering(global, low);
        let l = covering(local, low);
        let location = match (&g, &l) {
            (None, None) => continue,
            (Some(_), None) => MappingLocation::GlobalOnly,
            (None, Some(_)) => MappingLocation::LocalOnly,
            (Some(g), Some(l)) => {
                if g.id == l.id && g.range == l.range && g.status == l.status {
                    continue;
                }
                MappingLocation::Both
            }
        };
        // Half-open elementary interval between consecutive boundaries.
        if let Ok(range) = ShardRange::new(low.clone(), high.clone()) {
            differences.insert(range, location);
        }
    }
    differences
}
