//! Store wrappers for failure injection and call counting.
//!
//! [`FaultInjectingStore`] fails selected store calls to simulate crashes
//! and flaky transports at exact protocol steps; [`CountingStore`] counts
//! calls per operation kind to assert cache behavior. Both wrap any
//! [`StoreService`] and stay transparent otherwise.

use crate::error::{Error, Result};
use crate::store::{
    GlobalOpInput, LocalOpInput, StoreRequest, StoreResults, StoreService, TransactionScope,
};
use crate::types::ShardLocation;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Stable name for a global operation kind, used to target faults.
pub fn global_kind(input: &GlobalOpInput) -> &'static str {
    match input {
        GlobalOpInput::AddShardMap(_) => "AddShardMap",
        GlobalOpInput::RemoveShardMap { .. } => "RemoveShardMap",
        GlobalOpInput::GetAllShardMaps => "GetAllShardMaps",
        GlobalOpInput::FindShardMapByName { .. } => "FindShardMapByName",
        GlobalOpInput::GetAllShards { .. } => "GetAllShards",
        GlobalOpInput::FindShardByLocation { .. } => "FindShardByLocation",
        GlobalOpInput::GetAllMappings { .. } => "GetAllMappings",
        GlobalOpInput::FindMappingByKey { .. } => "FindMappingByKey",
        GlobalOpInput::FindMappingById { .. } => "FindMappingById",
        GlobalOpInput::LockOrUnlockMappings { .. } => "LockOrUnlockMappings",
        GlobalOpInput::AttachShard { .. } => "AttachShard",
        GlobalOpInput::DetachShard { .. } => "DetachShard",
        GlobalOpInput::GetOperationLog { .. } => "GetOperationLog",
        GlobalOpInput::BeginOperation { .. } => "BeginOperation",
        GlobalOpInput::AdvanceOperation { .. } => "AdvanceOperation",
        GlobalOpInput::EndOperation { .. } => "EndOperation",
        GlobalOpInput::UndoOperation { .. } => "UndoOperation",
    }
}

/// Stable name for a local operation kind.
pub fn local_kind(input: &LocalOpInput) -> &'static str {
    match input {
        LocalOpInput::AddShard { .. } => "AddShard",
        LocalOpInput::RemoveShard { .. } => "RemoveShard",
        LocalOpInput::ReplaceMappings { .. } => "ReplaceMappings",
        LocalOpInput::GetAllShardMaps => "GetAllShardMaps",
        LocalOpInput::GetMappings { .. } => "GetMappings",
    }
}

/// How an injected fault surfaces to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A retryable transport fault (deadlock, timeout).
    Transient,
    /// A terminal fault: the call never reaches the store, simulating a
    /// crash at that protocol step.
    Terminal,
}

#[derive(Debug)]
struct Fault {
    kind: FaultKind,
    remaining: u32,
}

/// Wraps a store and fails selected calls.
#[derive(Debug)]
pub struct FaultInjectingStore {
    inner: Arc<dyn StoreService>,
    global_faults: Mutex<HashMap<&'static str, Fault>>,
    local_faults: Mutex<HashMap<&'static str, Fault>>,
}

impl FaultInjectingStore {
    /// Wrap a store with no faults armed.
    pub fn new(inner: Arc<dyn StoreService>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            global_faults: Mutex::new(HashMap::new()),
            local_faults: Mutex::new(HashMap::new()),
        })
    }

    /// Fail the next `times` global calls of the given kind.
    pub fn fail_global(&self, kind_name: &'static str, kind: FaultKind, times: u32) {
        self.global_faults.lock().insert(
            kind_name,
            Fault {
                kind,
                remaining: times,
            },
        );
    }

    /// Fail the next `times` local calls of the given kind.
    pub fn fail_local(&self, kind_name: &'static str, kind: FaultKind, times: u32) {
        self.local_faults.lock().insert(
            kind_name,
            Fault {
                kind,
                remaining: times,
            },
        );
    }

    /// Disarm every remaining fault.
    pub fn clear(&self) {
        self.global_faults.lock().clear();
        self.local_faults.lock().clear();
    }

    fn trip(faults: &Mutex<HashMap<&'static str, Fault>>, kind_name: &str) -> Option<Error> {
        let mut faults = faults.lock();
        let fault = faults.get_mut(kind_name)?;
        if fault.remaining == 0 {
            return None;
        }
        fault.remaining -= 1;
        Some(match fault.kind {
            FaultKind::Transient => {
                Error::Transient(format!("injected transient fault on {kind_name}"))
            }
            FaultKind::Terminal => Error::Store(format!("injected crash on {kind_name}")),
        })
    }
}

#[async_trait]
impl StoreService for FaultInjectingStore {
    async fn execute_global(
        &self,
        request: StoreRequest<GlobalOpInput>,
        scope: TransactionScope,
    ) -> Result<StoreResults> {
        if let Some(err) = Self::trip(&self.global_faults, global_kind(&request.input)) {
            return Err(err);
        }
        self.inner.execute_global(request, scope).await
    }

    async fn execute_local(
        &self,
        location: &ShardLocation,
        request: StoreRequest<LocalOpInput>,
        scope: TransactionScope,
    ) -> Result<StoreResults> {
        if let Some(err) = Self::trip(&self.local_faults, local_kind(&request.input)) {
            return Err(err);
        }
        self.inner.execute_local(location, request, scope).await
    }
}

/// Wraps a store and counts calls per operation kind.
#[derive(Debug)]
pub struct CountingStore {
    inner: Arc<dyn StoreService>,
    global_counts: Mutex<HashMap<&'static str, u64>>,
    local_counts: Mutex<HashMap<&'static str, u64>>,
}

impl CountingStore {
    /// Wrap a store with all counters at zero.
    pub fn new(inner: Arc<dyn StoreService>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            global_counts: Mutex::new(HashMap::new()),
            local_counts: Mutex::new(HashMap::new()),
        })
    }

    /// Number of global calls of the given kind so far.
    pub fn global_count(&self, kind_name: &str) -> u64 {
        self.global_counts.lock().get(kind_name).copied().unwrap_or(0)
    }

    /// Number of local calls of the given kind so far.
    pub fn local_count(&self, kind_name: &str) -> u64 {
        self.local_counts.lock().get(kind_name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StoreService for CountingStore {
    async fn execute_global(
        &self,
        request: StoreRequest<GlobalOpInput>,
        scope: TransactionScope,
    ) -> Result<StoreResults> {
        *self
            .global_counts
            .lock()
            .entry(global_kind(&request.input))
            .or_insert(0) += 1;
        self.inner.execute_global(request, scope).await
    }

    async fn execute_local(
        &self,
        location: &ShardLocation,
        request: StoreRequest<LocalOpInput>,
        scope: TransactionScope,
    ) -> Result<StoreResults> {
        *self
            .local_counts
            .lock()
            .entry(local_kind(&request.input))
            .or_insert(0) += 1;
        self.inner.execute_local(location, request, scope).await
    }
}
