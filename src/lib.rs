//! Client-side shard-map management over a two-tier metadata store.
//!
//! This crate maps key ranges (or single point keys) onto physical data
//! sources and keeps that assignment consistent across failures, using:
//! - **A two-tier store protocol**: one authoritative Global Shard Map
//!   store (GSM) plus a Local Shard Map store (LSM) mirrored onto each
//!   shard, reconciled through a pending-operations log
//! - **Multi-step crash-recoverable operations**: every mutation is
//!   logged before it runs, checkpointed per store it touches, and
//!   undone idempotently by the next caller if it dies part-way
//! - **A read-through TTL cache** so routing lookups almost never pay a
//!   store round-trip
//!
//! # Features
//!
//! - Range and list (point) shard maps over typed, byte-ordered keys
//! - Split, merge and move of mappings with advisory lock tokens
//! - Optimistic concurrency via per-shard version CAS
//! - Data-dependent routing (`route_for_key`) that refuses offline
//!   mappings
//! - A recovery manager that detects and repairs GSM/LSM divergence
//!
//! # Example
//!
//! ```rust,no_run
//! use shardmap::{
//!     MemoryStoreService, ShardKey, ShardKeyType, ShardLocation, ShardMapManager, ShardRange,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ShardMapManager::with_defaults(Arc::new(MemoryStoreService::new()));
//!
//!     // One shard map, two shards.
//!     let orders = manager.create_range_shard_map("orders", ShardKeyType::Int64).await?;
//!     let shard0 = orders.shard_map().create_shard(ShardLocation::new("srv0", "orders0")).await?;
//!
//!     // Map a key range and route through it.
//!     let range = ShardRange::new(ShardKey::from_i64(0), ShardKey::from_i64(1000))?;
//!     orders.create_range_mapping(range, &shard0).await?;
//!     let location = orders.route_for_key(&ShardKey::from_i64(42)).await?;
//!     println!("open a connection to {location}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             Application Layer               │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │    ShardMapManager / Range|ListShardMap     │
//! │  • create/split/merge/move mappings         │
//! │  • route_for_key(key) -> ShardLocation      │
//! └─────────────────────────────────────────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐   ┌──────────────────────┐
//! │  CacheStore     │   │  Operation driver    │
//! │  TTL mappings   │   │  log → GSM → LSMs    │
//! └─────────────────┘   └──────────────────────┘
//!                                  │
//!                     ┌────────────┼────────────┐
//!                     ▼            ▼            ▼
//!                ┌────────┐   ┌────────┐   ┌────────┐
//!                │  GSM   │   │ LSM s0 │   │ LSM s1 │
//!                └────────┘   └────────┘   └────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Mutations**: serialized per shard map through the GSM's
//!   pending-operations log; conflicting concurrent writers lose a
//!   shard-version CAS instead of corrupting state
//! - **Routing reads**: served from the local cache within its TTL, so
//!   they may briefly trail the GSM; every mutation evicts the entries
//!   it touches before committing
//! - **Crash recovery**: a mutation that dies mid-flight is undone by
//!   the next operation on the same shard map, in any process
//!
//! # Recovery
//!
//! Divergence between the GSM and a shard's LSM (restored backups,
//! manual edits) is repaired explicitly:
//!
//! ```rust,ignore
//! use shardmap::recovery::MappingDifferenceResolution;
//!
//! let recovery = manager.recovery_manager();
//! for token in recovery.detect_mapping_differences(&location).await? {
//!     recovery
//!         .resolve_mapping_differences(token, MappingDifferenceResolution::KeepGlobalMapping)
//!         .await?;
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod manager;
pub mod operations;
pub mod recovery;
pub mod shard_map;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{CacheTtlConfig, RetryConfig, ShardMapManagerConfig};
pub use error::{Error, ErrorCategory, Result, ShardManagementErrorCode};
pub use key::{ShardKey, ShardKeyType, ShardRange};
pub use manager::ShardMapManager;
pub use shard_map::{ListShardMap, Mapping, MappingUpdate, RangeShardMap, Shard, ShardMap};
pub use types::{LockOwnerId, MappingStatus, ShardLocation, ShardMapKind, ShardStatus};

// Re-export the store seam and its reference implementation
pub use store::{MemoryStoreService, StoreService};

// Re-export recovery types
pub use recovery::{
    MappingDifferenceResolution, MappingLocation, RecoveryManager, RecoveryToken,
};

// Re-export testing types
pub use testing::{CountingStore, FaultInjectingStore, FaultKind};
