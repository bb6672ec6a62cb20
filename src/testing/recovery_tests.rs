//! Integration tests for GSM/LSM divergence detection and repair, and
//! for attaching and detaching orphaned shards.

#[cfg(test)]
mod tests {
    use crate::key::{ShardKey, ShardRange};
    use crate::recovery::{MappingDifferenceResolution, MappingLocation};
    use crate::store::{
        GlobalOpInput, LocalOpInput, MemoryStoreService, StoreLogEntry, StoreMapping,
        StoreOperationCode, StoreOperationState, StoreRequest, StoreService, StoreShard,
        TransactionScope,
    };
    use crate::testing::fault::{FaultInjectingStore, FaultKind};
    use crate::testing::utils::{init_tracing, loc, manager_over, range_map_with_shards};
    use std::sync::Arc;

    fn range(low: i32, high: i32) -> ShardRange {
        ShardRange::new(ShardKey::from_i32(low), ShardKey::from_i32(high)).unwrap()
    }

    async fn tamper_local(
        store: &Arc<dyn StoreService>,
        db: &str,
        shard_map_id: uuid::Uuid,
        remove_ids: Vec<uuid::Uuid>,
        add: Vec<StoreMapping>,
    ) {
        store
            .execute_local(
                &loc(db),
                StoreRequest::new(LocalOpInput::ReplaceMappings {
                    shard_map_id,
                    remove_ids,
                    add,
                }),
                TransactionScope::ReadWrite,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lost_local_row_is_detected_and_rebuilt_from_global() {
        init_tracing();
        let smm = manager_over(Arc::new(MemoryStoreService::new()));
        let (map, shards) = range_map_with_shards(&smm, "orders", &["db0"]).await;
        let m1 = map.create_range_mapping(range(0, 10), &shards[0]).await.unwrap();
        let shard = map.shard_map().get_shard(&loc("db0")).await.unwrap();
        map.create_range_mapping(range(10, 20), &shard).await.unwrap();

        // The LSM loses one row behind the protocol's back.
        let store = smm.context().store.clone();
        tamper_local(&store, "db0", map.shard_map().id(), vec![m1.id()], vec![]).await;

        let recovery = smm.recovery_manager();
        let tokens = recovery.detect_mapping_differences(&loc("db0")).await.unwrap();
        assert_eq!(tokens.len(), 1);
        let diffs = recovery.get_mapping_differences(tokens[0]).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs.get(&range(0, 10)), Some(&MappingLocation::GlobalOnly));

        recovery
            .resolve_mapping_differences(tokens[0], MappingDifferenceResolution::KeepGlobalMapping)
            .await
            .unwrap();

        // Consumed tokens are gone; a fresh detection finds nothing.
        assert!(recovery.get_mapping_differences(tokens[0]).is_err());
        let tokens = recovery.detect_mapping_differences(&loc("db0")).await.unwrap();
        assert!(recovery.get_mapping_differences(tokens[0]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_truth_can_rebuild_the_global_side() {
        init_tracing();
        let smm = manager_over(Arc::new(MemoryStoreService::new()));
        let (map, shards) = range_map_with_shards(&smm, "orders", &["db0"]).await;
        let m1 = map.create_range_mapping(range(0, 10), &shards[0]).await.unwrap();

        // The LSM holds a wider row than the GSM knows about.
        let mut widened = StoreMapping::new(
            map.shard_map().id(),
            range(0, 30),
            m1.shard().id(),
        );
        widened.status = crate::types::MappingStatus::Online;
        let store = smm.context().store.clone();
        tamper_local(
            &store,
            "db0",
            map.shard_map().id(),
            vec![m1.id()],
            vec![widened],
        )
        .await;

        let recovery = smm.recovery_manager();
        let tokens = recovery.detect_mapping_differences(&loc("db0")).await.unwrap();
        let diffs = recovery.get_mapping_differences(tokens[0]).unwrap();
        assert_eq!(diffs.get(&range(0, 10)), Some(&MappingLocation::Both));
        assert_eq!(diffs.get(&range(10, 30)), Some(&MappingLocation::LocalOnly));

        recovery
            .resolve_mapping_differences(tokens[0], MappingDifferenceResolution::KeepLocalMapping)
            .await
            .unwrap();

        assert_eq!(
            map.route_for_key(&ShardKey::from_i32(25)).await.unwrap(),
            loc("db0")
        );
        let tokens = recovery.detect_mapping_differences(&loc("db0")).await.unwrap();
        assert!(recovery.get_mapping_differences(tokens[0]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn detection_drains_leftover_pending_operations() {
        init_tracing();
        let backing = Arc::new(MemoryStoreService::new());
        let faulty = FaultInjectingStore::new(backing);
        let smm = manager_over(faulty.clone());
        let (map, shards) = range_map_with_shards(&smm, "orders", &["db0"]).await;

        faulty.fail_global("EndOperation", FaultKind::Terminal, 1);
        map.create_range_mapping(range(0, 10), &shards[0]).await.unwrap_err();

        let recovery = smm.recovery_manager();
        let tokens = recovery.detect_mapping_differences(&loc("db0")).await.unwrap();
        // The interrupted operation was undone before diffing, so both
        // sides agree again.
        assert!(recovery.get_mapping_differences(tokens[0]).unwrap().is_empty());
        assert!(map
            .try_get_mapping_for_key(&ShardKey::from_i32(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn wiped_local_store_still_surfaces_global_rows() {
        init_tracing();
        let smm = manager_over(Arc::new(MemoryStoreService::new()));
        let (_, _) = range_map_with_shards(&smm, "orders", &["db0"]).await;
        let store = smm.context().store.clone();

        let row = store
            .execute_global(
                StoreRequest::new(GlobalOpInput::FindShardMapByName {
                    name: "orders".into(),
                }),
                TransactionScope::ReadOnly,
            )
            .await
            .unwrap()
            .shard_maps
            .into_iter()
            .next()
            .unwrap();

        // Register a shard and a mapping for db1 in the GSM only: the
        // store at db1 has lost all of its local metadata.
        let shard = StoreShard::new(row.id, loc("db1"));
        store
            .execute_global(
                StoreRequest::new(GlobalOpInput::AttachShard {
                    shard_map: row.clone(),
                    shard: shard.clone(),
                }),
                TransactionScope::ReadWrite,
            )
            .await
            .unwrap();
        let entry = StoreLogEntry {
            id: uuid::Uuid::new_v4(),
            code: StoreOperationCode::AddMapping,
            state: StoreOperationState::GlobalBegin,
            shard_map: row.clone(),
            source: loc("db1"),
            target: None,
            shards_involved: vec![shard.clone()],
            shards_added: vec![],
            shards_removed: vec![],
            mappings_added: vec![StoreMapping::new(row.id, range(20, 30), shard.id)],
            mappings_removed: vec![],
            lock_claims: vec![],
        };
        let begun = store
            .execute_global(
                StoreRequest::new(GlobalOpInput::BeginOperation {
                    entry: entry.clone(),
                }),
                TransactionScope::ReadWrite,
            )
            .await
            .unwrap();
        assert!(begun.is_success());
        store
            .execute_global(
                StoreRequest::new(GlobalOpInput::EndOperation {
                    operation_id: entry.id,
                }),
                TransactionScope::ReadWrite,
            )
            .await
            .unwrap();

        // db1 lists no shard maps locally; detection still tokens the
        // globally known map and flags its row.
        let recovery = smm.recovery_manager();
        let tokens = recovery.detect_mapping_differences(&loc("db1")).await.unwrap();
        assert_eq!(tokens.len(), 1);
        let diffs = recovery.get_mapping_differences(tokens[0]).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs.get(&range(20, 30)), Some(&MappingLocation::GlobalOnly));

        recovery
            .resolve_mapping_differences(tokens[0], MappingDifferenceResolution::KeepGlobalMapping)
            .await
            .unwrap();
        let tokens = recovery.detect_mapping_differences(&loc("db1")).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(recovery.get_mapping_differences(tokens[0]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn detach_and_attach_round_trip() {
        init_tracing();
        let smm = manager_over(Arc::new(MemoryStoreService::new()));
        let (map, shards) = range_map_with_shards(&smm, "orders", &["db0"]).await;
        map.create_range_mapping(range(0, 10), &shards[0]).await.unwrap();

        let recovery = smm.recovery_manager();
        recovery.detach_shard(&loc("db0")).await.unwrap();

        // The GSM forgot the shard; the LSM still has everything.
        let cold = manager_over(smm.context().store.clone());
        let map = cold.get_range_shard_map("orders").await.unwrap();
        assert!(map.shard_map().try_get_shard(&loc("db0")).await.unwrap().is_none());
        assert!(map
            .try_get_mapping_for_key(&ShardKey::from_i32(5))
            .await
            .unwrap()
            .is_none());

        // Re-register the shard from its own metadata, then let the local
        // rows win.
        recovery.attach_shard(&loc("db0")).await.unwrap();
        let tokens = recovery.detect_mapping_differences(&loc("db0")).await.unwrap();
        assert_eq!(tokens.len(), 1);
        let diffs = recovery.get_mapping_differences(tokens[0]).unwrap();
        assert_eq!(diffs.get(&range(0, 10)), Some(&MappingLocation::LocalOnly));
        recovery
            .resolve_mapping_differences(tokens[0], MappingDifferenceResolution::KeepLocalMapping)
            .await
            .unwrap();

        assert_eq!(
            map.route_for_key(&ShardKey::from_i32(5)).await.unwrap(),
            loc("db0")
        );
    }
}
