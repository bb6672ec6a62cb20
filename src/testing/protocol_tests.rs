//! Integration tests for the multi-step operation protocol: crash
//! recovery through the pending-operations log, retry behavior, and the
//! no-overlap invariant under randomized operation sequences.

#[cfg(test)]
mod tests {
    use crate::error::{Error, ShardManagementErrorCode};
    use crate::key::{ShardKey, ShardRange};
    use crate::store::{
        GlobalOpInput, MemoryStoreService, StoreRequest, StoreService, TransactionScope,
    };
    use crate::testing::fault::{FaultInjectingStore, FaultKind};
    use crate::testing::utils::{init_tracing, manager_over, range_map_with_shards};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn range(low: i32, high: i32) -> ShardRange {
        ShardRange::new(ShardKey::from_i32(low), ShardKey::from_i32(high)).unwrap()
    }

    async fn pending_log_len(store: &Arc<dyn StoreService>) -> usize {
        store
            .execute_global(
                StoreRequest::new(GlobalOpInput::GetOperationLog { shard_map_id: None }),
                TransactionScope::ReadOnly,
            )
            .await
            .unwrap()
            .log_entries
            .len()
    }

    #[tokio::test]
    async fn crash_before_local_step_is_undone_by_next_operation() {
        init_tracing();
        let backing = Arc::new(MemoryStoreService::new());
        let faulty = FaultInjectingStore::new(backing);
        let store: Arc<dyn StoreService> = faulty.clone();
        let smm = manager_over(store.clone());
        let (map, _) = range_map_with_shards(&smm, "orders", &["db0"]).await;
        let shard = map.shard_map().get_shards().await.unwrap().pop().unwrap();

        // Crash between the GSM begin and the source-LSM step.
        faulty.fail_local("ReplaceMappings", FaultKind::Terminal, 1);
        let err = map.create_range_mapping(range(0, 10), &shard).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(pending_log_len(&store).await, 1);

        // The GSM already holds the half-committed row.
        assert!(map
            .try_get_mapping_for_key(&ShardKey::from_i32(5))
            .await
            .unwrap()
            .is_some());

        // The next operation on the map discovers the pending entry,
        // undoes it, and then commits itself.
        let shard = map.shard_map().get_shards().await.unwrap().pop().unwrap();
        let second = map.create_range_mapping(range(100, 110), &shard).await.unwrap();
        assert_eq!(pending_log_len(&store).await, 0);
        assert!(map
            .try_get_mapping_for_key(&ShardKey::from_i32(5))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            map.get_mapping_for_key(&ShardKey::from_i32(105)).await.unwrap().id(),
            second.id()
        );
    }

    #[tokio::test]
    async fn crash_before_end_rolls_back_committed_local_step() {
        init_tracing();
        let backing = Arc::new(MemoryStoreService::new());
        let faulty = FaultInjectingStore::new(backing);
        let store: Arc<dyn StoreService> = faulty.clone();
        let smm = manager_over(store.clone());
        let (map, _) = range_map_with_shards(&smm, "orders", &["db0"]).await;
        let shard = map.shard_map().get_shards().await.unwrap().pop().unwrap();

        // Every step but the final log delete commits.
        faulty.fail_global("EndOperation", FaultKind::Terminal, 1);
        map.create_range_mapping(range(0, 10), &shard).await.unwrap_err();
        assert_eq!(pending_log_len(&store).await, 1);

        // The undo direction is idempotent, so rolling back a local step
        // that did commit converges all the same.
        let shard = map.shard_map().get_shards().await.unwrap().pop().unwrap();
        map.create_range_mapping(range(50, 60), &shard).await.unwrap();
        assert_eq!(pending_log_len(&store).await, 0);
        assert!(map
            .try_get_mapping_for_key(&ShardKey::from_i32(5))
            .await
            .unwrap()
            .is_none());

        // The undone range is free to map again.
        let shard = map.shard_map().get_shards().await.unwrap().pop().unwrap();
        map.create_range_mapping(range(0, 10), &shard).await.unwrap();
    }

    #[tokio::test]
    async fn transient_faults_ride_through_retry() {
        init_tracing();
        let backing = Arc::new(MemoryStoreService::new());
        let faulty = FaultInjectingStore::new(backing);
        let smm = manager_over(faulty.clone());
        let (map, shards) = range_map_with_shards(&smm, "orders", &["db0"]).await;

        // Two transient failures fit inside the three-attempt budget.
        faulty.fail_global("BeginOperation", FaultKind::Transient, 2);
        let mapping = map.create_range_mapping(range(0, 10), &shards[0]).await.unwrap();
        assert_eq!(
            map.get_mapping_for_key(&ShardKey::from_i32(3)).await.unwrap().id(),
            mapping.id()
        );
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_management_error() {
        init_tracing();
        let backing = Arc::new(MemoryStoreService::new());
        let faulty = FaultInjectingStore::new(backing);
        let smm = manager_over(faulty.clone());
        let (map, shards) = range_map_with_shards(&smm, "orders", &["db0"]).await;

        faulty.fail_global("BeginOperation", FaultKind::Transient, u32::MAX);
        let err = map.create_range_mapping(range(0, 10), &shards[0]).await.unwrap_err();
        assert_eq!(
            err.management_code(),
            Some(ShardManagementErrorCode::RetriesExhausted)
        );
        faulty.clear();
        // Nothing was begun, so nothing is pending.
        let shard = map.shard_map().get_shards().await.unwrap().pop().unwrap();
        map.create_range_mapping(range(0, 10), &shard).await.unwrap();
    }

    /// The core invariant: committed mappings of one map never overlap,
    /// under an arbitrary interleaving of adds, removes, splits and
    /// merges.
    #[tokio::test]
    async fn no_overlap_under_randomized_operation_sequence() {
        init_tracing();
        let smm = manager_over(Arc::new(MemoryStoreService::new()));
        let (map, _) = range_map_with_shards(&smm, "orders", &["db0", "db1"]).await;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for step in 0..60 {
            let mappings = map.get_mappings().await.unwrap();
            match rng.gen_range(0..4) {
                // Add a random range on a random shard; overlap rejections
                // are part of the game.
                0 => {
                    let low = rng.gen_range(0..990);
                    let high = rng.gen_range(low + 1..1000);
                    let shards = map.shard_map().get_shards().await.unwrap();
                    let shard = &shards[rng.gen_range(0..shards.len())];
                    match map.create_range_mapping(range(low, high), shard).await {
                        Ok(_) => {}
                        Err(err) => assert_eq!(
                            err.management_code(),
                            Some(ShardManagementErrorCode::MappingRangeAlreadyMapped),
                            "step {step}"
                        ),
                    }
                }
                // Split a random mapping wide enough to have an interior.
                1 => {
                    if let Some(victim) = mappings.iter().find(|m| {
                        m.range().high().as_i32().unwrap() - m.range().low().as_i32().unwrap() >= 2
                    }) {
                        let low = victim.range().low().as_i32().unwrap();
                        let high = victim.range().high().as_i32().unwrap();
                        let point = rng.gen_range(low + 1..high);
                        map.split_mapping(victim, ShardKey::from_i32(point), None)
                            .await
                            .unwrap();
                    }
                }
                // Merge the first adjacent same-shard pair.
                2 => {
                    let pair = mappings.windows(2).find(|w| {
                        w[0].shard().id() == w[1].shard().id()
                            && w[0].range().is_adjacent_to(w[1].range())
                    });
                    if let Some(w) = pair {
                        map.merge_mappings(&w[0], &w[1], None, None).await.unwrap();
                    }
                }
                // Take a random mapping offline and delete it.
                _ => {
                    if !mappings.is_empty() {
                        let victim = &mappings[rng.gen_range(0..mappings.len())];
                        let offline = map.mark_mapping_offline(victim).await.unwrap();
                        map.delete_mapping(&offline, None).await.unwrap();
                    }
                }
            }

            let committed = map.get_mappings().await.unwrap();
            for w in committed.windows(2) {
                assert!(
                    !w[0].range().intersects(w[1].range()),
                    "step {step}: {} intersects {}",
                    w[0].range(),
                    w[1].range()
                );
            }
        }
    }
}
