//! Integration tests for incremental id assignment against a store with
//! injected latency and failures, and through the task manager.

use std::sync::Arc;
use std::time::Duration;

use tally_cases::{
    CaseIdTaskState, CasesIdIncrementerTask, CasesIncrementalIdService, CasesPaging,
    IncrementalIdConfig, StopReason,
};
use tally_core::{
    CaseIdIncrementerAttributes, CreateOptions, FindOptions, IncrementalIdError, ObjectRef,
    RetryPolicy, TallyError, ALL_NAMESPACES, CASE_ID_INCREMENTER_SAVED_OBJECT,
};
use tally_tasks::{TaskManager, TaskManagerConfig};
use tally_test_utils::assertions::{assert_sequential_from_one, incremental_ids_by_namespace};
use tally_test_utils::{
    seed_cases, unavailable, CaseFixture, FlakySavedObjectsClient, InMemorySavedObjects,
    SavedObjectsClient,
};
use tokio::time::Instant;

fn unnumbered(namespace: &str, count: usize) -> Vec<CaseFixture> {
    (0..count).map(|_| CaseFixture::new(namespace)).collect()
}

async fn unassigned(service: &CasesIncrementalIdService) -> Vec<tally_core::CaseSavedObject> {
    service
        .get_cases_without_incremental_id(CasesPaging::default())
        .await
        .unwrap()
        .saved_objects
}

// ============================================================================
// TIME BUDGET
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_time_budget_leaves_remaining_cases_for_next_run() {
    let store = InMemorySavedObjects::new();
    seed_cases(&store, &unnumbered("default", 5)).await.unwrap();
    let client = Arc::new(
        FlakySavedObjectsClient::new(store.clone()).with_update_latency(Duration::from_secs(2)),
    );
    let service = CasesIncrementalIdService::new(client, IncrementalIdConfig::development());

    // Updates finish at 2s, 4s and 6s; the fourth case sees 6s > 5s.
    let cases = unassigned(&service).await;
    let summary = service
        .increment_case_ids(&cases, Duration::from_secs(5))
        .await;
    assert_eq!(summary.stop_reason, StopReason::TimeBudgetExceeded);
    assert_eq!(summary.applied, 3);
    assert_eq!(summary.remaining, 2);

    let cases = unassigned(&service).await;
    assert_eq!(cases.len(), 2);
    let summary = service
        .increment_case_ids(&cases, Duration::from_secs(5))
        .await;
    assert!(summary.stop_reason.is_completed());
    assert_eq!(summary.namespaces.get("default"), Some(&5));

    let ids = incremental_ids_by_namespace(&store).await.unwrap();
    assert_sequential_from_one("default", &ids["default"]);
}

// ============================================================================
// RETRIES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_update_succeeds_on_third_attempt() {
    let store = InMemorySavedObjects::new();
    seed_cases(&store, &unnumbered("default", 1)).await.unwrap();
    let client = Arc::new(FlakySavedObjectsClient::new(store.clone()));
    client.fail_next_updates(2, unavailable()).unwrap();

    let config = IncrementalIdConfig {
        retry: RetryPolicy::default(),
        ..IncrementalIdConfig::development()
    };
    let service = CasesIncrementalIdService::new(client.clone(), config);

    let cases = unassigned(&service).await;
    let started = Instant::now();
    let summary = service
        .increment_case_ids(&cases, Duration::from_secs(60))
        .await;
    let elapsed = started.elapsed();

    assert!(summary.stop_reason.is_completed());
    assert_eq!(summary.applied, 1);
    assert_eq!(client.update_calls(), 3);
    // Each retry re-reads the case for a fresh version.
    assert_eq!(client.get_calls(), 2);
    // 1s then 2s of backoff.
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));

    let ids = incremental_ids_by_namespace(&store).await.unwrap();
    assert_eq!(ids["default"], vec![Some(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_stop_the_pass() {
    let store = InMemorySavedObjects::new();
    seed_cases(&store, &unnumbered("default", 2)).await.unwrap();
    let client = Arc::new(FlakySavedObjectsClient::new(store.clone()));
    client.fail_next_updates(4, unavailable()).unwrap();
    let service = CasesIncrementalIdService::new(client.clone(), IncrementalIdConfig::default());

    let cases = unassigned(&service).await;
    let summary = service
        .increment_case_ids(&cases, Duration::from_secs(60))
        .await;

    // The failed case counts as reached; only the second is left.
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.remaining, 1);
    match summary.stop_reason {
        StopReason::Failed {
            case_id,
            attempted_id,
            error,
        } => {
            assert_eq!(case_id, cases[0].id);
            assert_eq!(attempted_id, Some(1));
            assert!(matches!(
                error,
                TallyError::IncrementalId(IncrementalIdError::RetriesExhausted { attempts: 4, .. })
            ));
        }
        other => panic!("expected a failed stop, got {other:?}"),
    }
    assert_eq!(client.update_calls(), 4);

    // The failed case keeps no id and the next run numbers both from 1.
    let summary = service
        .increment_case_ids(&unassigned(&service).await, Duration::from_secs(60))
        .await;
    assert_eq!(summary.applied, 2);
    let ids = incremental_ids_by_namespace(&store).await.unwrap();
    assert_sequential_from_one("default", &ids["default"]);
}

#[tokio::test]
async fn test_counter_lookup_failure_stops_the_pass() {
    let store = InMemorySavedObjects::new();
    seed_cases(&store, &unnumbered("default", 3)).await.unwrap();
    let client = Arc::new(FlakySavedObjectsClient::new(store.clone()));
    let service = CasesIncrementalIdService::new(client.clone(), IncrementalIdConfig::development());

    let cases = unassigned(&service).await;
    client.fail_next_finds(1, unavailable()).unwrap();
    let summary = service
        .increment_case_ids(&cases, Duration::from_secs(60))
        .await;

    assert_eq!(summary.applied, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.remaining, cases.len() - 1);
    match summary.stop_reason {
        StopReason::Failed {
            case_id,
            attempted_id,
            error,
        } => {
            assert_eq!(case_id, cases[0].id);
            assert_eq!(attempted_id, None);
            assert!(error.is_transient());
        }
        other => panic!("expected a failed stop, got {other:?}"),
    }
    assert_eq!(client.update_calls(), 0);
}

#[tokio::test]
async fn test_update_committed_before_error_counts_as_applied() {
    let store = InMemorySavedObjects::new();
    seed_cases(&store, &unnumbered("default", 2)).await.unwrap();
    let client = Arc::new(FlakySavedObjectsClient::new(store.clone()));
    let service = CasesIncrementalIdService::new(client.clone(), IncrementalIdConfig::development());

    let cases = unassigned(&service).await;
    client.fail_after_next_updates(1, unavailable()).unwrap();
    let summary = service
        .increment_case_ids(&cases, Duration::from_secs(60))
        .await;

    assert!(summary.stop_reason.is_completed());
    assert_eq!(summary.applied, 2);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.namespaces.get("default"), Some(&2));
    // The retry re-read finds its own id and writes nothing more.
    assert_eq!(client.update_calls(), 2);
    assert_eq!(client.get_calls(), 1);

    let ids = incremental_ids_by_namespace(&store).await.unwrap();
    assert_sequential_from_one("default", &ids["default"]);
}

#[tokio::test]
async fn test_find_failure_surfaces_to_caller() {
    let client = Arc::new(FlakySavedObjectsClient::new(InMemorySavedObjects::new()));
    client.fail_next_finds(1, unavailable()).unwrap();
    let service = CasesIncrementalIdService::new(client, IncrementalIdConfig::development());

    let err = service
        .get_cases_without_incremental_id(CasesPaging::default())
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

// ============================================================================
// CONTINUATION
// ============================================================================

#[tokio::test]
async fn test_later_runs_continue_the_namespace_sequence() {
    let store = InMemorySavedObjects::new();
    let service =
        CasesIncrementalIdService::new(Arc::new(store.clone()), IncrementalIdConfig::development());

    seed_cases(&store, &unnumbered("space-a", 3)).await.unwrap();
    service
        .increment_case_ids(&unassigned(&service).await, Duration::from_secs(60))
        .await;

    CaseFixture::new("space-a")
        .created_at(tally_test_utils::at_offset(100))
        .seed(&store)
        .await
        .unwrap();
    let summary = service
        .increment_case_ids(&unassigned(&service).await, Duration::from_secs(60))
        .await;

    assert_eq!(summary.namespaces.get("space-a"), Some(&4));
    let ids = incremental_ids_by_namespace(&store).await.unwrap();
    assert_eq!(ids["space-a"], vec![Some(1), Some(2), Some(3), Some(4)]);
}

#[tokio::test]
async fn test_duplicate_incrementers_resolve_to_max() {
    let store = InMemorySavedObjects::new();
    for last_id in [10, 100] {
        store
            .create(
                CASE_ID_INCREMENTER_SAVED_OBJECT,
                serde_json::to_value(CaseIdIncrementerAttributes::new(last_id, 0)).unwrap(),
                &CreateOptions::default(),
            )
            .await
            .unwrap();
    }
    seed_cases(
        &store,
        &[
            CaseFixture::new("default").with_incremental_id(5),
            CaseFixture::new("default"),
        ],
    )
    .await
    .unwrap();

    let config = IncrementalIdConfig {
        use_incrementer_cache: true,
        ..IncrementalIdConfig::development()
    };
    let service = CasesIncrementalIdService::new(Arc::new(store.clone()), config);
    let summary = service
        .increment_case_ids(&unassigned(&service).await, Duration::from_secs(60))
        .await;

    // The counter never goes below the highest cached value.
    assert_eq!(summary.namespaces.get("default"), Some(&101));

    let incrementers = store
        .find(&FindOptions::new(CASE_ID_INCREMENTER_SAVED_OBJECT).with_namespaces([ALL_NAMESPACES]))
        .await
        .unwrap()
        .decode::<CaseIdIncrementerAttributes>()
        .unwrap();
    assert_eq!(incrementers.total, 1);
    assert_eq!(incrementers.saved_objects[0].attributes.last_id, 101);
}

#[tokio::test(start_paused = true)]
async fn test_pass_survives_incrementer_removed_mid_run() {
    let store = InMemorySavedObjects::new();
    seed_cases(&store, &unnumbered("default", 1)).await.unwrap();
    let client = Arc::new(
        FlakySavedObjectsClient::new(store.clone()).with_update_latency(Duration::from_secs(1)),
    );
    let config = IncrementalIdConfig {
        use_incrementer_cache: true,
        ..IncrementalIdConfig::development()
    };
    let service = CasesIncrementalIdService::new(client, config);
    let incrementers = FindOptions::new(CASE_ID_INCREMENTER_SAVED_OBJECT)
        .with_namespaces([ALL_NAMESPACES]);

    let cases = unassigned(&service).await;
    // The incrementer exists once the case update starts sleeping.
    let remove = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let found = store.find(&incrementers).await.unwrap();
        assert_eq!(found.total, 1);
        let targets: Vec<ObjectRef> = found
            .saved_objects
            .iter()
            .map(|incrementer| ObjectRef {
                object_type: CASE_ID_INCREMENTER_SAVED_OBJECT.to_string(),
                id: incrementer.id.clone(),
                namespace: Some("default".to_string()),
            })
            .collect();
        store.bulk_delete(&targets).await.unwrap();
    };
    let (summary, ()) = tokio::join!(
        service.increment_case_ids(&cases, Duration::from_secs(60)),
        remove
    );

    assert!(summary.stop_reason.is_completed());
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.namespaces.get("default"), Some(&1));
    assert_eq!(store.find(&incrementers).await.unwrap().total, 0);

    CaseFixture::new("default")
        .created_at(tally_test_utils::at_offset(100))
        .seed(&store)
        .await
        .unwrap();
    service
        .increment_case_ids(&unassigned(&service).await, Duration::from_secs(60))
        .await;
    let ids = incremental_ids_by_namespace(&store).await.unwrap();
    assert_sequential_from_one("default", &ids["default"]);
}

// ============================================================================
// TASK MANAGER
// ============================================================================

#[tokio::test]
async fn test_task_assigns_ids_through_task_manager() {
    let store = InMemorySavedObjects::new();
    seed_cases(
        &store,
        &[
            CaseFixture::new("default"),
            CaseFixture::new("space-a"),
            CaseFixture::new("default"),
        ],
    )
    .await
    .unwrap();

    let config = IncrementalIdConfig::development();
    let service = Arc::new(CasesIncrementalIdService::new(
        Arc::new(store.clone()),
        config.clone(),
    ));
    let manager = Arc::new(TaskManager::new(
        Arc::new(store.clone()),
        TaskManagerConfig::default(),
    ));
    let task = CasesIdIncrementerTask::register(&manager, service, config).unwrap();
    let instance = task.schedule(&manager).await.unwrap();

    for handle in manager.run_due_tasks().await.unwrap() {
        handle.await.unwrap();
    }

    let ids = incremental_ids_by_namespace(&store).await.unwrap();
    assert_eq!(ids["default"], vec![Some(1), Some(2)]);
    assert_eq!(ids["space-a"], vec![Some(1)]);

    let after = manager.get(&instance.id).await.unwrap();
    let state: CaseIdTaskState = serde_json::from_value(after.state.clone()).unwrap();
    assert_eq!(state.applied_in_last_run, 3);
    assert_eq!(state.cases_without_incremental_id, 0);
    assert_eq!(state.namespaces, vec!["default", "space-a"]);
    assert!(after.run_at > instance.run_at);

    // A forced second run finds nothing to do and keeps the namespace list.
    manager.run_soon(&instance.id).await.unwrap();
    for handle in manager.run_due_tasks().await.unwrap() {
        handle.await.unwrap();
    }
    let state: CaseIdTaskState =
        serde_json::from_value(manager.get(&instance.id).await.unwrap().state).unwrap();
    assert_eq!(state.applied_in_last_run, 0);
    assert_eq!(state.namespaces, vec!["default", "space-a"]);
    assert_eq!(state.last_stop_reason.as_deref(), Some("completed"));
}

#[tokio::test]
async fn test_task_registration_rejects_invalid_config() {
    let store = InMemorySavedObjects::new();
    let config = IncrementalIdConfig {
        interval: "often".to_string(),
        ..IncrementalIdConfig::development()
    };
    let service = Arc::new(CasesIncrementalIdService::new(
        Arc::new(store.clone()),
        config.clone(),
    ));
    let manager = TaskManager::new(Arc::new(store), TaskManagerConfig::default());

    assert!(CasesIdIncrementerTask::register(&manager, service, config).is_err());
    assert!(!manager.is_registered(tally_cases::constants::CASES_INCREMENTAL_ID_SYNC_TASK_TYPE));
}
