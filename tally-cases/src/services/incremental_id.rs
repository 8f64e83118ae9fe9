//! Cases Incremental ID Service
//!
//! Hands every case the next free integer of its namespace, in creation
//! order. The next free integer is always derived from the highest id already
//! present on a case in that namespace, so the service keeps no authoritative
//! state of its own and can resume after any interruption.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tally_core::{
    lookup_path, CaseAttributes, CaseIdIncrementerSavedObject, CaseSavedObject, FindOptions,
    FindResponse, IncrementalId, IncrementalIdError, SavedObject, SortOrder, TallyError,
    TallyResult, UpdateOptions, ALL_NAMESPACES, CASE_SAVED_OBJECT, INCREMENTAL_ID_FIELD,
};
use tally_storage::SavedObjectsClient;
use tokio::time::Instant;

use crate::config::IncrementalIdConfig;
use crate::constants::{
    DEFAULT_CASES_SORT_FIELD, INCREMENTAL_ID_EXISTS_FILTER, INCREMENTAL_ID_MISSING_FILTER,
    INCREMENTAL_ID_SORT_FIELD,
};
use crate::retry::{retry_transient, RetryFailure};
use crate::services::incrementer::CaseIdIncrementerStore;

// ============================================================================
// TYPES
// ============================================================================

/// Paging overrides for listing cases without an incremental id.
///
/// Unset fields fall back to creation order, the configured page size and
/// the first page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CasesPaging {
    pub per_page: Option<usize>,
    pub page: Option<usize>,
    pub sort_field: Option<String>,
    pub sort_order: Option<SortOrder>,
}

/// Why `increment_case_ids` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// Every input case was processed.
    Completed,
    /// The run's time budget ran out before the next case.
    TimeBudgetExceeded,
    /// Cancellation was requested before the next case.
    Cancelled,
    /// A case could not be processed. Nothing after it was attempted.
    Failed {
        case_id: String,
        /// Id that was being applied, if the failure happened that late.
        attempted_id: Option<u64>,
        error: TallyError,
    },
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::TimeBudgetExceeded => "time_budget_exceeded",
            StopReason::Cancelled => "cancelled",
            StopReason::Failed { .. } => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StopReason::Completed)
    }
}

/// Outcome of one `increment_case_ids` pass.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementSummary {
    /// Cases that received an id.
    pub applied: usize,
    /// Cases passed over: no namespace, or an id was already present.
    pub skipped: usize,
    /// Cases never reached because the pass stopped early. A case that failed
    /// counts as reached.
    pub remaining: usize,
    /// Last id handed out per namespace touched by this pass.
    pub namespaces: BTreeMap<String, u64>,
    pub stop_reason: StopReason,
}

// ============================================================================
// SERVICE
// ============================================================================

/// Assigns per-namespace incremental ids to cases.
pub struct CasesIncrementalIdService {
    client: Arc<dyn SavedObjectsClient>,
    config: IncrementalIdConfig,
    incrementers: CaseIdIncrementerStore,
}

impl CasesIncrementalIdService {
    pub fn new(client: Arc<dyn SavedObjectsClient>, config: IncrementalIdConfig) -> Self {
        tracing::info!(
            use_incrementer_cache = config.use_incrementer_cache,
            page_size = config.page_size,
            "Cases incremental ID service initialized"
        );
        Self {
            incrementers: CaseIdIncrementerStore::new(Arc::clone(&client)),
            client,
            config,
        }
    }

    pub fn config(&self) -> &IncrementalIdConfig {
        &self.config
    }

    pub fn incremental_id_exists_filter() -> &'static str {
        INCREMENTAL_ID_EXISTS_FILTER
    }

    pub fn incremental_id_missing_filter() -> &'static str {
        INCREMENTAL_ID_MISSING_FILTER
    }

    /// Cases lacking an incremental id across all namespaces, oldest first.
    pub async fn get_cases_without_incremental_id(
        &self,
        paging: CasesPaging,
    ) -> TallyResult<FindResponse<CaseAttributes>> {
        let options = FindOptions::new(CASE_SAVED_OBJECT)
            .with_filter(INCREMENTAL_ID_MISSING_FILTER)
            .with_sort(
                paging
                    .sort_field
                    .unwrap_or_else(|| DEFAULT_CASES_SORT_FIELD.to_string()),
                paging.sort_order.unwrap_or(SortOrder::Asc),
            )
            .with_paging(
                paging.per_page.unwrap_or(self.config.page_size),
                paging.page.unwrap_or(1),
            )
            .with_namespaces([ALL_NAMESPACES]);

        let response = self.find_cases(&options).await?;
        Ok(response.decode::<CaseAttributes>()?)
    }

    /// Number of cases still waiting for an id, across all namespaces.
    pub async fn count_cases_without_incremental_id(&self) -> TallyResult<usize> {
        let options = FindOptions::new(CASE_SAVED_OBJECT)
            .with_filter(INCREMENTAL_ID_MISSING_FILTER)
            .with_paging(1, 1)
            .with_namespaces([ALL_NAMESPACES]);
        Ok(self.find_cases(&options).await?.total)
    }

    /// Highest numerical id present on a case in `namespace`, or 0.
    pub async fn get_last_applied_id_for_space(&self, namespace: &str) -> TallyResult<u64> {
        let options = FindOptions::new(CASE_SAVED_OBJECT)
            .with_filter(INCREMENTAL_ID_EXISTS_FILTER)
            .with_sort(INCREMENTAL_ID_SORT_FIELD, SortOrder::Desc)
            .with_paging(1, 1)
            .with_namespaces([namespace]);

        let response = self.find_cases(&options).await?;
        let Some(top) = response.saved_objects.first() else {
            return Ok(0);
        };
        let Some(last_applied) =
            lookup_path(&top.attributes, &[INCREMENTAL_ID_FIELD, "numerical_id"])
                .and_then(|value| value.as_u64())
        else {
            tracing::warn!(
                namespace,
                case_id = %top.id,
                "Highest numbered case has no readable numerical_id, continuing from 0"
            );
            return Ok(0);
        };

        // Deleted cases leave gaps.
        if last_applied != response.total as u64 {
            tracing::debug!(
                namespace,
                last_applied,
                cases_with_id = response.total,
                "Highest incremental id differs from the number of cases with an id"
            );
        }
        Ok(last_applied)
    }

    async fn find_cases(&self, options: &FindOptions) -> TallyResult<FindResponse> {
        self.client.find(options).await.map_err(|e| {
            tracing::error!(error = %e, filter = ?options.filter, "Failed to query cases");
            e
        })
    }

    /// Assign ids to `cases` in order, stopping at the first failure or when
    /// `max_duration` has elapsed.
    pub async fn increment_case_ids(
        &self,
        cases: &[CaseSavedObject],
        max_duration: Duration,
    ) -> IncrementSummary {
        self.increment_case_ids_until(cases, max_duration, || false)
            .await
    }

    /// Like `increment_case_ids`, also stopping once `is_cancelled` reports
    /// true. Both checks run before each case; an update in flight is never
    /// interrupted.
    pub async fn increment_case_ids_until<F>(
        &self,
        cases: &[CaseSavedObject],
        max_duration: Duration,
        is_cancelled: F,
    ) -> IncrementSummary
    where
        F: Fn() -> bool,
    {
        let started = Instant::now();
        let mut counters: HashMap<String, u64> = HashMap::new();
        let mut incrementers: HashMap<String, CaseIdIncrementerSavedObject> = HashMap::new();
        let mut namespaces = BTreeMap::new();
        let mut applied = 0;
        let mut skipped = 0;
        let mut stop_reason = StopReason::Completed;
        let mut processed = 0;

        for case in cases {
            if is_cancelled() {
                tracing::info!(applied, "Incremental id assignment cancelled");
                stop_reason = StopReason::Cancelled;
                break;
            }
            if started.elapsed() > max_duration {
                tracing::info!(
                    applied,
                    max_duration_ms = max_duration.as_millis() as u64,
                    "Incremental id time budget exceeded, remaining cases wait for the next run"
                );
                stop_reason = StopReason::TimeBudgetExceeded;
                break;
            }

            if let Some(existing) = &case.attributes.incremental_id {
                tracing::debug!(
                    case_id = %case.id,
                    existing = existing.numerical_id,
                    "Case already has an incremental id, skipping"
                );
                skipped += 1;
                processed += 1;
                continue;
            }

            let Some(namespace) = case.namespace() else {
                tracing::warn!(case_id = %case.id, "Case has no namespace assigned. Skipping it.");
                skipped += 1;
                processed += 1;
                continue;
            };

            let last_id = match counters.get(namespace) {
                Some(last_id) => *last_id,
                None => match self.initial_counter(namespace, &mut incrementers).await {
                    Ok(last_id) => last_id,
                    Err(error) => {
                        tracing::error!(
                            case_id = %case.id,
                            namespace,
                            error = %error,
                            "ID incrementing paused due to error"
                        );
                        stop_reason = StopReason::Failed {
                            case_id: case.id.clone(),
                            attempted_id: None,
                            error,
                        };
                        processed += 1;
                        break;
                    }
                },
            };

            let new_id = last_id + 1;
            match self.apply_incremental_id_to_case(case, new_id, namespace).await {
                Ok(_) => {
                    counters.insert(namespace.to_string(), new_id);
                    namespaces.insert(namespace.to_string(), new_id);
                    applied += 1;
                }
                Err(TallyError::IncrementalId(IncrementalIdError::AlreadyAssigned {
                    existing,
                    ..
                })) => {
                    counters.insert(namespace.to_string(), last_id.max(existing));
                    skipped += 1;
                }
                Err(error) => {
                    tracing::error!(
                        case_id = %case.id,
                        namespace,
                        attempted_id = new_id,
                        error = %error,
                        "ID incrementing paused due to error"
                    );
                    stop_reason = StopReason::Failed {
                        case_id: case.id.clone(),
                        attempted_id: Some(new_id),
                        error,
                    };
                    processed += 1;
                    break;
                }
            }
            processed += 1;
        }

        if applied > 0 && self.config.use_incrementer_cache {
            self.persist_incrementers(&counters, incrementers).await;
        }

        let summary = IncrementSummary {
            applied,
            skipped,
            remaining: cases.len() - processed,
            namespaces,
            stop_reason,
        };
        tracing::debug!(
            applied = summary.applied,
            skipped = summary.skipped,
            remaining = summary.remaining,
            stop_reason = summary.stop_reason.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Incremental id pass finished"
        );
        summary
    }

    /// Counter to continue from in `namespace`.
    async fn initial_counter(
        &self,
        namespace: &str,
        incrementers: &mut HashMap<String, CaseIdIncrementerSavedObject>,
    ) -> TallyResult<u64> {
        let derived = self.get_last_applied_id_for_space(namespace).await?;
        if !self.config.use_incrementer_cache {
            return Ok(derived);
        }

        match self.incrementers.get_or_create(namespace, derived).await {
            Ok(incrementer) => {
                let last_id = derived.max(incrementer.attributes.last_id);
                incrementers.insert(namespace.to_string(), incrementer);
                Ok(last_id)
            }
            Err(e) => {
                tracing::warn!(
                    namespace,
                    error = %e,
                    "Unable to use an existing incrementer, continuing from case ids"
                );
                Ok(derived)
            }
        }
    }

    async fn persist_incrementers(
        &self,
        counters: &HashMap<String, u64>,
        incrementers: HashMap<String, CaseIdIncrementerSavedObject>,
    ) {
        for (namespace, incrementer) in incrementers {
            let Some(last_id) = counters.get(&namespace).copied() else {
                continue;
            };
            if last_id <= incrementer.attributes.last_id {
                continue;
            }
            // The cache is rebuilt from cases on the next run.
            if let Err(e) = self
                .incrementers
                .increment_counter(incrementer, last_id, &namespace)
                .await
            {
                tracing::debug!(namespace = %namespace, last_id, error = %e, "Incrementer left behind case ids");
            }
        }
    }

    /// Write `new_id` onto `case`, retrying transient failures.
    ///
    /// Retries re-read the case first, so they carry a fresh version and stop
    /// with `AlreadyAssigned` if the case got a different id in the meantime.
    /// Finding `new_id` itself means an earlier attempt landed.
    pub async fn apply_incremental_id_to_case(
        &self,
        case: &CaseSavedObject,
        new_id: u64,
        namespace: &str,
    ) -> TallyResult<SavedObject> {
        if let Some(existing) = &case.attributes.incremental_id {
            return Err(IncrementalIdError::AlreadyAssigned {
                case_id: case.id.clone(),
                existing: existing.numerical_id,
            }
            .into());
        }

        let client = &self.client;
        let incremental_id = IncrementalId::new(new_id, namespace);
        let result = retry_transient(&self.config.retry, "apply_incremental_id", |attempt| {
            let incremental_id = incremental_id.clone();
            async move {
                let version = if attempt == 1 {
                    case.version.clone()
                } else {
                    let current = client
                        .get(CASE_SAVED_OBJECT, &case.id, Some(namespace))
                        .await?;
                    if let Some(existing) =
                        lookup_path(&current.attributes, &[INCREMENTAL_ID_FIELD, "numerical_id"])
                            .and_then(|v| v.as_u64())
                    {
                        // An earlier attempt committed before its error came back.
                        if existing == new_id {
                            tracing::debug!(
                                case_id = %case.id,
                                attempt,
                                "Incremental id already written by a previous attempt"
                            );
                            return Ok(current);
                        }
                        return Err(IncrementalIdError::AlreadyAssigned {
                            case_id: case.id.clone(),
                            existing,
                        }
                        .into());
                    }
                    current.version
                };

                client
                    .update(
                        CASE_SAVED_OBJECT,
                        &case.id,
                        json!({ "incremental_id": incremental_id }),
                        &UpdateOptions {
                            namespace: Some(namespace.to_string()),
                            version,
                        },
                    )
                    .await
            }
        })
        .await;

        match result {
            Ok(updated) => {
                tracing::debug!(case_id = %case.id, namespace, incremental_id = new_id, "Applied incremental id");
                Ok(updated)
            }
            Err(RetryFailure {
                error: error @ TallyError::IncrementalId(IncrementalIdError::AlreadyAssigned { .. }),
                ..
            }) => {
                tracing::warn!(case_id = %case.id, error = %error, "Case was assigned an id concurrently");
                Err(error)
            }
            Err(RetryFailure { error, attempts }) => {
                tracing::error!(
                    case_id = %case.id,
                    namespace,
                    attempts,
                    error = %error,
                    "Failed to apply incremental id {new_id}"
                );
                match error {
                    TallyError::Storage(source) => Err(IncrementalIdError::RetriesExhausted {
                        case_id: case.id.clone(),
                        attempted_id: new_id,
                        attempts,
                        source,
                    }
                    .into()),
                    other => Err(other),
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
