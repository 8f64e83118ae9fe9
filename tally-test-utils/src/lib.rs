//! Tally Test Utilities
//!
//! Shared test infrastructure for the tally workspace:
//! - Case fixtures and seeding helpers
//! - A fault-injecting saved-objects client
//! - Proptest generators for case layouts
//! - Assertions over assigned incremental ids

pub use tally_core::{
    CaseAttributes, CaseSavedObject, IncrementalId, StorageError, TallyError, TallyResult,
    Timestamp, CASE_SAVED_OBJECT,
};
pub use tally_storage::{InMemorySavedObjects, SavedObjectsClient};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::{
    BulkDeleteResponse, CreateOptions, FindOptions, FindResponse, ObjectRef, SavedObject,
    UpdateOptions,
};

// ============================================================================
// CASE FIXTURES
// ============================================================================

/// Builder for a case record to seed into a store.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseFixture {
    pub namespace: String,
    pub title: String,
    pub created_at: Option<Timestamp>,
    pub incremental_id: Option<u64>,
}

impl CaseFixture {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            title: "Test case".to_string(),
            created_at: None,
            incremental_id: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn created_at(mut self, at: Timestamp) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Seed the case as already numbered.
    pub fn with_incremental_id(mut self, numerical_id: u64) -> Self {
        self.incremental_id = Some(numerical_id);
        self
    }

    pub fn attributes(&self) -> CaseAttributes {
        CaseAttributes {
            created_at: self.created_at,
            incremental_id: self
                .incremental_id
                .map(|n| IncrementalId::new(n, self.namespace.clone())),
            ..CaseAttributes::new(self.title.clone())
        }
    }

    pub async fn seed<C>(&self, client: &C) -> TallyResult<SavedObject>
    where
        C: SavedObjectsClient + ?Sized,
    {
        let attributes = serde_json::to_value(self.attributes()).map_err(StorageError::from)?;
        client
            .create(
                CASE_SAVED_OBJECT,
                attributes,
                &CreateOptions {
                    namespace: Some(self.namespace.clone()),
                    id: None,
                    created_at: self.created_at,
                },
            )
            .await
    }
}

/// Fixed origin for fixture timestamps.
pub fn base_time() -> Timestamp {
    chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

/// Timestamp `seconds` after `base_time()`.
pub fn at_offset(seconds: i64) -> Timestamp {
    base_time() + chrono::Duration::seconds(seconds)
}

/// Seed `fixtures` in order. Fixtures without an explicit creation time get
/// one second apart, in slice order.
pub async fn seed_cases<C>(client: &C, fixtures: &[CaseFixture]) -> TallyResult<Vec<SavedObject>>
where
    C: SavedObjectsClient + ?Sized,
{
    let mut seeded = Vec::with_capacity(fixtures.len());
    for (i, fixture) in fixtures.iter().enumerate() {
        let fixture = match fixture.created_at {
            Some(_) => fixture.clone(),
            None => fixture.clone().created_at(at_offset(i as i64)),
        };
        seeded.push(fixture.seed(client).await?);
    }
    Ok(seeded)
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Saved-objects client that fails chosen calls before delegating to an
/// in-memory store.
///
/// Queued failures are consumed one per call, in order.
#[derive(Debug, Default)]
pub struct FlakySavedObjectsClient {
    inner: InMemorySavedObjects,
    update_failures: Mutex<VecDeque<StorageError>>,
    committed_update_failures: Mutex<VecDeque<StorageError>>,
    find_failures: Mutex<VecDeque<StorageError>>,
    update_latency: Option<Duration>,
    update_calls: AtomicUsize,
    find_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl FlakySavedObjectsClient {
    pub fn new(inner: InMemorySavedObjects) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Sleep this long before every update. Pairs with a paused tokio clock.
    pub fn with_update_latency(mut self, latency: Duration) -> Self {
        self.update_latency = Some(latency);
        self
    }

    pub fn inner(&self) -> &InMemorySavedObjects {
        &self.inner
    }

    /// Fail the next `times` updates with `error`.
    pub fn fail_next_updates(&self, times: usize, error: StorageError) -> TallyResult<()> {
        let mut queue = self
            .update_failures
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        queue.extend(std::iter::repeat(error).take(times));
        Ok(())
    }

    /// Commit the next `times` updates, then report `error` anyway, the way a
    /// request that times out after the write landed does.
    pub fn fail_after_next_updates(&self, times: usize, error: StorageError) -> TallyResult<()> {
        let mut queue = self
            .committed_update_failures
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        queue.extend(std::iter::repeat(error).take(times));
        Ok(())
    }

    /// Fail the next `times` finds with `error`.
    pub fn fail_next_finds(&self, times: usize, error: StorageError) -> TallyResult<()> {
        let mut queue = self
            .find_failures
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        queue.extend(std::iter::repeat(error).take(times));
        Ok(())
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn next_failure(queue: &Mutex<VecDeque<StorageError>>) -> TallyResult<()> {
        let mut queue = queue.lock().map_err(|_| StorageError::LockPoisoned)?;
        match queue.pop_front() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// Transient error used by most flaky-store tests.
pub fn unavailable() -> StorageError {
    StorageError::Unavailable {
        reason: "injected".to_string(),
    }
}

#[async_trait]
impl SavedObjectsClient for FlakySavedObjectsClient {
    async fn find(&self, options: &FindOptions) -> TallyResult<FindResponse> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        Self::next_failure(&self.find_failures)?;
        self.inner.find(options).await
    }

    async fn get(
        &self,
        object_type: &str,
        id: &str,
        namespace: Option<&str>,
    ) -> TallyResult<SavedObject> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(object_type, id, namespace).await
    }

    async fn create(
        &self,
        object_type: &str,
        attributes: Value,
        options: &CreateOptions,
    ) -> TallyResult<SavedObject> {
        self.inner.create(object_type, attributes, options).await
    }

    async fn update(
        &self,
        object_type: &str,
        id: &str,
        attributes: Value,
        options: &UpdateOptions,
    ) -> TallyResult<SavedObject> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.update_latency {
            tokio::time::sleep(latency).await;
        }
        Self::next_failure(&self.update_failures)?;
        let updated = self.inner.update(object_type, id, attributes, options).await?;
        Self::next_failure(&self.committed_update_failures)?;
        Ok(updated)
    }

    async fn bulk_delete(&self, objects: &[ObjectRef]) -> TallyResult<BulkDeleteResponse> {
        self.inner.bulk_delete(objects).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub const NAMESPACES: [&str; 4] = ["default", "space-a", "space-b", "space-c"];

    pub fn arb_namespace() -> impl Strategy<Value = String> {
        prop::sample::select(NAMESPACES.to_vec()).prop_map(str::to_string)
    }

    /// Unnumbered cases spread over a few namespaces, in creation order.
    pub fn arb_unnumbered_cases(max: usize) -> impl Strategy<Value = Vec<CaseFixture>> {
        prop::collection::vec(arb_namespace(), 0..=max).prop_map(|namespaces| {
            namespaces
                .into_iter()
                .enumerate()
                .map(|(i, ns)| CaseFixture::new(ns).created_at(at_offset(i as i64)))
                .collect()
        })
    }

    /// Mix of numbered and unnumbered cases. Numbered cases in a namespace
    /// carry ids 1..=n, oldest first.
    pub fn arb_case_layout(max: usize) -> impl Strategy<Value = Vec<CaseFixture>> {
        prop::collection::vec((arb_namespace(), any::<bool>()), 0..=max).prop_map(|entries| {
            let mut next: std::collections::HashMap<String, u64> = Default::default();
            entries
                .into_iter()
                .enumerate()
                .map(|(i, (ns, numbered))| {
                    let fixture = CaseFixture::new(ns.clone()).created_at(at_offset(i as i64));
                    if numbered {
                        let id = next.entry(ns).or_insert(0);
                        *id += 1;
                        fixture.with_incremental_id(*id)
                    } else {
                        fixture
                    }
                })
                .collect()
        })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;
    use std::collections::BTreeMap;
    use tally_core::{SortOrder, ALL_NAMESPACES};

    /// Assigned ids per namespace, ordered by case creation time.
    pub async fn incremental_ids_by_namespace<C>(
        client: &C,
    ) -> TallyResult<BTreeMap<String, Vec<Option<u64>>>>
    where
        C: SavedObjectsClient + ?Sized,
    {
        let found = client
            .find(
                &FindOptions::new(CASE_SAVED_OBJECT)
                    .with_sort("created_at", SortOrder::Asc)
                    .with_paging(10_000, 1)
                    .with_namespaces([ALL_NAMESPACES]),
            )
            .await?
            .decode::<CaseAttributes>()?;

        let mut by_namespace: BTreeMap<String, Vec<Option<u64>>> = BTreeMap::new();
        for case in found.saved_objects {
            let namespace = case.namespace().unwrap_or_default().to_string();
            by_namespace
                .entry(namespace)
                .or_default()
                .push(case.attributes.incremental_id.map(|id| id.numerical_id));
        }
        Ok(by_namespace)
    }

    /// Panics unless `ids` is exactly 1..=n in order.
    pub fn assert_sequential_from_one(namespace: &str, ids: &[Option<u64>]) {
        let expected: Vec<Option<u64>> = (1..=ids.len() as u64).map(Some).collect();
        assert_eq!(ids, expected.as_slice(), "namespace {namespace} ids not sequential");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_client_consumes_failures_in_order() {
        let client = FlakySavedObjectsClient::new(InMemorySavedObjects::new());
        let seeded = CaseFixture::new("default").seed(&client).await.unwrap();
        client.fail_next_updates(1, unavailable()).unwrap();

        let patch = serde_json::json!({ "title": "renamed" });
        let first = client
            .update(CASE_SAVED_OBJECT, &seeded.id, patch.clone(), &UpdateOptions::default())
            .await;
        assert_eq!(first.unwrap_err(), TallyError::Storage(unavailable()));

        let second = client
            .update(CASE_SAVED_OBJECT, &seeded.id, patch, &UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(second.attributes["title"], "renamed");
        assert_eq!(client.update_calls(), 2);
    }

    #[tokio::test]
    async fn test_committed_update_failure_still_writes() {
        let client = FlakySavedObjectsClient::new(InMemorySavedObjects::new());
        let seeded = CaseFixture::new("default").seed(&client).await.unwrap();
        client.fail_after_next_updates(1, unavailable()).unwrap();

        let patch = serde_json::json!({ "title": "renamed" });
        let result = client
            .update(CASE_SAVED_OBJECT, &seeded.id, patch, &UpdateOptions::default())
            .await;
        assert!(result.is_err());

        let stored = client.inner().get(CASE_SAVED_OBJECT, &seeded.id, None).await.unwrap();
        assert_eq!(stored.attributes["title"], "renamed");
    }

    #[tokio::test]
    async fn test_seed_cases_spaces_creation_times() {
        let store = InMemorySavedObjects::new();
        let seeded = seed_cases(
            &store,
            &[CaseFixture::new("default"), CaseFixture::new("default").with_incremental_id(4)],
        )
        .await
        .unwrap();

        assert_eq!(seeded[0].created_at, at_offset(0));
        assert_eq!(seeded[1].created_at, at_offset(1));
        assert_eq!(seeded[1].attributes["incremental_id"]["numerical_id"], 4);
        assert_eq!(seeded[1].attributes["incremental_id"]["space_id"], "default");
    }
}
