//! Per-namespace incrementer objects.
//!
//! An incrementer records the highest id handed out in its namespace. It is
//! only a cache: the assignment service always derives the counter from the
//! cases themselves and uses the incrementer to avoid regressing when the
//! highest-numbered case has since been deleted.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tally_core::{
    CaseIdIncrementerAttributes, CaseIdIncrementerSavedObject, CreateOptions, FindOptions,
    ObjectRef, TallyResult, UpdateOptions, CASE_ID_INCREMENTER_SAVED_OBJECT, MAX_PER_PAGE,
};
use tally_storage::SavedObjectsClient;

/// Reads and reconciles incrementer objects.
#[derive(Clone)]
pub struct CaseIdIncrementerStore {
    client: Arc<dyn SavedObjectsClient>,
}

impl CaseIdIncrementerStore {
    pub fn new(client: Arc<dyn SavedObjectsClient>) -> Self {
        Self { client }
    }

    /// Return the namespace's incrementer, creating or reconciling it so that
    /// its `last_id` is at least `latest_applied_id`.
    pub async fn get_or_create(
        &self,
        namespace: &str,
        latest_applied_id: u64,
    ) -> TallyResult<CaseIdIncrementerSavedObject> {
        let response = self
            .client
            .find(
                &FindOptions::new(CASE_ID_INCREMENTER_SAVED_OBJECT)
                    .with_paging(MAX_PER_PAGE, 1)
                    .with_namespaces([namespace]),
            )
            .await?
            .decode::<CaseIdIncrementerAttributes>()?;

        let mut incrementers = response.saved_objects;
        match incrementers.len() {
            0 => self.create(namespace, latest_applied_id).await,
            1 => {
                let incrementer = incrementers.remove(0);
                if latest_applied_id > incrementer.attributes.last_id {
                    self.increment_counter(incrementer, latest_applied_id, namespace)
                        .await
                } else {
                    Ok(incrementer)
                }
            }
            count => {
                tracing::error!(
                    namespace,
                    count,
                    "Only 1 incrementer should exist, but multiple incrementers found. Resolving to max incrementer."
                );
                self.resolve_multiple(incrementers, latest_applied_id, namespace)
                    .await
            }
        }
    }

    /// Keep the incrementer with the highest `last_id`, delete the others and
    /// raise the survivor to `latest_applied_id` when it lags behind.
    pub async fn resolve_multiple(
        &self,
        incrementers: Vec<CaseIdIncrementerSavedObject>,
        latest_applied_id: u64,
        namespace: &str,
    ) -> TallyResult<CaseIdIncrementerSavedObject> {
        let keep_index = incrementers
            .iter()
            .enumerate()
            .fold(None::<(usize, u64)>, |best, (index, incrementer)| match best {
                Some((_, best_id)) if best_id >= incrementer.attributes.last_id => best,
                _ => Some((index, incrementer.attributes.last_id)),
            })
            .map(|(index, _)| index);

        let Some(keep_index) = keep_index else {
            return self.create(namespace, latest_applied_id).await;
        };

        let mut survivor = None;
        let mut to_delete = Vec::new();
        for (index, incrementer) in incrementers.into_iter().enumerate() {
            if index == keep_index {
                survivor = Some(incrementer);
            } else {
                to_delete.push(ObjectRef {
                    object_type: CASE_ID_INCREMENTER_SAVED_OBJECT.to_string(),
                    id: incrementer.id,
                    namespace: Some(namespace.to_string()),
                });
            }
        }

        if !to_delete.is_empty() {
            let response = self.client.bulk_delete(&to_delete).await?;
            for failed in response.failed() {
                tracing::warn!(
                    namespace,
                    incrementer_id = %failed.id,
                    error = ?failed.error,
                    "Failed to delete surplus incrementer"
                );
            }
        }

        match survivor {
            Some(incrementer) if latest_applied_id > incrementer.attributes.last_id => {
                self.increment_counter(incrementer, latest_applied_id, namespace)
                    .await
            }
            Some(incrementer) => Ok(incrementer),
            None => self.create(namespace, latest_applied_id).await,
        }
    }

    pub async fn create(
        &self,
        namespace: &str,
        last_id: u64,
    ) -> TallyResult<CaseIdIncrementerSavedObject> {
        let attributes = CaseIdIncrementerAttributes::new(last_id, Utc::now().timestamp_millis());
        let created = self
            .client
            .create(
                CASE_ID_INCREMENTER_SAVED_OBJECT,
                serde_json::to_value(&attributes)?,
                &CreateOptions::in_namespace(namespace),
            )
            .await?;
        tracing::debug!(namespace, last_id, incrementer_id = %created.id, "Created incrementer");
        Ok(created.decode()?)
    }

    /// Persist a new `last_id`. The write is versioned against `incrementer`.
    pub async fn increment_counter(
        &self,
        incrementer: CaseIdIncrementerSavedObject,
        last_id: u64,
        namespace: &str,
    ) -> TallyResult<CaseIdIncrementerSavedObject> {
        let updated_at = Utc::now().timestamp_millis();
        let result = self
            .client
            .update(
                CASE_ID_INCREMENTER_SAVED_OBJECT,
                &incrementer.id,
                json!({ "last_id": last_id, "updated_at": updated_at }),
                &UpdateOptions {
                    namespace: Some(namespace.to_string()),
                    version: incrementer.version.clone(),
                },
            )
            .await;

        match result {
            Ok(updated) => Ok(updated.decode()?),
            Err(e) => {
                tracing::error!(
                    namespace,
                    incrementer_id = %incrementer.id,
                    error = %e,
                    "Unable to update incrementer"
                );
                Err(e)
            }
        }
    }
}
