//! In-memory saved-object store.
//!
//! A complete, namespaced and versioned implementation of
//! `SavedObjectsClient`. Used by tests and by development setups that do not
//! have a durable backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tally_core::{
    new_object_id, resolve_namespace, BulkDeleteResponse, BulkDeleteStatus, CreateOptions,
    FilterExpr, FindOptions, FindResponse, ObjectRef, SavedObject, StorageError, TallyError,
    TallyResult, UpdateOptions, MAX_PER_PAGE,
};

use crate::client::SavedObjectsClient;
use crate::sort::{compare, SortField};

/// (namespace, type, id)
type ObjectKey = (String, String, String);

#[derive(Debug, Clone)]
struct StoredObject {
    object: SavedObject,
    /// Insertion order, used to break sort ties deterministically.
    seq: u64,
}

/// In-memory store keyed by namespace, type and id.
#[derive(Debug, Default, Clone)]
pub struct InMemorySavedObjects {
    objects: Arc<RwLock<HashMap<ObjectKey, StoredObject>>>,
    next_seq: Arc<AtomicU64>,
    next_version: Arc<AtomicU64>,
}

impl InMemorySavedObjects {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all namespaces and types.
    pub fn len(&self) -> TallyResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> TallyResult<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Remove every object.
    pub fn clear(&self) -> TallyResult<()> {
        self.write()?.clear();
        Ok(())
    }

    fn read(
        &self,
    ) -> TallyResult<std::sync::RwLockReadGuard<'_, HashMap<ObjectKey, StoredObject>>> {
        self.objects
            .read()
            .map_err(|_| TallyError::Storage(StorageError::LockPoisoned))
    }

    fn write(
        &self,
    ) -> TallyResult<std::sync::RwLockWriteGuard<'_, HashMap<ObjectKey, StoredObject>>> {
        self.objects
            .write()
            .map_err(|_| TallyError::Storage(StorageError::LockPoisoned))
    }

    fn mint_version(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key(namespace: Option<&str>, object_type: &str, id: &str) -> ObjectKey {
        (
            resolve_namespace(namespace).to_string(),
            object_type.to_string(),
            id.to_string(),
        )
    }
}

fn not_found(object_type: &str, id: &str) -> TallyError {
    TallyError::Storage(StorageError::NotFound {
        object_type: object_type.to_string(),
        id: id.to_string(),
    })
}

fn into_object_map(attributes: Value) -> TallyResult<Map<String, Value>> {
    match attributes {
        Value::Object(map) => Ok(map),
        other => Err(TallyError::Storage(StorageError::Serialization {
            reason: format!("attributes must be a JSON object, got {other}"),
        })),
    }
}

#[async_trait]
impl SavedObjectsClient for InMemorySavedObjects {
    async fn find(&self, options: &FindOptions) -> TallyResult<FindResponse> {
        let filter = match options.filter.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                let expr = FilterExpr::parse(raw)?;
                expr.validate_type(&options.object_type)?;
                Some(expr)
            }
            _ => None,
        };
        let sort_field = options
            .sort_field
            .as_deref()
            .map(SortField::parse)
            .transpose()?;

        let all_namespaces = options.searches_all_namespaces();
        let namespaces: Vec<&str> = if options.namespaces.is_empty() {
            vec![resolve_namespace(None)]
        } else {
            options.namespaces.iter().map(String::as_str).collect()
        };

        let objects = self.read()?;
        let mut hits: Vec<&StoredObject> = objects
            .iter()
            .filter(|((namespace, object_type, _), _)| {
                object_type == &options.object_type
                    && (all_namespaces || namespaces.contains(&namespace.as_str()))
            })
            .map(|(_, stored)| stored)
            .filter(|stored| {
                filter
                    .as_ref()
                    .map(|expr| expr.matches(&stored.object.attributes))
                    .unwrap_or(true)
            })
            .collect();

        match &sort_field {
            Some(field) => {
                let mut keyed = hits
                    .into_iter()
                    .map(|stored| Ok((field.key_of(&stored.object)?, stored)))
                    .collect::<Result<Vec<_>, StorageError>>()?;
                keyed.sort_by(|(ka, a), (kb, b)| {
                    compare(ka, kb, options.sort_order).then(a.seq.cmp(&b.seq))
                });
                hits = keyed.into_iter().map(|(_, stored)| stored).collect();
            }
            None => hits.sort_by_key(|stored| stored.seq),
        }

        let total = hits.len();
        let per_page = options.per_page.min(MAX_PER_PAGE);
        let page = options.page.max(1);
        let saved_objects = hits
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .map(|stored| stored.object.clone())
            .collect();

        Ok(FindResponse {
            page,
            per_page,
            total,
            saved_objects,
        })
    }

    async fn get(
        &self,
        object_type: &str,
        id: &str,
        namespace: Option<&str>,
    ) -> TallyResult<SavedObject> {
        self.read()?
            .get(&Self::key(namespace, object_type, id))
            .map(|stored| stored.object.clone())
            .ok_or_else(|| not_found(object_type, id))
    }

    async fn create(
        &self,
        object_type: &str,
        attributes: Value,
        options: &CreateOptions,
    ) -> TallyResult<SavedObject> {
        let attributes = Value::Object(into_object_map(attributes)?);
        let id = options.id.clone().unwrap_or_else(new_object_id);
        let namespace = resolve_namespace(options.namespace.as_deref()).to_string();
        let key = (namespace.clone(), object_type.to_string(), id.clone());

        let mut objects = self.write()?;
        if objects.contains_key(&key) {
            return Err(TallyError::Storage(StorageError::Conflict {
                object_type: object_type.to_string(),
                id,
            }));
        }

        let now = Utc::now();
        let object = SavedObject {
            id,
            object_type: object_type.to_string(),
            attributes,
            namespaces: vec![namespace],
            version: Some(self.mint_version()),
            created_at: options.created_at.unwrap_or(now),
            updated_at: now,
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        objects.insert(
            key,
            StoredObject {
                object: object.clone(),
                seq,
            },
        );
        Ok(object)
    }

    async fn update(
        &self,
        object_type: &str,
        id: &str,
        attributes: Value,
        options: &UpdateOptions,
    ) -> TallyResult<SavedObject> {
        let partial = into_object_map(attributes)?;
        let key = Self::key(options.namespace.as_deref(), object_type, id);

        let mut objects = self.write()?;
        let stored = objects.get_mut(&key).ok_or_else(|| not_found(object_type, id))?;

        if let Some(expected) = options.version.as_deref() {
            if stored.object.version.as_deref() != Some(expected) {
                tracing::debug!(
                    object_type,
                    id,
                    expected,
                    actual = ?stored.object.version,
                    "Rejecting update with stale version"
                );
                return Err(TallyError::Storage(StorageError::Conflict {
                    object_type: object_type.to_string(),
                    id: id.to_string(),
                }));
            }
        }

        match &mut stored.object.attributes {
            Value::Object(current) => current.extend(partial),
            other => *other = Value::Object(partial),
        }
        stored.object.version = Some(self.mint_version());
        stored.object.updated_at = Utc::now();

        Ok(stored.object.clone())
    }

    async fn bulk_delete(&self, objects: &[ObjectRef]) -> TallyResult<BulkDeleteResponse> {
        let mut store = self.write()?;
        let statuses = objects
            .iter()
            .map(|target| {
                let key = Self::key(target.namespace.as_deref(), &target.object_type, &target.id);
                let removed = store.remove(&key).is_some();
                BulkDeleteStatus {
                    id: target.id.clone(),
                    object_type: target.object_type.clone(),
                    success: removed,
                    error: (!removed).then(|| {
                        StorageError::NotFound {
                            object_type: target.object_type.clone(),
                            id: target.id.clone(),
                        }
                        .to_string()
                    }),
                }
            })
            .collect();
        Ok(BulkDeleteResponse { statuses })
    }
}

// ============================================================================
// TESTS
// ============================================================================
