//! Saved-object envelope and store request/response types

use crate::{StorageError, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Namespace used when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Wildcard namespace matching every namespace in a find request.
pub const ALL_NAMESPACES: &str = "*";

/// Upper bound on `per_page` for a single find request.
pub const MAX_PER_PAGE: usize = 10_000;

/// A namespaced, versioned document in the saved-object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedObject<A = serde_json::Value> {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub attributes: A,
    /// Namespaces the object lives in. Case objects belong to exactly one.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Optimistic-concurrency token, changes on every write.
    pub version: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl<A> SavedObject<A> {
    /// The single namespace this object belongs to, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespaces.first().map(String::as_str)
    }

    /// Replace the attributes, keeping the envelope.
    pub fn map_attributes<B>(self, f: impl FnOnce(A) -> B) -> SavedObject<B> {
        SavedObject {
            id: self.id,
            object_type: self.object_type,
            attributes: f(self.attributes),
            namespaces: self.namespaces,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Reference usable for deletes.
    pub fn to_ref(&self) -> ObjectRef {
        ObjectRef {
            object_type: self.object_type.clone(),
            id: self.id.clone(),
            namespace: self.namespace().map(str::to_string),
        }
    }
}

impl SavedObject<serde_json::Value> {
    /// Decode the raw JSON attributes into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<SavedObject<T>, StorageError> {
        let attributes = serde_json::from_value(self.attributes.clone())?;
        Ok(self.clone().map_attributes(|_| attributes))
    }
}

/// Sort direction for find requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Options for `SavedObjectsClient::find`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(rename = "type")]
    pub object_type: String,
    /// KQL-style filter, e.g. `cases.attributes.incremental_id: *`
    pub filter: Option<String>,
    pub sort_field: Option<String>,
    pub sort_order: SortOrder,
    pub per_page: usize,
    /// 1-based page number.
    pub page: usize,
    /// Namespaces to search. `["*"]` searches all of them, empty means default.
    pub namespaces: Vec<String>,
}

impl FindOptions {
    /// Find objects of a type in the default namespace, first page of 20.
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            filter: None,
            sort_field: None,
            sort_order: SortOrder::Asc,
            per_page: 20,
            page: 1,
            namespaces: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = order;
        self
    }

    pub fn with_paging(mut self, per_page: usize, page: usize) -> Self {
        self.per_page = per_page;
        self.page = page;
        self
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the request spans every namespace.
    pub fn searches_all_namespaces(&self) -> bool {
        self.namespaces.iter().any(|ns| ns == ALL_NAMESPACES)
    }
}

/// One page of find results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindResponse<A = serde_json::Value> {
    pub page: usize,
    pub per_page: usize,
    /// Number of matches before paging.
    pub total: usize,
    pub saved_objects: Vec<SavedObject<A>>,
}

impl FindResponse<serde_json::Value> {
    /// Decode every hit into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<FindResponse<T>, StorageError> {
        let saved_objects = self
            .saved_objects
            .iter()
            .map(SavedObject::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FindResponse {
            page: self.page,
            per_page: self.per_page,
            total: self.total,
            saved_objects,
        })
    }
}

/// Options for `SavedObjectsClient::create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateOptions {
    pub namespace: Option<String>,
    /// Explicit id; generated when absent.
    pub id: Option<String>,
    /// Explicit creation time for imports and migrations.
    pub created_at: Option<Timestamp>,
}

impl CreateOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }
}

/// Options for `SavedObjectsClient::update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateOptions {
    pub namespace: Option<String>,
    /// When set, the update fails with a conflict unless it matches.
    pub version: Option<String>,
}

/// Pointer to a saved object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "type")]
    pub object_type: String,
    pub id: String,
    pub namespace: Option<String>,
}

/// Per-object outcome of a bulk delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDeleteStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Result of a bulk delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDeleteResponse {
    pub statuses: Vec<BulkDeleteStatus>,
}

impl BulkDeleteResponse {
    pub fn failed(&self) -> impl Iterator<Item = &BulkDeleteStatus> {
        self.statuses.iter().filter(|s| !s.success)
    }
}

/// Resolve the namespace of a single-namespace request.
pub fn resolve_namespace(namespace: Option<&str>) -> &str {
    match namespace {
        Some(ns) if !ns.is_empty() => ns,
        _ => DEFAULT_NAMESPACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn raw_object() -> SavedObject {
        SavedObject {
            id: "c1".to_string(),
            object_type: "cases".to_string(),
            attributes: json!({ "title": "Phishing", "incremental_id": { "numerical_id": 3, "space_id": "default" } }),
            namespaces: vec!["default".to_string()],
            version: Some("1".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Debug, Deserialize)]
    struct Partial {
        title: String,
    }

    #[test]
    fn test_decode_typed_view() {
        let so = raw_object();
        let typed: SavedObject<Partial> = so.decode().unwrap();
        assert_eq!(typed.attributes.title, "Phishing");
        assert_eq!(typed.namespace(), Some("default"));
        assert_eq!(typed.version.as_deref(), Some("1"));
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let mut so = raw_object();
        so.attributes = json!({ "title": 5 });
        let err = so.decode::<Partial>().unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn test_type_field_serializes_as_type() {
        let value = serde_json::to_value(raw_object()).unwrap();
        assert_eq!(value["type"], "cases");
        assert!(value.get("object_type").is_none());
    }

    #[test]
    fn test_find_options_builders() {
        let opts = FindOptions::new("cases")
            .with_filter("not cases.attributes.incremental_id: *")
            .with_sort("created_at", SortOrder::Asc)
            .with_paging(10_000, 1)
            .with_namespaces([ALL_NAMESPACES]);
        assert!(opts.searches_all_namespaces());
        assert_eq!(opts.per_page, 10_000);
        assert_eq!(opts.sort_field.as_deref(), Some("created_at"));
    }

    #[test]
    fn test_resolve_namespace_defaults() {
        assert_eq!(resolve_namespace(None), DEFAULT_NAMESPACE);
        assert_eq!(resolve_namespace(Some("")), DEFAULT_NAMESPACE);
        assert_eq!(resolve_namespace(Some("space-a")), "space-a");
    }
}
