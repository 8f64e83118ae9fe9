//! Async saved-object client trait.

use ::async_trait::async_trait;
use serde_json::Value;
use tally_core::{
    BulkDeleteResponse, CreateOptions, FindOptions, FindResponse, ObjectRef, SavedObject,
    TallyResult, UpdateOptions,
};

/// Namespaced, versioned document store.
///
/// All operations are scoped to a single namespace except `find`, which may
/// search several (or `*` for all of them).
#[async_trait]
pub trait SavedObjectsClient: Send + Sync {
    /// Search objects of one type with an optional filter, sort and paging.
    async fn find(&self, options: &FindOptions) -> TallyResult<FindResponse>;

    /// Fetch a single object. Objects outside `namespace` are not found.
    async fn get(
        &self,
        object_type: &str,
        id: &str,
        namespace: Option<&str>,
    ) -> TallyResult<SavedObject>;

    /// Create an object. Fails with a conflict if the id is taken.
    async fn create(
        &self,
        object_type: &str,
        attributes: Value,
        options: &CreateOptions,
    ) -> TallyResult<SavedObject>;

    /// Merge `attributes` into an existing object.
    ///
    /// When `options.version` is set the write only succeeds if it matches
    /// the stored version.
    async fn update(
        &self,
        object_type: &str,
        id: &str,
        attributes: Value,
        options: &UpdateOptions,
    ) -> TallyResult<SavedObject>;

    /// Delete several objects, reporting per-object outcomes.
    async fn bulk_delete(&self, objects: &[ObjectRef]) -> TallyResult<BulkDeleteResponse>;
}
