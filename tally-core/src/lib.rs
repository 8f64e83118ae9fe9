//! Tally Core - Entity Types
//!
//! Pure data structures shared by the store, the task manager and the case
//! id assignment service. No I/O lives here.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod case;
pub mod config;
pub mod error;
pub mod filter;
pub mod saved_object;

pub use case::{
    CaseAttributes, CaseIdIncrementerAttributes, CaseIdIncrementerSavedObject, CaseSavedObject,
    IncrementalId, CASE_ID_INCREMENTER_SAVED_OBJECT, CASE_SAVED_OBJECT, INCREMENTAL_ID_FIELD,
};
pub use config::RetryPolicy;
pub use error::{
    ConfigError, IncrementalIdError, StorageError, TallyError, TallyResult, TaskError,
};
pub use filter::{lookup_path, FilterExpr};
pub use saved_object::{
    resolve_namespace, BulkDeleteResponse, BulkDeleteStatus, CreateOptions, FindOptions,
    FindResponse, ObjectRef, SavedObject, SortOrder, UpdateOptions, ALL_NAMESPACES,
    DEFAULT_NAMESPACE, MAX_PER_PAGE,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new saved-object id (UUIDv7, timestamp-sortable).
pub fn new_object_id() -> String {
    Uuid::now_v7().to_string()
}
