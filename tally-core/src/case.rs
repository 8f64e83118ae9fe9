//! Case domain types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{SavedObject, Timestamp};

/// Saved-object type of case records.
pub const CASE_SAVED_OBJECT: &str = "cases";

/// Saved-object type of the auxiliary per-namespace id counter.
pub const CASE_ID_INCREMENTER_SAVED_OBJECT: &str = "cases-incrementing-id";

/// Attribute holding the assigned incremental id on a case.
pub const INCREMENTAL_ID_FIELD: &str = "incremental_id";

/// Per-namespace sequential id of a case.
///
/// Assigned once by the background assignment task and never changed after.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncrementalId {
    pub numerical_id: u64,
    pub space_id: String,
}

impl IncrementalId {
    pub fn new(numerical_id: u64, space_id: impl Into<String>) -> Self {
        Self {
            numerical_id,
            space_id: space_id.into(),
        }
    }
}

/// Persisted case attributes.
///
/// Only `incremental_id` matters to id assignment; the remaining attributes
/// are carried so records survive a decode/encode cycle unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaseAttributes {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_id: Option<IncrementalId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CaseAttributes {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn has_incremental_id(&self) -> bool {
        self.incremental_id.is_some()
    }
}

/// A case record as returned by the store.
pub type CaseSavedObject = SavedObject<CaseAttributes>;

/// Attributes of the auxiliary incrementer object.
///
/// This is a cache of the highest id handed out in a namespace. The source of
/// truth is always the highest id present on a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseIdIncrementerAttributes {
    pub last_id: u64,
    /// Creation time, epoch milliseconds.
    #[serde(rename = "@timestamp")]
    pub timestamp: i64,
    /// Last write time, epoch milliseconds.
    pub updated_at: i64,
}

impl CaseIdIncrementerAttributes {
    pub fn new(last_id: u64, now_millis: i64) -> Self {
        Self {
            last_id,
            timestamp: now_millis,
            updated_at: now_millis,
        }
    }
}

/// An incrementer record as returned by the store.
pub type CaseIdIncrementerSavedObject = SavedObject<CaseIdIncrementerAttributes>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_case_attributes_preserve_unknown_fields() {
        let raw = json!({
            "title": "Lateral movement",
            "severity": "high",
            "connector": { "id": "none" }
        });
        let attrs: CaseAttributes = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(attrs.title, "Lateral movement");
        assert!(!attrs.has_incremental_id());
        assert_eq!(attrs.extra["severity"], "high");

        let back = serde_json::to_value(&attrs).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_incremental_id_composite_shape() {
        let attrs = CaseAttributes {
            incremental_id: Some(IncrementalId::new(12, "space-a")),
            ..CaseAttributes::new("x")
        };
        let value = serde_json::to_value(&attrs).unwrap();
        assert_eq!(
            value["incremental_id"],
            json!({ "numerical_id": 12, "space_id": "space-a" })
        );
    }

    #[test]
    fn test_incrementer_timestamp_field_name() {
        let attrs = CaseIdIncrementerAttributes::new(7, 1_700_000_000_000);
        let value = serde_json::to_value(&attrs).unwrap();
        assert_eq!(value["@timestamp"], 1_700_000_000_000i64);
        assert_eq!(value["last_id"], 7);
    }
}
