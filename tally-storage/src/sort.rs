//! Sort key extraction for find requests.

use std::cmp::Ordering;

use serde_json::Value;
use tally_core::{lookup_path, SavedObject, SortOrder, StorageError, Timestamp};

/// Comparable value pulled from a saved object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortKey {
    Number(f64),
    Time(Timestamp),
    Text(String),
}

impl SortKey {
    fn rank(&self) -> u8 {
        match self {
            SortKey::Number(_) => 0,
            SortKey::Time(_) => 1,
            SortKey::Text(_) => 2,
        }
    }

    fn cmp_key(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Time(a), SortKey::Time(b)) => a.cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Where a sort field is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SortField {
    CreatedAt,
    UpdatedAt,
    Id,
    Type,
    Attribute(Vec<String>),
}

impl SortField {
    /// Root envelope fields win; anything else is an attribute path, with or
    /// without a leading `attributes.`.
    pub(crate) fn parse(field: &str) -> Result<Self, StorageError> {
        let field = field.trim();
        let parsed = match field {
            "created_at" => SortField::CreatedAt,
            "updated_at" => SortField::UpdatedAt,
            "id" => SortField::Id,
            "type" => SortField::Type,
            _ => {
                let path = field.strip_prefix("attributes.").unwrap_or(field);
                let segments: Vec<String> = path.split('.').map(str::to_string).collect();
                if path.is_empty() || segments.iter().any(String::is_empty) {
                    return Err(StorageError::InvalidSortField {
                        field: field.to_string(),
                    });
                }
                SortField::Attribute(segments)
            }
        };
        Ok(parsed)
    }

    pub(crate) fn key_of(&self, object: &SavedObject) -> Result<Option<SortKey>, StorageError> {
        let key = match self {
            SortField::CreatedAt => Some(SortKey::Time(object.created_at)),
            SortField::UpdatedAt => Some(SortKey::Time(object.updated_at)),
            SortField::Id => Some(SortKey::Text(object.id.clone())),
            SortField::Type => Some(SortKey::Text(object.object_type.clone())),
            SortField::Attribute(path) => {
                match lookup_path(&object.attributes, path.as_slice()) {
                    None | Some(Value::Null) => None,
                    Some(Value::Number(n)) => n.as_f64().map(SortKey::Number),
                    Some(Value::Bool(b)) => Some(SortKey::Number(if *b { 1.0 } else { 0.0 })),
                    Some(Value::String(s)) => Some(SortKey::Text(s.clone())),
                    Some(Value::Array(_)) | Some(Value::Object(_)) => {
                        return Err(StorageError::InvalidSortField {
                            field: path.join("."),
                        })
                    }
                }
            }
        };
        Ok(key)
    }
}

/// Compare two optional keys. Missing values sort last in both directions.
pub(crate) fn compare(a: &Option<SortKey>, b: &Option<SortKey>, order: SortOrder) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match order {
            SortOrder::Asc => a.cmp_key(b),
            SortOrder::Desc => b.cmp_key(a),
        },
    }
}
