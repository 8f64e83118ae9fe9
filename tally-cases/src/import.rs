//! Import hook for case saved objects.

use tally_core::{lookup_path, IncrementalIdError, SavedObject, TallyResult, INCREMENTAL_ID_FIELD};

/// Outcome of an accepted import batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportHookResult {
    pub warnings: Vec<String>,
}

/// Reject the batch if any case already carries an incremental id.
///
/// Imported ids would collide with ids assigned in the target namespace, so
/// cases must arrive without one and be numbered by the background task.
pub fn handle_import(objects: &[SavedObject]) -> TallyResult<ImportHookResult> {
    let offending = objects
        .iter()
        .filter(|object| {
            lookup_path(&object.attributes, &[INCREMENTAL_ID_FIELD])
                .map(|value| !value.is_null())
                .unwrap_or(false)
        })
        .count();

    if offending > 0 {
        tracing::warn!(offending, total = objects.len(), "Rejecting case import");
        return Err(IncrementalIdError::ImportRejected { count: offending }.into());
    }
    Ok(ImportHookResult::default())
}
