//! Service Layer
//!
//! Business logic of incremental id assignment. Services talk to the store
//! only through `SavedObjectsClient`.

mod incremental_id;
mod incrementer;

pub use incremental_id::*;
pub use incrementer::*;
