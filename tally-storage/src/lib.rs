//! Tally Storage - Saved-Object Store Trait and In-Memory Implementation
//!
//! Defines the store capability the id assignment service and the task
//! manager consume. Production deployments plug in their own backend.

pub mod client;
pub mod in_memory;
mod sort;

pub use client::SavedObjectsClient;
pub use in_memory::InMemorySavedObjects;
