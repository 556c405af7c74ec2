//! Durable store for offline support.
//!
//! Two independent collections live here:
//! - `api_data`: last good payload per resource path, read when the network fails
//! - `pending_requests`: FIFO queue of mutations made while offline
//!
//! The worker's named response caches share the same database.

mod storage;
mod types;

pub use storage::{OfflineStore, ResponseCaches, SqliteStore};
pub use types::{CachedResource, MutationBody, NewMutation, PendingMutation};
