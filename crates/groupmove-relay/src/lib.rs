//! GroupMove relay library
//!
//! Re-exports the relay modules for use by the binary and integration tests.

use std::sync::Arc;

pub mod api;
pub mod db;

/// Shared application state
pub struct AppState {
    /// Batch streams, writers and parked shares
    pub db: Arc<db::Database>,
}
