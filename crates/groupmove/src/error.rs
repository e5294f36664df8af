//! Error types for GroupMove.
//!
//! This module defines the [`enum@Error`] enum and [`Result`] type alias used throughout
//! the library.
//!
//! # Error Categories
//!
//! - [`Error::Validation`] - Bad input (empty name, non-permutation reorder, ...)
//! - [`Error::NotFound`] - Entity vanished, most likely deleted concurrently
//! - [`Error::RoomNotEmpty`] - Room still holds items and cascade was not confirmed
//! - [`Error::LastProperty`] - Refusing to delete the only remaining property
//! - [`Error::PermissionDenied`] - The local participant may not perform the write
//! - [`Error::Persistence`] - Durable write failed; in-memory state is kept for retry
//! - [`Error::Transport`] - Replication channel failure
//! - [`Error::Share`] - Share invitation failure
//! - [`Error::Corrupt`] - Unrecoverable store corruption, only raised while opening
//! - [`Error::Config`] - Configuration issues
//! - [`Error::Shutdown`] - Operation on a shut down node
//!
//! # Example
//!
//! ```rust,no_run
//! use groupmove::{Error, RecordStore, RoomId};
//!
//! # fn example(store: &RecordStore, room: RoomId) -> groupmove::Result<()> {
//! match store.delete_room(room, false) {
//!     Ok(()) => println!("room deleted"),
//!     Err(Error::RoomNotEmpty { items, .. }) => {
//!         println!("room still holds {items} items, ask before cascading");
//!     }
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::model::RoomId;

/// Result type alias for GroupMove operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in GroupMove operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Input failed validation
    #[error("validation failed: {0}")]
    Validation(Arc<str>),

    /// The entity no longer exists
    #[error("not found: {0}")]
    NotFound(Arc<str>),

    /// The room still holds items and cascading was not requested
    #[error("room {room} still holds {items} item(s)")]
    RoomNotEmpty {
        /// The room that was about to be deleted
        room: RoomId,
        /// Number of live items still assigned to it
        items: usize,
    },

    /// At least one property must remain
    #[error("cannot delete the last remaining property")]
    LastProperty,

    /// The local participant lacks the permission for this write
    #[error("permission denied: {0}")]
    PermissionDenied(Arc<str>),

    /// Durable storage failed
    #[error("persistence error: {0}")]
    Persistence(Arc<str>),

    /// The replication channel failed
    #[error("transport error: {0}")]
    Transport(Arc<str>),

    /// A share invitation could not be published or resolved
    #[error("share error: {0}")]
    Share(Arc<str>),

    /// Persisted data could not be decoded while opening the store
    #[error("store corrupted: {0}")]
    Corrupt(Arc<str>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Arc<str>),

    /// The node has been shut down
    #[error("node has been shut down")]
    Shutdown,
}

impl Error {
    /// Create a validation error
    #[inline]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(Arc::from(msg.into()))
    }

    /// Create a not-found error
    #[inline]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(Arc::from(msg.into()))
    }

    /// Create a permission error
    #[inline]
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(Arc::from(msg.into()))
    }

    /// Create a persistence error
    #[inline]
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(Arc::from(msg.into()))
    }

    /// Create a transport error
    #[inline]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(Arc::from(msg.into()))
    }

    /// Create a share error
    #[inline]
    pub fn share(msg: impl Into<String>) -> Self {
        Self::Share(Arc::from(msg.into()))
    }

    /// Create a corruption error
    #[inline]
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(Arc::from(msg.into()))
    }

    /// Create a configuration error
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(Arc::from(msg.into()))
    }

    /// Whether retrying the same call later may succeed without new input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Transport(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_not_empty_message_names_count() {
        let room = RoomId::new();
        let err = Error::RoomNotEmpty { room, items: 3 };
        assert!(err.to_string().contains("3 item(s)"));
        assert!(err.to_string().contains(&room.to_string()));
    }

    #[test]
    fn test_retryable_categories() {
        assert!(Error::persistence("disk full").is_retryable());
        assert!(Error::transport("offline").is_retryable());
        assert!(!Error::validation("empty name").is_retryable());
        assert!(!Error::LastProperty.is_retryable());
    }
}
