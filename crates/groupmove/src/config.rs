//! Configuration for the GroupMove node.
//!
//! This module provides the [`Config`] struct for configuring a GroupMove node.
//! Configuration includes the storage path, the local participant, the relay URL
//! and the sync cadence.
//!
//! # Example
//!
//! ```rust
//! use groupmove::Config;
//!
//! // Simple configuration with just a storage path
//! let config = Config::new("/path/to/storage");
//!
//! // Full configuration with builder pattern
//! let config = Config::new("/path/to/storage")
//!     .with_participant_name("Morgan")
//!     .with_relay_url("https://relay.example.com")
//!     .with_sync_interval(60)
//!     .with_push_batch_size(100);
//!
//! // Default configuration (uses platform-specific data directory)
//! let config = Config::default();
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::ParticipantId;
use crate::{DEFAULT_PULL_BATCH_LIMIT, DEFAULT_PUSH_BATCH_SIZE, DEFAULT_SYNC_INTERVAL_SECS};

/// Configuration for the GroupMove node.
///
/// # Storage Layout
///
/// ```text
/// {storage_path}/
/// ├── participant       # Local participant id (UUID text)
/// └── groupmove.db      # SQLite record store, outbox and pull cursors
/// ```
///
/// # Defaults
///
/// - `storage_path`: Platform-specific data directory + "groupmove"
/// - `participant_name`: `"Me"`
/// - `participant_id`: `None` (read from or written to the identity file)
/// - `relay_url`: `None` (local-only unless a channel is supplied)
/// - `sync_interval_secs`: 30 seconds
/// - `push_batch_size`: 200 records
/// - `pull_batch_limit`: 50 batches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to store data (record store, identity).
    ///
    /// This directory will be created if it doesn't exist.
    pub storage_path: PathBuf,

    /// Display name of the local participant.
    ///
    /// Used as the owner entry of share grants and offered as a move-item owner.
    pub participant_name: String,

    /// Explicit participant id.
    ///
    /// A second device of the same user sets this to the id of the first one so
    /// both write as the same participant. When `None`, the id stored in the
    /// identity file is used, or a fresh one is generated.
    pub participant_id: Option<ParticipantId>,

    /// Base URL of a `groupmove-relay` server, e.g. `https://relay.example.com`.
    pub relay_url: Option<String>,

    /// Sync interval in seconds.
    ///
    /// The background loop pushes the outbound queue and pulls every subscribed
    /// stream at this interval.
    pub sync_interval_secs: u64,

    /// Maximum number of queued change records read per push.
    pub push_batch_size: usize,

    /// Maximum number of batches requested per stream per pull.
    pub pull_batch_limit: usize,
}

impl Config {
    /// Create a new configuration with the given storage path
    #[must_use]
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            participant_name: "Me".to_string(),
            participant_id: None,
            relay_url: None,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            pull_batch_limit: DEFAULT_PULL_BATCH_LIMIT,
        }
    }

    /// Set the participant display name
    #[must_use]
    pub fn with_participant_name(mut self, name: impl Into<String>) -> Self {
        self.participant_name = name.into();
        self
    }

    /// Pin the participant id
    #[must_use]
    pub const fn with_participant_id(mut self, id: ParticipantId) -> Self {
        self.participant_id = Some(id);
        self
    }

    /// Set the relay URL
    #[must_use]
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    /// Set the sync interval
    #[must_use]
    pub const fn with_sync_interval(mut self, secs: u64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// Set the push batch size
    #[must_use]
    pub const fn with_push_batch_size(mut self, records: usize) -> Self {
        self.push_batch_size = records;
        self
    }

    /// Set the pull batch limit
    #[must_use]
    pub const fn with_pull_batch_limit(mut self, batches: usize) -> Self {
        self.pull_batch_limit = batches;
        self
    }

    /// Get the default storage path
    #[must_use]
    pub fn default_storage_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("groupmove")
    }

    /// Path to the participant identity file
    #[must_use]
    pub fn identity_path(&self) -> PathBuf {
        self.storage_path.join("participant")
    }

    /// Path to the SQLite database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage_path.join("groupmove.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::default_storage_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.relay_url.is_none());
        assert!(config.participant_id.is_none());
        assert_eq!(config.sync_interval_secs, DEFAULT_SYNC_INTERVAL_SECS);
        assert_eq!(config.push_batch_size, DEFAULT_PUSH_BATCH_SIZE);
        assert!(config.storage_path.ends_with("groupmove"));
    }

    #[test]
    fn test_config_builder() {
        let id = ParticipantId::new();
        let config = Config::new("/tmp/test")
            .with_participant_name("Morgan")
            .with_participant_id(id)
            .with_relay_url("https://example.com")
            .with_sync_interval(60)
            .with_pull_batch_limit(5);

        assert_eq!(config.participant_name, "Morgan");
        assert_eq!(config.participant_id, Some(id));
        assert_eq!(config.relay_url, Some("https://example.com".to_string()));
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.pull_batch_limit, 5);
    }

    #[test]
    fn test_config_paths() {
        let config = Config::new("/data/groupmove");
        assert_eq!(config.identity_path(), PathBuf::from("/data/groupmove/participant"));
        assert_eq!(config.database_path(), PathBuf::from("/data/groupmove/groupmove.db"));
    }
}
