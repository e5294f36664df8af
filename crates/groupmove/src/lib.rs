//! # GroupMove - Local-first household inventory with shared properties
//!
//! GroupMove keeps an inventory of properties (homes), their rooms and the
//! move-items in them. Every device holds the full graph locally; changes are
//! exchanged with collaborators through a replicated log, and concurrent
//! edits converge without a coordinating server.
//!
//! ## Features
//!
//! - **Offline-first**: reads and writes are local. `save()` makes them durable.
//! - **Deterministic merge**: field-level last-writer-wins by `(version, timestamp, origin)`.
//! - **Terminal deletes**: tombstones keep deleted entities from coming back.
//! - **Sharing**: per-property grants with read-only and read-write participants.
//! - **Durable replication**: an on-disk outbox and per-stream pull cursors.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use groupmove::{Color, Config, GroupMove, Money, NewMoveItem, DEFAULT_ROOMS};
//!
//! #[tokio::main]
//! async fn main() -> groupmove::Result<()> {
//!     let node = GroupMove::init(Config::new("/path/to/storage")).await?;
//!
//!     let home = node.properties().create_property_with_defaults(
//!         "Blair House",
//!         Color::default(),
//!         true,
//!         Some("2500".parse()?),
//!         &DEFAULT_ROOMS,
//!     )?;
//!     let kitchen = &node.store().rooms(home.id)[0];
//!     node.store().create_move_item(kitchen.id, home.id, NewMoveItem {
//!         name: "Microwave".into(),
//!         price: Money::from_cents(89_99),
//!         ..Default::default()
//!     })?;
//!     node.store().save()?;
//!
//!     println!("used: {}", node.properties().compute_used_budget(home.id));
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Configuration for the GroupMove node
//! - [`error`]: Error types and Result alias
//! - [`model`]: Entities, identifiers and input types
//! - [`store`]: The transactional record store
//! - [`sharing`]: Share grants, invitations and permission queries
//! - [`ops`]: Property-level operations
//! - [`node`]: Main [`GroupMove`] node struct
//! - [`sync`]: Sync engine and replication channels
//!
//! ## Internal Modules
//!
//! - [`identity`]: Participant identity management
//! - [`journal`]: Change records and their field codec

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]

// =============================================================================
// Public modules - stable API
// =============================================================================

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod node;
pub mod ops;
pub mod sharing;
pub mod store;
pub mod sync;

// =============================================================================
// Internal modules - not part of stable API
// =============================================================================

#[doc(hidden)]
pub mod identity;

#[doc(hidden)]
pub mod journal;

// =============================================================================
// Public re-exports - the primary public API
// =============================================================================

pub use config::Config;
pub use error::{Error, Result};
pub use events::{ChangeKind, ChangeOrigin, StoreEvent};
pub use journal::{ChangeBatch, ChangeOp, ChangeRecord, Delivery, Stamp};
pub use model::{
    AcceptanceStatus, Color, EntityKind, EntityPatch, EntityRef, ItemId, ItemPatch, Money, MoveItem,
    NewMoveItem, NewProperty, Participant, ParticipantId, Permission, Property, PropertyId,
    PropertyPatch, Room, RoomId, RoomPatch, ShareGrant,
};
pub use node::GroupMove;
pub use ops::{GroupedItems, PropertyManager};
pub use sharing::{Invitation, ShareToken, SharingService};
pub use store::{RecordStore, Transaction};
pub use sync::{
    ApplyReport, HttpChannel, MemoryChannel, ReplicationChannel, ShareDirectory, SkippedRecord,
    SyncEngine, SyncReport, SyncStatus,
};

// =============================================================================
// Constants
// =============================================================================

/// Default sync interval in seconds.
///
/// Can be configured via [`Config::with_sync_interval`].
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Default number of queued change records read per push.
pub const DEFAULT_PUSH_BATCH_SIZE: usize = 200;

/// Default number of batches requested per stream per pull.
pub const DEFAULT_PULL_BATCH_LIMIT: usize = 50;

/// Default property color token.
pub const DEFAULT_COLOR: &str = "00A5E3";

/// Rooms offered for a new property.
pub const DEFAULT_ROOMS: [&str; 6] = ["Kitchen", "Living Room", "Bathroom", "Dining Room", "Bedroom 1", "Bedroom 2"];
