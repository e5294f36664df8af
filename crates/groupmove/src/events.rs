//! Store change notifications.
//!
//! The [`RecordStore`](crate::RecordStore) publishes one [`StoreEvent`] per
//! committed entity change on a `tokio::sync::broadcast` channel. Observers
//! subscribe with [`RecordStore::subscribe`](crate::RecordStore::subscribe);
//! a lagging observer misses events but never blocks the store.

use serde::{Deserialize, Serialize};

use crate::model::EntityRef;

/// Capacity of the broadcast channel
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entity created
    Created,
    /// Entity fields changed
    Updated,
    /// Entity deleted
    Deleted,
}

/// Where the change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A local transaction
    Local,
    /// A pulled remote batch or an accepted share
    Remote,
}

/// One committed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreEvent {
    /// The entity that changed
    pub entity: EntityRef,
    /// What happened to it
    pub kind: ChangeKind,
    /// Local or remote
    pub origin: ChangeOrigin,
}

impl StoreEvent {
    pub(crate) const fn local(entity: EntityRef, kind: ChangeKind) -> Self {
        Self { entity, kind, origin: ChangeOrigin::Local }
    }

    pub(crate) const fn remote(entity: EntityRef, kind: ChangeKind) -> Self {
        Self { entity, kind, origin: ChangeOrigin::Remote }
    }
}
