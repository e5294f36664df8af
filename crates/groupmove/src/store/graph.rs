//! In-memory entity graph behind the record store.
//!
//! The graph is cheap to clone (images are reference-counted `Bytes`), which is
//! what makes transactions and batch application all-or-nothing: work happens on
//! a copy that is swapped in only on success.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::journal::{ChangeRecord, Fields, Stamp};
use crate::model::{
    EntityKind, EntityRef, ItemId, MoveItem, Property, PropertyId, Room, RoomId, ShareGrant,
};

/// Per-field stamps of one live entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntityClock {
    pub(crate) fields: BTreeMap<String, Stamp>,
}

impl EntityClock {
    /// Clock where every field in `fields` carries `stamp`
    pub(crate) fn stamped(fields: &Fields, stamp: Stamp) -> Self {
        Self {
            fields: fields.keys().map(|name| (name.clone(), stamp)).collect(),
        }
    }

    /// Highest version across fields
    pub(crate) fn version(&self) -> u64 {
        self.fields.values().map(|s| s.version).max().unwrap_or(0)
    }

    /// Distinct stamps, oldest first
    pub(crate) fn stamps(&self) -> BTreeSet<Stamp> {
        self.fields.values().copied().collect()
    }
}

/// Durable marker of a deleted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Tombstone {
    pub(crate) property: PropertyId,
    pub(crate) stamp: Stamp,
}

/// Why a remote record is waiting instead of applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum InboxReason {
    /// Its parent or target has not arrived yet
    Parked,
    /// The local entity has unsaved edits and the record is not strictly newer
    Deferred,
}

impl InboxReason {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Parked => "parked",
            Self::Deferred => "deferred",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "parked" => Some(Self::Parked),
            "deferred" => Some(Self::Deferred),
            _ => None,
        }
    }
}

/// A remote record waiting to be retried.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InboxEntry {
    pub(crate) reason: InboxReason,
    pub(crate) record: ChangeRecord,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Graph {
    pub(crate) properties: HashMap<PropertyId, Property>,
    pub(crate) rooms: HashMap<RoomId, Room>,
    pub(crate) items: HashMap<ItemId, MoveItem>,
    pub(crate) grants: HashMap<PropertyId, ShareGrant>,
    pub(crate) clocks: HashMap<EntityRef, EntityClock>,
    pub(crate) tombstones: HashMap<EntityRef, Tombstone>,
    /// Entities whose remote create was refused; records about them are skipped
    pub(crate) rejected: BTreeSet<EntityRef>,
    pub(crate) cursors: HashMap<PropertyId, u64>,
    pub(crate) inbox: Vec<InboxEntry>,
    /// Items the user deleted in the UI but has not committed yet; never persisted
    pub(crate) pending_deletes: BTreeSet<ItemId>,
    /// Entities with unsaved local changes
    pub(crate) dirty: BTreeSet<EntityRef>,
    /// Unsaved change records, in emission order
    pub(crate) outbox: Vec<ChangeRecord>,
    /// Whether the active flag changed since the last save
    pub(crate) active_dirty: bool,
}

impl Graph {
    pub(crate) fn has_unsaved_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.outbox.is_empty() || self.active_dirty
    }

    /// Properties ordered by creation time
    pub(crate) fn properties_by_date(&self) -> Vec<&Property> {
        let mut properties: Vec<&Property> = self.properties.values().collect();
        properties.sort_by(|a, b| (a.date_created, a.id).cmp(&(b.date_created, b.id)));
        properties
    }

    pub(crate) fn active_property(&self) -> Option<&Property> {
        self.properties.values().find(|p| p.active)
    }

    /// Rooms of a property in display order
    pub(crate) fn rooms_of(&self, property: PropertyId) -> Vec<&Room> {
        let mut rooms: Vec<&Room> = self.rooms.values().filter(|r| r.property == property).collect();
        rooms.sort_by(|a, b| (a.order_index, a.id).cmp(&(b.order_index, b.id)));
        rooms
    }

    pub(crate) fn items_of(&self, property: PropertyId) -> Vec<&MoveItem> {
        self.items.values().filter(|i| i.property == property).collect()
    }

    /// Items in a room, newest first
    pub(crate) fn items_in(&self, room: RoomId) -> Vec<&MoveItem> {
        let mut items: Vec<&MoveItem> = self.items.values().filter(|i| i.room == room).collect();
        items.sort_by(|a, b| (b.date_created, b.id).cmp(&(a.date_created, a.id)));
        items
    }

    pub(crate) fn contains(&self, entity: &EntityRef) -> bool {
        match entity.kind {
            EntityKind::Property => self.properties.contains_key(&PropertyId::from_uuid(entity.id)),
            EntityKind::Room => self.rooms.contains_key(&RoomId::from_uuid(entity.id)),
            EntityKind::MoveItem => self.items.contains_key(&ItemId::from_uuid(entity.id)),
            EntityKind::ShareGrant => self.grants.contains_key(&PropertyId::from_uuid(entity.id)),
        }
    }

    pub(crate) fn is_tombstoned(&self, entity: &EntityRef) -> bool {
        self.tombstones.contains_key(entity)
    }

    /// Highest field version of a live entity, 0 when unknown
    pub(crate) fn version(&self, entity: &EntityRef) -> u64 {
        self.clocks.get(entity).map_or(0, EntityClock::version)
    }

    /// Drop a live entity and its clock. Children are the caller's concern.
    pub(crate) fn remove(&mut self, entity: &EntityRef) -> bool {
        self.clocks.remove(entity);
        match entity.kind {
            EntityKind::Property => self.properties.remove(&PropertyId::from_uuid(entity.id)).is_some(),
            EntityKind::Room => self.rooms.remove(&RoomId::from_uuid(entity.id)).is_some(),
            EntityKind::MoveItem => {
                let id = ItemId::from_uuid(entity.id);
                self.pending_deletes.remove(&id);
                self.items.remove(&id).is_some()
            }
            EntityKind::ShareGrant => self.grants.remove(&PropertyId::from_uuid(entity.id)).is_some(),
        }
    }

    pub(crate) fn bury(&mut self, entity: EntityRef, property: PropertyId, stamp: Stamp) {
        self.tombstones.entry(entity).or_insert(Tombstone { property, stamp });
    }

    /// Make `id` the only active property
    pub(crate) fn set_active(&mut self, id: Option<PropertyId>) {
        for property in self.properties.values_mut() {
            property.active = Some(property.id) == id;
        }
        self.active_dirty = true;
    }

    /// Restore the exactly-one-active invariant, returning a newly activated property
    pub(crate) fn repair_active(&mut self) -> Option<PropertyId> {
        let active: Vec<PropertyId> = self.properties.values().filter(|p| p.active).map(|p| p.id).collect();
        match active.len() {
            1 => None,
            0 => {
                let earliest = self.properties_by_date().first().map(|p| p.id)?;
                self.set_active(Some(earliest));
                Some(earliest)
            }
            _ => {
                let keep = self
                    .properties_by_date()
                    .into_iter()
                    .find(|p| p.active)
                    .map(|p| p.id);
                self.set_active(keep);
                None
            }
        }
    }

    /// Recompute the cached `is_shared` flag of a property
    pub(crate) fn refresh_shared(&mut self, property: PropertyId) {
        let shared = self.grants.get(&property).is_some_and(|g| !g.stopped);
        if let Some(p) = self.properties.get_mut(&property) {
            p.is_shared = shared;
        }
    }

    /// Streams worth pulling: every live property
    pub(crate) fn streams(&self) -> Vec<PropertyId> {
        self.properties_by_date().into_iter().map(|p| p.id).collect()
    }
}
