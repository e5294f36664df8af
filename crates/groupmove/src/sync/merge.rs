//! Applying remote change records to the entity graph.
//!
//! A batch is applied in phases so parents exist before children and children
//! are gone before parents:
//!
//! 1. property creates
//! 2. share grant creates and updates
//! 3. room creates, then move-item creates
//! 4. scalar field updates
//! 5. move-item room reassignments
//! 6. deletes: move-items, rooms, properties
//!
//! Each field is resolved last-writer-wins by [`Stamp`]. Deletes are terminal:
//! a tombstoned entity never comes back. An item that lands in a deleted room,
//! by create or by move, is buried with the room's tombstone, so every replica
//! ends up where the room delete's cascade would have left it.
//!
//! A refused create is remembered, and later records about that entity are
//! skipped instead of waiting for a parent that will never arrive.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::{ChangeKind, StoreEvent};
use crate::journal::{
    apply_grant_field, decode_entity, decode_grant, grant_owner, participant_of_field, ChangeOp,
    ChangeRecord, Fields, Stamp, PROPERTY_FIELD, ROOM_FIELD,
};
use crate::model::{
    EntityKind, EntityRef, ItemId, MoveItem, Participant, Property, PropertyId, Room, RoomId,
};
use crate::store::graph::{EntityClock, Graph, InboxEntry, InboxReason};

/// A record that was not applied and never will be
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// Position in the delivered batch; `None` for a retried record
    pub index: Option<usize>,
    /// Entity the record addressed, when it could be decoded
    pub entity: Option<EntityRef>,
    /// Why it was skipped
    pub reason: String,
}

/// What happened to the records of one or more batches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Records that changed local state
    pub applied: usize,
    /// Records already applied before
    pub duplicates: usize,
    /// Records whose every field was already newer locally
    pub superseded: usize,
    /// Records waiting for the next local save
    pub deferred: usize,
    /// Records waiting for their parent to arrive
    pub parked: usize,
    /// Records for deleted entities
    pub discarded: usize,
    /// Malformed or unauthorized records
    pub skipped: Vec<SkippedRecord>,
}

impl ApplyReport {
    /// Fold another report into this one
    pub fn merge(&mut self, other: Self) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.superseded += other.superseded;
        self.deferred += other.deferred;
        self.parked += other.parked;
        self.discarded += other.discarded;
        self.skipped.extend(other.skipped);
    }
}

enum Outcome {
    Applied,
    Duplicate,
    Superseded,
    Deferred,
    Parked,
    Discarded,
    Skipped(String),
}

/// Result of applying records to a graph
pub(crate) struct MergeOutcome {
    pub(crate) report: ApplyReport,
    /// Entities whose rows must be rewritten
    pub(crate) touched: BTreeSet<EntityRef>,
    /// Properties deleted remotely whose queued local records were dropped
    pub(crate) purged: BTreeSet<PropertyId>,
    pub(crate) events: Vec<StoreEvent>,
    pub(crate) inbox_changed: bool,
}

fn phase(record: &ChangeRecord) -> u8 {
    match (record.op, record.entity.kind) {
        (ChangeOp::Create, EntityKind::Property) => 0,
        (ChangeOp::Create | ChangeOp::Update, EntityKind::ShareGrant) => 1,
        (ChangeOp::Create, EntityKind::Room) => 2,
        (ChangeOp::Create, EntityKind::MoveItem) => 3,
        (ChangeOp::Update, _) if record.moves_item() => 5,
        (ChangeOp::Update, _) => 4,
        (ChangeOp::Delete, EntityKind::MoveItem) => 6,
        (ChangeOp::Delete, EntityKind::Room) => 7,
        (ChangeOp::Delete, EntityKind::Property) => 8,
        (ChangeOp::Delete, EntityKind::ShareGrant) => 9,
    }
}

/// Apply decoded records, retrying whatever waits in the graph's inbox.
///
/// `trusted` skips the write-permission check; it is set for share snapshots,
/// whose records were vetted by the owner who published them.
pub(crate) fn apply(
    graph: &mut Graph,
    incoming: Vec<std::result::Result<ChangeRecord, String>>,
    trusted: bool,
) -> MergeOutcome {
    let mut report = ApplyReport::default();
    let mut kept: Vec<InboxEntry> = Vec::new();
    let mut work: Vec<(Option<usize>, ChangeRecord)> = Vec::new();

    let inbox = std::mem::take(&mut graph.inbox);
    let had_inbox = !inbox.is_empty();
    for entry in inbox {
        if entry.reason == InboxReason::Deferred && graph.dirty.contains(&entry.record.entity) {
            kept.push(entry);
        } else {
            work.push((None, entry.record));
        }
    }

    for (index, decoded) in incoming.into_iter().enumerate() {
        match decoded {
            Ok(mut record) => {
                if record.op == ChangeOp::Update {
                    if let Some(relationship) = record.split_relationship() {
                        if !record.fields.is_empty() {
                            work.push((Some(index), record));
                        }
                        work.push((Some(index), relationship));
                        continue;
                    }
                }
                work.push((Some(index), record));
            }
            Err(reason) => {
                warn!(index, reason = %reason, "Skipping undecodable change record");
                report.skipped.push(SkippedRecord { index: Some(index), entity: None, reason });
            }
        }
    }
    work.sort_by_key(|(_, record)| phase(record));

    let mut merger = Merger {
        graph,
        trusted,
        touched: BTreeSet::new(),
        purged: BTreeSet::new(),
        events: Vec::new(),
    };

    loop {
        let mut parked = Vec::new();
        let mut progressed = false;
        for (index, record) in work {
            match merger.apply_one(&record) {
                Outcome::Applied => {
                    report.applied += 1;
                    progressed = true;
                }
                Outcome::Duplicate => report.duplicates += 1,
                Outcome::Superseded => report.superseded += 1,
                Outcome::Discarded => report.discarded += 1,
                Outcome::Deferred => {
                    report.deferred += 1;
                    kept.push(InboxEntry { reason: InboxReason::Deferred, record });
                }
                Outcome::Parked => parked.push((index, record)),
                Outcome::Skipped(reason) => {
                    progressed |= merger.reject(&record);
                    warn!(entity = %record.entity, origin = %record.stamp.origin, reason = %reason, "Skipping change record");
                    report.skipped.push(SkippedRecord { index, entity: Some(record.entity), reason });
                }
            }
        }

        if parked.is_empty() || !progressed {
            report.parked += parked.len();
            kept.extend(
                parked
                    .into_iter()
                    .map(|(_, record)| InboxEntry { reason: InboxReason::Parked, record }),
            );
            break;
        }
        work = parked;
    }

    if let Some(activated) = merger.graph.repair_active() {
        merger.events.push(StoreEvent::remote(EntityRef::property(activated), ChangeKind::Updated));
    }

    let Merger { graph, touched, purged, events, .. } = merger;
    let inbox_changed = had_inbox || !kept.is_empty();
    graph.inbox = kept;

    debug!(
        applied = report.applied,
        duplicates = report.duplicates,
        deferred = report.deferred,
        parked = report.parked,
        skipped = report.skipped.len(),
        "Applied remote records"
    );
    MergeOutcome { report, touched, purged, events, inbox_changed }
}

struct Merger<'g> {
    graph: &'g mut Graph,
    trusted: bool,
    touched: BTreeSet<EntityRef>,
    purged: BTreeSet<PropertyId>,
    events: Vec<StoreEvent>,
}

impl Merger<'_> {
    fn apply_one(&mut self, record: &ChangeRecord) -> Outcome {
        let entity = record.entity;
        let is_delete = record.op == ChangeOp::Delete;

        if self.graph.is_tombstoned(&entity) {
            return if is_delete { Outcome::Duplicate } else { Outcome::Discarded };
        }
        if entity.kind != EntityKind::Property && self.graph.is_tombstoned(&EntityRef::property(record.property)) {
            return if is_delete { Outcome::Duplicate } else { Outcome::Discarded };
        }
        if self.graph.rejected.contains(&entity)
            || (entity.kind != EntityKind::Property
                && self.graph.rejected.contains(&EntityRef::property(record.property)))
        {
            return Outcome::Skipped(format!("{entity} belongs to a refused create"));
        }
        if let Some(outcome) = self.check_permission(record) {
            return outcome;
        }
        if self.graph.dirty.contains(&entity) && record.stamp.version <= self.graph.version(&entity) {
            debug!(entity = %entity, version = record.stamp.version, "Deferring record until local save");
            return Outcome::Deferred;
        }

        match record.op {
            ChangeOp::Create if self.graph.contains(&entity) => self.merge_fields(record),
            ChangeOp::Create => self.create(record),
            ChangeOp::Update => self.merge_fields(record),
            ChangeOp::Delete => self.delete(record),
        }
    }

    /// `None` when the origin may write the record, otherwise what to do with it
    fn check_permission(&self, record: &ChangeRecord) -> Option<Outcome> {
        if self.trusted {
            return None;
        }
        let origin = record.stamp.origin;
        let denied = |reason: String| Some(Outcome::Skipped(reason));
        let Some(grant) = self.graph.grants.get(&record.property) else {
            if record.entity.kind == EntityKind::ShareGrant
                && record.op == ChangeOp::Create
                && grant_owner(&record.fields) != Some(origin)
            {
                return denied(format!("{origin} created a grant naming someone else as owner"));
            }
            return None;
        };

        match record.entity.kind {
            EntityKind::ShareGrant => {
                if grant.is_owner(&origin) {
                    return None;
                }
                for (name, value) in &record.fields {
                    if participant_of_field(name) != Some(origin) {
                        return denied(format!("{origin} may not change grant field {name}"));
                    }
                    let Ok(entry) = serde_json::from_value::<Participant>(value.clone()) else {
                        return denied(format!("malformed participant entry {name}"));
                    };
                    // The owner's link record may still be on its way
                    if grant.participant(&origin).is_none() && grant.link_permission.is_none() && !grant.stopped {
                        return Some(Outcome::Parked);
                    }
                    if let Err(e) = grant.check_self_entry(&entry) {
                        return denied(format!("{origin}: {e}"));
                    }
                }
                None
            }
            EntityKind::Property if record.op == ChangeOp::Delete && !grant.is_owner(&origin) => {
                denied(format!("{origin} may not delete a property they do not own"))
            }
            _ if !grant.can_write(&origin) => denied(format!("{origin} has no write access")),
            _ => None,
        }
    }

    /// Remember a refused create. Returns whether the entity is newly refused.
    fn reject(&mut self, record: &ChangeRecord) -> bool {
        let entity = record.entity;
        if record.op != ChangeOp::Create
            || entity.kind == EntityKind::ShareGrant
            || self.graph.contains(&entity)
            || !self.graph.rejected.insert(entity)
        {
            return false;
        }
        self.touched.insert(entity);
        true
    }

    fn mark(&mut self, entity: EntityRef, kind: ChangeKind) {
        self.touched.insert(entity);
        self.events.push(StoreEvent::remote(entity, kind));
    }

    fn create(&mut self, record: &ChangeRecord) -> Outcome {
        let entity = record.entity;
        let property = record.property;
        if entity.kind != EntityKind::Property && !self.graph.properties.contains_key(&property) {
            return Outcome::Parked;
        }

        match entity.kind {
            EntityKind::Property => {
                let created: Property = match decode_entity(entity.id, None, &record.fields) {
                    Ok(p) => p,
                    Err(e) => return Outcome::Skipped(e.to_string()),
                };
                self.graph.properties.insert(created.id, created);
            }
            EntityKind::Room => {
                let room: Room = match decode_entity(entity.id, None, &record.fields) {
                    Ok(r) => r,
                    Err(e) => return Outcome::Skipped(e.to_string()),
                };
                if room.property != property {
                    return Outcome::Skipped(format!("room belongs to {} not {property}", room.property));
                }
                self.graph.rooms.insert(room.id, room);
            }
            EntityKind::MoveItem => {
                let item: MoveItem = match decode_entity(entity.id, None, &record.fields) {
                    Ok(i) => i,
                    Err(e) => return Outcome::Skipped(e.to_string()),
                };
                if item.property != property {
                    return Outcome::Skipped(format!("item belongs to {} not {property}", item.property));
                }
                match self.room_state(item.room, property) {
                    RoomState::Live => {}
                    RoomState::Gone(stamp) => {
                        self.bury(entity, property, stamp);
                        return Outcome::Discarded;
                    }
                    RoomState::Unknown => return Outcome::Parked,
                    RoomState::Refused => return Outcome::Skipped(format!("room {} was refused", item.room)),
                    RoomState::Foreign => {
                        return Outcome::Skipped(format!("room {} is not in property {property}", item.room));
                    }
                }
                self.graph.items.insert(item.id, item);
            }
            EntityKind::ShareGrant => {
                let grant = match decode_grant(property, &record.fields) {
                    Ok(g) => g,
                    Err(e) => return Outcome::Skipped(e.to_string()),
                };
                self.graph.grants.insert(property, grant);
                self.graph.refresh_shared(property);
            }
        }

        self.graph.clocks.insert(entity, EntityClock::stamped(&record.fields, record.stamp));
        self.mark(entity, ChangeKind::Created);
        Outcome::Applied
    }

    fn merge_fields(&mut self, record: &ChangeRecord) -> Outcome {
        let entity = record.entity;
        if !self.graph.contains(&entity) {
            return Outcome::Parked;
        }

        let clock = self.graph.clocks.get(&entity).cloned().unwrap_or_default();
        let mut winners = Fields::new();
        let (mut equal, mut older) = (0, 0);
        for (name, value) in &record.fields {
            if name == PROPERTY_FIELD && entity.kind != EntityKind::Property {
                continue;
            }
            match clock.fields.get(name) {
                Some(current) if *current == record.stamp => equal += 1,
                Some(current) if *current > record.stamp => older += 1,
                _ => {
                    winners.insert(name.clone(), value.clone());
                }
            }
        }
        if winners.is_empty() {
            return if older == 0 && equal > 0 { Outcome::Duplicate } else { Outcome::Superseded };
        }

        if let Some(room) = winners.get(ROOM_FIELD) {
            let Ok(room) = serde_json::from_value::<RoomId>(room.clone()) else {
                return Outcome::Skipped("malformed room reference".to_string());
            };
            match self.room_state(room, record.property) {
                RoomState::Live => {}
                RoomState::Gone(stamp) => {
                    debug!(entity = %entity, room = %room, "Item moved into a deleted room, burying it");
                    self.bury(entity, record.property, stamp);
                    return Outcome::Applied;
                }
                RoomState::Unknown => return Outcome::Parked,
                RoomState::Refused => return Outcome::Skipped(format!("room {room} was refused")),
                RoomState::Foreign => {
                    return Outcome::Skipped(format!("room {room} is not in property {}", record.property));
                }
            }
        }

        if let Err(reason) = self.overlay(entity, &winners) {
            return Outcome::Skipped(reason);
        }

        let clock = self.graph.clocks.entry(entity).or_default();
        for name in winners.keys() {
            clock.fields.insert(name.clone(), record.stamp);
        }
        self.mark(entity, ChangeKind::Updated);
        Outcome::Applied
    }

    fn overlay(&mut self, entity: EntityRef, fields: &Fields) -> std::result::Result<(), String> {
        let graph = &mut *self.graph;
        match entity.kind {
            EntityKind::Property => {
                let id = PropertyId::from_uuid(entity.id);
                let updated: Property = decode_entity(entity.id, graph.properties.get(&id), fields)
                    .map_err(|e| e.to_string())?;
                graph.properties.insert(id, updated);
            }
            EntityKind::Room => {
                let id = RoomId::from_uuid(entity.id);
                let updated: Room =
                    decode_entity(entity.id, graph.rooms.get(&id), fields).map_err(|e| e.to_string())?;
                graph.rooms.insert(id, updated);
            }
            EntityKind::MoveItem => {
                let id = ItemId::from_uuid(entity.id);
                let updated: MoveItem =
                    decode_entity(entity.id, graph.items.get(&id), fields).map_err(|e| e.to_string())?;
                graph.items.insert(id, updated);
            }
            EntityKind::ShareGrant => {
                let property = PropertyId::from_uuid(entity.id);
                let Some(mut grant) = graph.grants.get(&property).cloned() else {
                    return Err("grant vanished".to_string());
                };
                for (name, value) in fields {
                    apply_grant_field(&mut grant, name, value).map_err(|e| e.to_string())?;
                }
                graph.grants.insert(property, grant);
                graph.refresh_shared(property);
            }
        }
        Ok(())
    }

    fn delete(&mut self, record: &ChangeRecord) -> Outcome {
        let property = record.property;
        let stamp = record.stamp;
        match record.entity.kind {
            EntityKind::MoveItem => self.bury(record.entity, property, stamp),
            EntityKind::Room => {
                let room = RoomId::from_uuid(record.entity.id);
                let items: Vec<ItemId> = self.graph.items_in(room).iter().map(|i| i.id).collect();
                for item in items {
                    self.bury(EntityRef::item(item), property, stamp);
                }
                self.bury(record.entity, property, stamp);
            }
            EntityKind::Property => {
                let items: Vec<ItemId> = self.graph.items_of(property).iter().map(|i| i.id).collect();
                for item in items {
                    self.bury(EntityRef::item(item), property, stamp);
                }
                let rooms: Vec<RoomId> = self.graph.rooms_of(property).iter().map(|r| r.id).collect();
                for room in rooms {
                    self.bury(EntityRef::room(room), property, stamp);
                }
                let grant = EntityRef::grant(property);
                if self.graph.remove(&grant) {
                    self.touched.insert(grant);
                }
                self.bury(record.entity, property, stamp);

                let before = self.graph.outbox.len();
                self.graph.outbox.retain(|r| r.property != property);
                debug!(
                    property = %property,
                    dropped = before - self.graph.outbox.len(),
                    "Property deleted remotely, dropping unsent local records"
                );
                self.purged.insert(property);
            }
            EntityKind::ShareGrant => {
                return Outcome::Skipped("share grants are never deleted".to_string());
            }
        }
        Outcome::Applied
    }

    fn bury(&mut self, entity: EntityRef, property: PropertyId, stamp: Stamp) {
        let existed = self.graph.remove(&entity);
        self.graph.bury(entity, property, stamp);
        self.touched.insert(entity);
        if existed {
            self.events.push(StoreEvent::remote(entity, ChangeKind::Deleted));
        }
    }

    fn room_state(&self, room: RoomId, property: PropertyId) -> RoomState {
        let entity = EntityRef::room(room);
        match self.graph.rooms.get(&room) {
            Some(r) if r.property == property => RoomState::Live,
            Some(_) => RoomState::Foreign,
            None => match self.graph.tombstones.get(&entity) {
                Some(tombstone) if tombstone.property == property => RoomState::Gone(tombstone.stamp),
                Some(_) => RoomState::Foreign,
                None if self.graph.rejected.contains(&entity) => RoomState::Refused,
                None => RoomState::Unknown,
            },
        }
    }
}

enum RoomState {
    Live,
    /// Deleted, with the stamp of its delete
    Gone(Stamp),
    Unknown,
    Refused,
    Foreign,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::participant_field;
    use crate::model::{
        AcceptanceStatus, EntityPatch, ItemPatch, NewMoveItem, NewProperty, ParticipantId, Permission,
        RoomPatch,
    };
    use crate::store::Transaction;

    /// A replica writing locally, keeping the records its writes produce
    struct Writer {
        graph: Graph,
        me: ParticipantId,
    }

    impl Writer {
        fn new() -> Self {
            Self { graph: Graph::default(), me: ParticipantId::new() }
        }

        /// Another participant starting from the same state
        fn fork(&self) -> Self {
            Self { graph: self.graph.clone(), me: ParticipantId::new() }
        }

        fn write<T>(&mut self, body: impl FnOnce(&mut Transaction<'_>) -> crate::Result<T>) -> (T, Vec<ChangeRecord>) {
            let mut tx = Transaction::new(&mut self.graph, self.me);
            let value = body(&mut tx).unwrap();
            let (records, _) = tx.finish();
            (value, records)
        }

        fn participant(&self, name: &str, permission: Permission) -> Participant {
            Participant {
                id: self.me,
                display_name: name.to_string(),
                status: AcceptanceStatus::Accepted,
                permission,
            }
        }
    }

    fn deliver(graph: &mut Graph, records: &[ChangeRecord]) -> MergeOutcome {
        apply(graph, records.iter().cloned().map(Ok).collect(), false)
    }

    /// A property with the given rooms, and the records that built it
    fn property(writer: &mut Writer, rooms: &[&str]) -> (PropertyId, Vec<RoomId>, Vec<ChangeRecord>) {
        let ((property, rooms), records) = writer.write(|tx| {
            let property = tx.create_property(NewProperty { name: "Blair House".into(), ..Default::default() })?;
            let mut ids = Vec::new();
            for room in rooms {
                ids.push(tx.create_room(property.id, room, None)?.id);
            }
            Ok((property.id, ids))
        });
        (property, rooms, records)
    }

    fn add_item(writer: &mut Writer, property: PropertyId, room: RoomId, name: &str) -> (ItemId, Vec<ChangeRecord>) {
        let (item, records) = writer.write(|tx| {
            tx.create_move_item(room, property, NewMoveItem { name: name.into(), ..Default::default() })
        });
        (item.id, records)
    }

    fn move_to(writer: &mut Writer, item: ItemId, room: RoomId) -> Vec<ChangeRecord> {
        writer
            .write(|tx| tx.update_fields(EntityPatch::MoveItem(item, ItemPatch { room: Some(room), ..Default::default() })))
            .1
    }

    #[test]
    fn test_child_waits_for_parent_across_batches() {
        let mut alex = Writer::new();
        let (home, rooms, built) = property(&mut alex, &["Kitchen"]);
        let (lamp, created) = add_item(&mut alex, home, rooms[0], "Lamp");

        let mut replica = Graph::default();
        let first = deliver(&mut replica, &[built[0].clone(), created[0].clone()]);
        assert_eq!(first.report.applied, 1);
        assert_eq!(first.report.parked, 1);
        assert!(first.inbox_changed);
        assert_eq!(replica.inbox.len(), 1);
        assert_eq!(replica.inbox[0].reason, InboxReason::Parked);
        assert!(!replica.items.contains_key(&lamp));

        let second = deliver(&mut replica, &built[1..]);
        assert_eq!(second.report.applied, 2);
        assert_eq!(second.report.parked, 0);
        assert!(replica.inbox.is_empty());
        assert_eq!(replica.items[&lamp].room, rooms[0]);
    }

    #[test]
    fn test_rename_and_move_apply_in_separate_phases() {
        let mut alex = Writer::new();
        let (home, rooms, built) = property(&mut alex, &["Kitchen"]);
        let (lamp, created) = add_item(&mut alex, home, rooms[0], "Lamp");
        let mut replica = Graph::default();
        deliver(&mut replica, &[built, created].concat());

        let (garage, mut changed) = alex.write(|tx| {
            let garage = tx.create_room(home, "Garage", None)?;
            tx.update_fields(EntityPatch::MoveItem(
                lamp,
                ItemPatch { name: Some("Desk lamp".into()), room: Some(garage.id), ..Default::default() },
            ))?;
            Ok(garage.id)
        });
        assert!(changed[1].moves_item());
        assert_eq!(changed[1].fields.len(), 2);

        // The move arrives ahead of the room it points at
        changed.reverse();
        let outcome = deliver(&mut replica, &changed);
        assert_eq!(outcome.report.applied, 3);
        assert!(replica.inbox.is_empty());
        let moved = &replica.items[&lamp];
        assert_eq!(moved.name, "Desk lamp");
        assert_eq!(moved.room, garage);
    }

    #[test]
    fn test_remote_property_delete_drops_unsent_local_records() {
        let mut alex = Writer::new();
        let (home, rooms, built) = property(&mut alex, &["Kitchen"]);

        let mut sam = Writer::new();
        deliver(&mut sam.graph, &built);
        let (kettle, local) = add_item(&mut sam, home, rooms[0], "Kettle");
        sam.graph.outbox.extend(local);

        let (_, deleted) = alex.write(|tx| tx.delete_property(home));
        let outcome = deliver(&mut sam.graph, &deleted);

        assert!(outcome.purged.contains(&home));
        assert!(sam.graph.outbox.is_empty());
        assert!(!sam.graph.items.contains_key(&kettle));
        assert!(sam.graph.is_tombstoned(&EntityRef::property(home)));
        assert!(sam.graph.is_tombstoned(&EntityRef::item(kettle)));
    }

    #[test]
    fn test_move_into_deleted_room_converges_in_either_order() {
        let mut alex = Writer::new();
        let (home, rooms, built) = property(&mut alex, &["Kitchen", "Bedroom"]);
        let (microwave, created) = add_item(&mut alex, home, rooms[0], "Microwave");
        let base = [built, created].concat();
        let mut sam = alex.fork();

        let (_, deleted) = alex.write(|tx| tx.delete_room(rooms[1], false));
        let moved = move_to(&mut sam, microwave, rooms[1]);

        let mut delete_first = Graph::default();
        deliver(&mut delete_first, &base);
        deliver(&mut delete_first, &deleted);
        let outcome = deliver(&mut delete_first, &moved);
        assert_eq!(outcome.report.applied, 1);
        assert!(outcome.touched.contains(&EntityRef::item(microwave)));

        let mut move_first = Graph::default();
        deliver(&mut move_first, &base);
        deliver(&mut move_first, &moved);
        deliver(&mut move_first, &deleted);

        let item = EntityRef::item(microwave);
        for replica in [&delete_first, &move_first] {
            assert!(!replica.items.contains_key(&microwave));
            assert_eq!(replica.tombstones[&item].stamp, deleted[0].stamp);
            assert!(replica.rooms.contains_key(&rooms[0]));
        }
    }

    #[test]
    fn test_item_created_in_deleted_room_is_buried() {
        let mut alex = Writer::new();
        let (home, rooms, built) = property(&mut alex, &["Kitchen", "Bedroom"]);
        let mut sam = alex.fork();

        let (_, deleted) = alex.write(|tx| tx.delete_room(rooms[1], false));
        let (lamp, created) = add_item(&mut sam, home, rooms[1], "Lamp");
        let noted = sam
            .write(|tx| {
                tx.update_fields(EntityPatch::MoveItem(
                    lamp,
                    ItemPatch { notes: Some(Some("fragile".into())), ..Default::default() },
                ))
            })
            .1;

        let mut replica = Graph::default();
        deliver(&mut replica, &[built, deleted].concat());
        let outcome = deliver(&mut replica, &created);
        assert_eq!(outcome.report.discarded, 1);
        assert!(replica.is_tombstoned(&EntityRef::item(lamp)));

        // Later edits to the buried item are dropped, not parked
        let outcome = deliver(&mut replica, &noted);
        assert_eq!(outcome.report.discarded, 1);
        assert!(replica.inbox.is_empty());
    }

    #[test]
    fn test_records_about_refused_create_are_skipped() {
        let mut alex = Writer::new();
        let (home, _, built) = property(&mut alex, &[]);
        let owner = alex.participant("Alex", Permission::ReadWrite);
        let (_, shared) = alex.write(|tx| tx.share(home, owner));
        let mut replica = Graph::default();
        deliver(&mut replica, &[built, shared].concat());

        let (garage, mut room_created) = alex.write(|tx| tx.create_room(home, "Garage", None));
        let (lamp, item_created) = add_item(&mut alex, home, garage.id, "Lamp");
        let renamed = alex
            .write(|tx| tx.update_fields(EntityPatch::Room(garage.id, RoomPatch { name: Some("Shed".into()) })))
            .1;
        // The create reaches the replica stamped by somebody without access
        room_created[0].stamp.origin = ParticipantId::new();

        let outcome = deliver(&mut replica, &item_created);
        assert_eq!(outcome.report.parked, 1);

        let outcome = deliver(&mut replica, &room_created);
        assert_eq!(outcome.report.skipped.len(), 2);
        assert_eq!(outcome.report.parked, 0);
        assert!(outcome.touched.contains(&EntityRef::room(garage.id)));
        assert!(replica.rejected.contains(&EntityRef::room(garage.id)));
        assert!(replica.rejected.contains(&EntityRef::item(lamp)));
        assert!(replica.inbox.is_empty());

        let outcome = deliver(&mut replica, &renamed);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert!(replica.inbox.is_empty());
        assert!(!replica.rooms.contains_key(&garage.id));
    }

    #[test]
    fn test_link_join_waits_for_link_and_is_capped_by_it() {
        let mut alex = Writer::new();
        let (home, _, built) = property(&mut alex, &["Kitchen"]);
        let owner = alex.participant("Alex", Permission::ReadWrite);
        let (_, shared) = alex.write(|tx| tx.share(home, owner));
        let (_, linked) = alex.write(|tx| tx.allow_link(home, Permission::ReadOnly));

        let mut sam = alex.fork();
        let entry = sam.participant("Sam", Permission::ReadOnly);
        let (_, joined) = sam.write(|tx| tx.put_participant(home, entry.clone()));

        let mut replica = Graph::default();
        deliver(&mut replica, &[built, shared].concat());
        let outcome = deliver(&mut replica, &joined);
        assert_eq!(outcome.report.parked, 1);

        let outcome = deliver(&mut replica, &linked);
        assert_eq!(outcome.report.applied, 2);
        let grant = &replica.grants[&home];
        assert_eq!(grant.participant(&sam.me), Some(&entry));
        assert!(!grant.can_write(&sam.me));

        // A join asking for more than the link grants
        let kim = alex.fork();
        let wanted = kim.participant("Kim", Permission::ReadWrite);
        let mut forged = joined[0].clone();
        forged.stamp.origin = kim.me;
        forged.fields = Fields::from([(participant_field(&kim.me), serde_json::to_value(&wanted).unwrap())]);
        let outcome = deliver(&mut replica, &[forged]);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert!(replica.grants[&home].participant(&kim.me).is_none());
        assert!(replica.inbox.is_empty());
    }

    #[test]
    fn test_deferred_record_waits_while_entity_is_dirty() {
        let mut alex = Writer::new();
        let (_, rooms, built) = property(&mut alex, &["Kitchen"]);
        let mut sam = Writer::new();
        deliver(&mut sam.graph, &built);

        let renamed = alex
            .write(|tx| tx.update_fields(EntityPatch::Room(rooms[0], RoomPatch { name: Some("Galley".into()) })))
            .1;
        sam.write(|tx| tx.update_fields(EntityPatch::Room(rooms[0], RoomPatch { name: Some("Pantry".into()) })));

        let outcome = deliver(&mut sam.graph, &renamed);
        assert_eq!(outcome.report.deferred, 1);
        assert_eq!(sam.graph.inbox[0].reason, InboxReason::Deferred);
        assert_eq!(sam.graph.rooms[&rooms[0]].name, "Pantry");

        // Still dirty: the entry stays put
        deliver(&mut sam.graph, &[]);
        assert_eq!(sam.graph.inbox.len(), 1);

        sam.graph.dirty.clear();
        let outcome = deliver(&mut sam.graph, &[]);
        assert_eq!(outcome.report.superseded + outcome.report.applied, 1);
        assert!(sam.graph.inbox.is_empty());
    }
}
