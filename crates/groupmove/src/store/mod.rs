//! Local durable storage of properties, rooms, move-items and share grants.
//!
//! The [`RecordStore`] is the only component that mutates entities. Local code
//! writes through [`RecordStore::transaction`] (or the one-shot helpers built on
//! it); the sync engine writes through the crate-internal remote apply path.
//!
//! ## Durability
//!
//! Mutations land in memory first. [`RecordStore::save`] writes the changed rows,
//! their tombstones and the queued change records in one SQLite transaction.
//! If that fails the in-memory state is kept, so `save` can simply be retried.
//!
//! ## Example
//!
//! ```rust,no_run
//! use groupmove::{NewMoveItem, NewProperty, ParticipantId, RecordStore};
//!
//! # fn example() -> groupmove::Result<()> {
//! let store = RecordStore::open_in_memory(ParticipantId::new())?;
//! let home = store.create_property(NewProperty { name: "Blair House".into(), ..Default::default() })?;
//! let kitchen = store.create_room(home.id, "Kitchen", None)?;
//! store.create_move_item(kitchen.id, home.id, NewMoveItem {
//!     name: "Microwave".into(),
//!     ..Default::default()
//! })?;
//! store.save()?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod db;
pub(crate) mod graph;
mod tx;

use std::collections::BTreeSet;
use std::path::Path;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use self::tx::Transaction;

use self::db::{Database, Flush, OutboxEntry};
use self::graph::Graph;
use crate::error::{Error, Result};
use crate::events::{ChangeKind, StoreEvent, EVENT_CAPACITY};
use crate::journal::{encode_fields, encode_grant, ChangeOp, ChangeRecord, Fields, Replicated};
use crate::model::{
    EntityPatch, EntityRef, ItemId, MoveItem, NewMoveItem, NewProperty, ParticipantId, Property,
    PropertyId, Room, RoomId, ShareGrant,
};
use crate::sync::merge::{self, ApplyReport};

/// Durable, transactional store of the entity graph
pub struct RecordStore {
    me: ParticipantId,
    db: Database,
    state: Mutex<Graph>,
    events: broadcast::Sender<StoreEvent>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").field("participant", &self.me).finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Open (or create) the store at `path`, writing as participant `me`.
    ///
    /// Undecodable persisted rows fail with [`Error::Corrupt`]; this is the only
    /// place that error is produced.
    pub fn open(path: &Path, me: ParticipantId) -> Result<Self> {
        let store = Self::with_database(Database::open(path)?, me)?;
        info!(path = %path.display(), participant = %me, "Record store opened");
        Ok(store)
    }

    /// Open a store that lives only in memory
    pub fn open_in_memory(me: ParticipantId) -> Result<Self> {
        Self::with_database(Database::open_in_memory()?, me)
    }

    fn with_database(db: Database, me: ParticipantId) -> Result<Self> {
        let graph = db.load()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { me, db, state: Mutex::new(graph), events })
    }

    /// The participant local writes are attributed to
    #[must_use]
    pub fn participant(&self) -> ParticipantId {
        self.me
    }

    /// Subscribe to committed changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Run `body` as one transaction.
    ///
    /// All mutations made through the [`Transaction`] become visible together
    /// when `body` returns `Ok`; on `Err` none of them happened. `body` must not
    /// call back into the store.
    pub fn transaction<T>(&self, body: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut graph = self.state.lock();
        let mut working = graph.clone();

        let mut tx = Transaction::new(&mut working, self.me);
        let value = body(&mut tx)?;
        let (records, mut events) = tx.finish();

        if let Some(activated) = working.repair_active() {
            events.push(StoreEvent::local(EntityRef::property(activated), ChangeKind::Updated));
        }
        if !records.is_empty() {
            debug!(records = records.len(), "Transaction committed");
        }
        working.outbox.extend(records);
        *graph = working;
        drop(graph);

        self.publish(events);
        Ok(value)
    }

    /// Whether there is anything for [`Self::save`] to write
    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        self.state.lock().has_unsaved_changes()
    }

    /// Flush pending changes to disk. A no-op when nothing changed.
    ///
    /// On failure the in-memory state is left as it is and the call can be
    /// retried. Remote records that waited for this save are applied after it.
    pub fn save(&self) -> Result<()> {
        let mut graph = self.state.lock();
        if !graph.has_unsaved_changes() {
            return Ok(());
        }

        let entities = graph.dirty.clone();
        let no_purge = BTreeSet::new();
        self.db
            .commit(&Flush {
                graph: &graph,
                entities: &entities,
                outbox: &graph.outbox,
                purge: &no_purge,
                write_inbox: false,
                cursor: None,
            })
            .inspect_err(|e| warn!(error = %e, "Save failed, keeping unsaved changes"))?;

        debug!(entities = entities.len(), records = graph.outbox.len(), "Saved record store");
        graph.dirty.clear();
        graph.outbox.clear();
        graph.active_dirty = false;

        let events = if graph.inbox.is_empty() { Vec::new() } else { self.reapply_inbox(&mut graph) };
        drop(graph);
        self.publish(events);
        Ok(())
    }

    fn reapply_inbox(&self, graph: &mut Graph) -> Vec<StoreEvent> {
        let snapshot = graph.clone();
        let outcome = merge::apply(graph, Vec::new(), false);
        let result = self.db.commit(&Flush {
            graph,
            entities: &outcome.touched,
            outbox: &[],
            purge: &outcome.purged,
            write_inbox: outcome.inbox_changed,
            cursor: None,
        });
        match result {
            Ok(()) => outcome.events,
            Err(e) => {
                // The records stay queued and are retried on the next save
                warn!(error = %e, "Failed to apply waiting remote records");
                *graph = snapshot;
                Vec::new()
            }
        }
    }

    // ========================================================================
    // One-shot mutations
    // ========================================================================

    /// Create a property; see [`Transaction::create_property`].
    ///
    /// The first property of a store is made active when the transaction
    /// commits, and the returned value already says so.
    pub fn create_property(&self, new: NewProperty) -> Result<Property> {
        let created = self.transaction(|tx| tx.create_property(new))?;
        Ok(self.property(created.id).unwrap_or(created))
    }

    /// Create a room; see [`Transaction::create_room`]
    pub fn create_room(&self, property: PropertyId, name: &str, order_index: Option<i64>) -> Result<Room> {
        self.transaction(|tx| tx.create_room(property, name, order_index))
    }

    /// Create a move-item; see [`Transaction::create_move_item`]
    pub fn create_move_item(&self, room: RoomId, property: PropertyId, new: NewMoveItem) -> Result<MoveItem> {
        self.transaction(|tx| tx.create_move_item(room, property, new))
    }

    /// Apply a partial update; fails with [`Error::NotFound`] if the entity is gone
    pub fn update_fields(&self, patch: EntityPatch) -> Result<()> {
        self.transaction(|tx| tx.update_fields(patch))
    }

    /// Delete a property and everything in it
    pub fn delete_property(&self, id: PropertyId) -> Result<()> {
        self.transaction(|tx| tx.delete_property(id))
    }

    /// Delete a room; see [`Transaction::delete_room`]
    pub fn delete_room(&self, id: RoomId, cascade_items: bool) -> Result<()> {
        self.transaction(|tx| tx.delete_room(id, cascade_items))
    }

    /// Delete one move-item
    pub fn delete_move_item(&self, id: ItemId) -> Result<()> {
        self.transaction(|tx| tx.delete_move_item(id))
    }

    /// Reorder rooms; see [`Transaction::reorder_rooms`]
    pub fn reorder_rooms(&self, property: PropertyId, new_order: &[RoomId]) -> Result<()> {
        self.transaction(|tx| tx.reorder_rooms(property, new_order))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// All properties, oldest first
    #[must_use]
    pub fn list_properties(&self) -> Vec<Property> {
        self.state.lock().properties_by_date().into_iter().cloned().collect()
    }

    /// The active property
    #[must_use]
    pub fn active_property(&self) -> Option<Property> {
        self.state.lock().active_property().cloned()
    }

    /// Look up a property
    #[must_use]
    pub fn property(&self, id: PropertyId) -> Option<Property> {
        self.state.lock().properties.get(&id).cloned()
    }

    /// Rooms of a property, ordered by order index
    #[must_use]
    pub fn rooms(&self, property: PropertyId) -> Vec<Room> {
        self.state.lock().rooms_of(property).into_iter().cloned().collect()
    }

    /// Look up a room
    #[must_use]
    pub fn room(&self, id: RoomId) -> Option<Room> {
        self.state.lock().rooms.get(&id).cloned()
    }

    /// Items of a property, unordered
    #[must_use]
    pub fn items(&self, property: PropertyId) -> Vec<MoveItem> {
        self.state.lock().items_of(property).into_iter().cloned().collect()
    }

    /// Items in a room, newest first
    #[must_use]
    pub fn items_in_room(&self, room: RoomId) -> Vec<MoveItem> {
        self.state.lock().items_in(room).into_iter().cloned().collect()
    }

    /// Look up a move-item
    #[must_use]
    pub fn move_item(&self, id: ItemId) -> Option<MoveItem> {
        self.state.lock().items.get(&id).cloned()
    }

    /// Share grant of a property
    #[must_use]
    pub fn grant(&self, property: PropertyId) -> Option<ShareGrant> {
        self.state.lock().grants.get(&property).cloned()
    }

    /// Whether an item is marked for deferred deletion
    #[must_use]
    pub fn is_pending_delete(&self, id: ItemId) -> bool {
        self.state.lock().pending_deletes.contains(&id)
    }

    /// Items of a property marked for deferred deletion
    #[must_use]
    pub fn pending_deletes(&self, property: PropertyId) -> BTreeSet<ItemId> {
        let graph = self.state.lock();
        graph
            .pending_deletes
            .iter()
            .filter(|id| graph.items.get(id).is_some_and(|i| i.property == property))
            .copied()
            .collect()
    }

    /// Run a read-only view over the graph under a single lock, so values
    /// derived from several collections are consistent with each other
    pub(crate) fn read<T>(&self, view: impl FnOnce(&Graph) -> T) -> T {
        view(&self.state.lock())
    }

    // ========================================================================
    // Sync engine surface
    // ========================================================================

    /// Apply remote records and persist them with the stream cursor atomically.
    ///
    /// On a storage failure the graph is restored and nothing is persisted,
    /// so the same delivery can be retried.
    pub(crate) fn apply_remote(
        &self,
        records: Vec<std::result::Result<ChangeRecord, String>>,
        cursor: Option<(PropertyId, u64)>,
        trusted: bool,
    ) -> Result<ApplyReport> {
        let mut graph = self.state.lock();
        let snapshot = graph.clone();

        let outcome = merge::apply(&mut graph, records, trusted);
        if let Some((stream, seq)) = cursor {
            graph.cursors.insert(stream, seq);
        }

        let result = self.db.commit(&Flush {
            graph: &graph,
            entities: &outcome.touched,
            outbox: &[],
            purge: &outcome.purged,
            write_inbox: outcome.inbox_changed,
            cursor,
        });
        if let Err(e) = result {
            *graph = snapshot;
            warn!(error = %e, "Failed to persist remote batch, it stays retryable");
            return Err(e);
        }
        drop(graph);

        self.publish(outcome.events);
        Ok(outcome.report)
    }

    /// Last applied sequence number of a stream
    pub(crate) fn cursor(&self, stream: PropertyId) -> u64 {
        self.state.lock().cursors.get(&stream).copied().unwrap_or(0)
    }

    /// Streams of every live property
    pub(crate) fn streams(&self) -> Vec<PropertyId> {
        self.state.lock().streams()
    }

    /// Whether the property was deleted
    pub(crate) fn is_deleted(&self, property: PropertyId) -> bool {
        self.state.lock().is_tombstoned(&EntityRef::property(property))
    }

    pub(crate) fn outbox_head(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.db.outbox_head(limit)
    }

    pub(crate) fn outbox_len(&self) -> Result<usize> {
        self.db.outbox_len()
    }

    pub(crate) fn remove_outbox(&self, seqs: &[i64]) -> Result<()> {
        self.db.remove_outbox(seqs)
    }

    pub(crate) fn record_push_failure(&self, seqs: &[i64], error: &Error) -> Result<()> {
        self.db.record_push_failure(seqs, &error.to_string())
    }

    pub(crate) fn head_attempts(&self) -> Result<Option<(i64, Option<String>)>> {
        self.db.head_attempts()
    }

    /// Records that rebuild a property subtree on another replica, with the
    /// original stamps of every field.
    pub(crate) fn snapshot(&self, property: PropertyId) -> Result<Vec<ChangeRecord>> {
        let graph = self.state.lock();
        let root = graph
            .properties
            .get(&property)
            .ok_or_else(|| Error::not_found(format!("property {property}")))?;

        let mut records = Vec::new();
        snapshot_entity(&graph, property, root.entity_ref(), encode_fields(root)?, &mut records);
        if let Some(grant) = graph.grants.get(&property) {
            snapshot_entity(&graph, property, EntityRef::grant(property), encode_grant(grant)?, &mut records);
        }
        for room in graph.rooms_of(property) {
            snapshot_entity(&graph, property, room.entity_ref(), encode_fields(room)?, &mut records);
        }
        for item in graph.items_of(property) {
            snapshot_entity(&graph, property, item.entity_ref(), encode_fields(item)?, &mut records);
        }
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

/// One create carrying every field at the oldest stamp, then one update per
/// newer stamp so each field ends up with its true stamp.
fn snapshot_entity(
    graph: &Graph,
    property: PropertyId,
    entity: EntityRef,
    fields: Fields,
    out: &mut Vec<ChangeRecord>,
) {
    let Some(clock) = graph.clocks.get(&entity) else {
        return;
    };
    let stamps = clock.stamps();
    let Some(first) = stamps.first().copied() else {
        return;
    };

    let updates: Vec<ChangeRecord> = stamps
        .iter()
        .skip(1)
        .filter_map(|stamp| {
            let newer: Fields = fields
                .iter()
                .filter(|(name, _)| clock.fields.get(*name) == Some(stamp))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            (!newer.is_empty())
                .then(|| ChangeRecord { property, entity, op: ChangeOp::Update, fields: newer, stamp: *stamp })
        })
        .collect();

    out.push(ChangeRecord { property, entity, op: ChangeOp::Create, fields, stamp: first });
    out.extend(updates);
}
