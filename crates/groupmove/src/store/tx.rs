//! The write context handed to [`RecordStore::transaction`](super::RecordStore::transaction).

use chrono::Utc;

use super::graph::{EntityClock, Graph};
use crate::error::{Error, Result};
use crate::events::{ChangeKind, StoreEvent};
use crate::journal::{
    changed_fields, changed_grant_fields, encode_fields, encode_grant, ChangeOp, ChangeRecord, Fields,
    Stamp,
};
use crate::model::{
    AcceptanceStatus, EntityPatch, EntityRef, ItemId, ItemPatch, Money, MoveItem, NewMoveItem,
    NewProperty, Participant, ParticipantId, Permission, Property, PropertyId, PropertyPatch, Room, RoomId,
    RoomPatch, ShareGrant,
};

/// Scoped write access to the store.
///
/// Every mutation is checked against the property's share grant before it
/// changes anything, then recorded as a [`ChangeRecord`]. The records of one
/// transaction are queued in the order the mutations were applied, and only
/// if the transaction body returns `Ok`.
pub struct Transaction<'a> {
    graph: &'a mut Graph,
    me: ParticipantId,
    records: Vec<ChangeRecord>,
    events: Vec<StoreEvent>,
}

fn non_empty(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn non_negative(amount: Money, what: &str) -> Result<Money> {
    if amount.cents() < 0 {
        return Err(Error::validation(format!("{what} must not be negative")));
    }
    Ok(amount)
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(graph: &'a mut Graph, me: ParticipantId) -> Self {
        Self { graph, me, records: Vec::new(), events: Vec::new() }
    }

    pub(crate) fn finish(self) -> (Vec<ChangeRecord>, Vec<StoreEvent>) {
        (self.records, self.events)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Look up a property
    pub fn property(&self, id: PropertyId) -> Result<&Property> {
        self.graph
            .properties
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("property {id}")))
    }

    /// Look up a room
    pub fn room(&self, id: RoomId) -> Result<&Room> {
        self.graph.rooms.get(&id).ok_or_else(|| Error::not_found(format!("room {id}")))
    }

    /// Look up a move-item
    pub fn move_item(&self, id: ItemId) -> Result<&MoveItem> {
        self.graph.items.get(&id).ok_or_else(|| Error::not_found(format!("move item {id}")))
    }

    /// All properties, oldest first
    #[must_use]
    pub fn properties(&self) -> Vec<Property> {
        self.graph.properties_by_date().into_iter().cloned().collect()
    }

    /// The active property, if any
    #[must_use]
    pub fn active_property(&self) -> Option<Property> {
        self.graph.active_property().cloned()
    }

    /// Rooms of a property in display order
    #[must_use]
    pub fn rooms(&self, property: PropertyId) -> Vec<Room> {
        self.graph.rooms_of(property).into_iter().cloned().collect()
    }

    /// Live items of a property, unordered
    #[must_use]
    pub fn items(&self, property: PropertyId) -> Vec<MoveItem> {
        self.graph.items_of(property).into_iter().cloned().collect()
    }

    /// Share grant of a property
    #[must_use]
    pub fn grant(&self, property: PropertyId) -> Option<&ShareGrant> {
        self.graph.grants.get(&property)
    }

    /// Items currently marked for deferred deletion
    #[must_use]
    pub fn pending_deletes(&self, property: PropertyId) -> Vec<ItemId> {
        self.graph
            .pending_deletes
            .iter()
            .filter(|id| self.graph.items.get(id).is_some_and(|i| i.property == property))
            .copied()
            .collect()
    }

    // ------------------------------------------------------------------
    // Permission gates
    // ------------------------------------------------------------------

    pub(crate) fn require_edit(&self, property: PropertyId) -> Result<()> {
        match self.graph.grants.get(&property) {
            Some(grant) if !grant.can_write(&self.me) => Err(Error::permission_denied(format!(
                "read-only access to property {property}"
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn require_owner(&self, property: PropertyId) -> Result<()> {
        match self.graph.grants.get(&property) {
            Some(grant) if !grant.is_owner(&self.me) => Err(Error::permission_denied(format!(
                "only the owner may do this to property {property}"
            ))),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Record emission
    // ------------------------------------------------------------------

    fn push(&mut self, record: ChangeRecord, kind: ChangeKind) {
        self.graph.dirty.insert(record.entity);
        self.events.push(StoreEvent::local(record.entity, kind));
        self.records.push(record);
    }

    fn emit_create(&mut self, property: PropertyId, entity: EntityRef, fields: Fields) {
        let stamp = Stamp::next(0, self.me);
        self.graph.clocks.insert(entity, EntityClock::stamped(&fields, stamp));
        self.push(
            ChangeRecord { property, entity, op: ChangeOp::Create, fields, stamp },
            ChangeKind::Created,
        );
    }

    fn emit_update(&mut self, property: PropertyId, entity: EntityRef, fields: Fields) {
        if fields.is_empty() {
            return;
        }
        let stamp = Stamp::next(self.graph.version(&entity), self.me);
        let clock = self.graph.clocks.entry(entity).or_default();
        for name in fields.keys() {
            clock.fields.insert(name.clone(), stamp);
        }
        self.push(
            ChangeRecord { property, entity, op: ChangeOp::Update, fields, stamp },
            ChangeKind::Updated,
        );
    }

    fn emit_delete(&mut self, property: PropertyId, entity: EntityRef) {
        let stamp = Stamp::next(self.graph.version(&entity), self.me);
        self.graph.remove(&entity);
        self.graph.bury(entity, property, stamp);
        self.push(
            ChangeRecord { property, entity, op: ChangeOp::Delete, fields: Fields::new(), stamp },
            ChangeKind::Deleted,
        );
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    /// Create a property. It starts inactive; the committing transaction
    /// activates it when no other property is active.
    pub fn create_property(&mut self, new: NewProperty) -> Result<Property> {
        let budget = new.budget.map(|b| non_negative(b, "budget")).transpose()?;
        let property = Property {
            id: PropertyId::new(),
            name: non_empty(&new.name, "property name")?,
            color: new.color,
            budget,
            has_budget: new.has_budget,
            is_shared: false,
            active: false,
            date_created: Utc::now(),
        };

        let fields = encode_fields(&property)?;
        self.graph.properties.insert(property.id, property.clone());
        self.emit_create(property.id, EntityRef::property(property.id), fields);
        Ok(property)
    }

    /// Make `id` the only active property. Local to this replica.
    pub fn set_active(&mut self, id: PropertyId) -> Result<()> {
        self.property(id)?;
        let previous = self.graph.active_property().map(|p| p.id);
        if previous == Some(id) {
            return Ok(());
        }
        self.graph.set_active(Some(id));
        if let Some(previous) = previous {
            self.events.push(StoreEvent::local(EntityRef::property(previous), ChangeKind::Updated));
        }
        self.events.push(StoreEvent::local(EntityRef::property(id), ChangeKind::Updated));
        Ok(())
    }

    /// Delete a property with all of its items and rooms, children first.
    pub fn delete_property(&mut self, id: PropertyId) -> Result<()> {
        self.property(id)?;
        self.require_owner(id)?;

        let items: Vec<ItemId> = self.graph.items_of(id).iter().map(|i| i.id).collect();
        for item in items {
            self.emit_delete(id, EntityRef::item(item));
        }
        let rooms: Vec<RoomId> = self.graph.rooms_of(id).iter().map(|r| r.id).collect();
        for room in rooms {
            self.emit_delete(id, EntityRef::room(room));
        }

        let grant = EntityRef::grant(id);
        if self.graph.remove(&grant) {
            self.graph.dirty.insert(grant);
        }

        let was_active = self.graph.properties.get(&id).is_some_and(|p| p.active);
        self.emit_delete(id, EntityRef::property(id));
        if was_active {
            self.graph.active_dirty = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Create a room. Without an explicit index it goes after the last room.
    pub fn create_room(&mut self, property: PropertyId, name: &str, order_index: Option<i64>) -> Result<Room> {
        self.property(property)?;
        self.require_edit(property)?;
        let name = non_empty(name, "room name")?;

        let rooms = self.graph.rooms_of(property);
        if rooms.iter().any(|r| r.name == name) {
            return Err(Error::validation(format!("a room named {name:?} already exists")));
        }
        let order_index = match order_index {
            Some(index) if index < 0 => {
                return Err(Error::validation("order index must not be negative"));
            }
            Some(index) if rooms.iter().any(|r| r.order_index == index) => {
                return Err(Error::validation(format!("order index {index} is taken")));
            }
            Some(index) => index,
            None => rooms.iter().map(|r| r.order_index + 1).max().unwrap_or(0),
        };

        let room = Room { id: RoomId::new(), property, name, order_index };
        let fields = encode_fields(&room)?;
        self.graph.rooms.insert(room.id, room.clone());
        self.emit_create(property, EntityRef::room(room.id), fields);
        Ok(room)
    }

    /// Delete a room. Refuses when it still holds items unless `cascade_items`.
    pub fn delete_room(&mut self, id: RoomId, cascade_items: bool) -> Result<()> {
        let property = self.room(id)?.property;
        self.require_edit(property)?;

        let items: Vec<ItemId> = self.graph.items_in(id).iter().map(|i| i.id).collect();
        if !items.is_empty() && !cascade_items {
            return Err(Error::RoomNotEmpty { room: id, items: items.len() });
        }
        for item in items {
            self.emit_delete(property, EntityRef::item(item));
        }
        self.emit_delete(property, EntityRef::room(id));
        self.resequence_rooms(property)
    }

    /// Reassign order indices `0..n` following `new_order`
    pub fn reorder_rooms(&mut self, property: PropertyId, new_order: &[RoomId]) -> Result<()> {
        self.property(property)?;
        self.require_edit(property)?;

        let mut current: Vec<RoomId> = self.graph.rooms_of(property).iter().map(|r| r.id).collect();
        let mut proposed = new_order.to_vec();
        current.sort();
        proposed.sort();
        if current != proposed {
            return Err(Error::validation("new order is not a permutation of the property's rooms"));
        }

        self.assign_order(property, new_order)
    }

    fn resequence_rooms(&mut self, property: PropertyId) -> Result<()> {
        let order: Vec<RoomId> = self.graph.rooms_of(property).iter().map(|r| r.id).collect();
        self.assign_order(property, &order)
    }

    fn assign_order(&mut self, property: PropertyId, order: &[RoomId]) -> Result<()> {
        for (index, id) in order.iter().enumerate() {
            let index = i64::try_from(index).map_err(|_| Error::validation("too many rooms"))?;
            let before = self.room(*id)?.clone();
            if before.order_index == index {
                continue;
            }
            let after = Room { order_index: index, ..before.clone() };
            let fields = changed_fields(&before, &after)?;
            self.graph.rooms.insert(*id, after);
            self.emit_update(property, EntityRef::room(*id), fields);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Move items
    // ------------------------------------------------------------------

    /// Create an item in `room`, which must belong to `property`
    pub fn create_move_item(&mut self, room: RoomId, property: PropertyId, new: NewMoveItem) -> Result<MoveItem> {
        self.property(property)?;
        self.require_edit(property)?;
        let name = non_empty(&new.name, "item name")?;
        if self.room(room)?.property != property {
            return Err(Error::validation(format!("room {room} does not belong to property {property}")));
        }

        let item = MoveItem {
            id: ItemId::new(),
            property,
            room,
            name,
            notes: new.notes,
            owner: new.owner,
            price: non_negative(new.price, "price")?,
            image: new.image,
            date_created: Utc::now(),
        };
        let fields = encode_fields(&item)?;
        self.graph.items.insert(item.id, item.clone());
        self.emit_create(property, EntityRef::item(item.id), fields);
        Ok(item)
    }

    /// Delete one item
    pub fn delete_move_item(&mut self, id: ItemId) -> Result<()> {
        let property = self.move_item(id)?.property;
        self.require_edit(property)?;
        self.emit_delete(property, EntityRef::item(id));
        Ok(())
    }

    /// Mark an item as about to be deleted; it stops counting against the budget
    pub fn mark_pending_delete(&mut self, id: ItemId) -> Result<()> {
        let property = self.move_item(id)?.property;
        self.require_edit(property)?;
        if self.graph.pending_deletes.insert(id) {
            self.events.push(StoreEvent::local(EntityRef::item(id), ChangeKind::Updated));
        }
        Ok(())
    }

    /// Undo [`Self::mark_pending_delete`]
    pub fn cancel_pending_delete(&mut self, id: ItemId) -> Result<()> {
        self.move_item(id)?;
        if self.graph.pending_deletes.remove(&id) {
            self.events.push(StoreEvent::local(EntityRef::item(id), ChangeKind::Updated));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Partial updates
    // ------------------------------------------------------------------

    /// Apply a partial update
    pub fn update_fields(&mut self, patch: EntityPatch) -> Result<()> {
        match patch {
            EntityPatch::Property(id, patch) => self.update_property(id, patch),
            EntityPatch::Room(id, patch) => self.update_room(id, patch),
            EntityPatch::MoveItem(id, patch) => self.update_item(id, patch),
        }
    }

    fn update_property(&mut self, id: PropertyId, patch: PropertyPatch) -> Result<()> {
        let before = self.property(id)?.clone();
        self.require_edit(id)?;

        let mut after = before.clone();
        if let Some(name) = patch.name {
            after.name = non_empty(&name, "property name")?;
        }
        if let Some(color) = patch.color {
            after.color = color;
        }
        if let Some(budget) = patch.budget {
            after.budget = budget.map(|b| non_negative(b, "budget")).transpose()?;
        }
        if let Some(has_budget) = patch.has_budget {
            after.has_budget = has_budget;
        }

        let fields = changed_fields(&before, &after)?;
        self.graph.properties.insert(id, after);
        self.emit_update(id, EntityRef::property(id), fields);
        Ok(())
    }

    fn update_room(&mut self, id: RoomId, patch: RoomPatch) -> Result<()> {
        let before = self.room(id)?.clone();
        self.require_edit(before.property)?;

        let mut after = before.clone();
        if let Some(name) = patch.name {
            let name = non_empty(&name, "room name")?;
            if self.graph.rooms_of(before.property).iter().any(|r| r.id != id && r.name == name) {
                return Err(Error::validation(format!("a room named {name:?} already exists")));
            }
            after.name = name;
        }

        let fields = changed_fields(&before, &after)?;
        self.graph.rooms.insert(id, after);
        self.emit_update(before.property, EntityRef::room(id), fields);
        Ok(())
    }

    fn update_item(&mut self, id: ItemId, patch: ItemPatch) -> Result<()> {
        let before = self.move_item(id)?.clone();
        self.require_edit(before.property)?;

        let mut after = before.clone();
        if let Some(name) = patch.name {
            after.name = non_empty(&name, "item name")?;
        }
        if let Some(notes) = patch.notes {
            after.notes = notes;
        }
        if let Some(owner) = patch.owner {
            after.owner = owner;
        }
        if let Some(price) = patch.price {
            after.price = non_negative(price, "price")?;
        }
        if let Some(image) = patch.image {
            after.image = image;
        }
        if let Some(room) = patch.room {
            if self.room(room)?.property != before.property {
                return Err(Error::validation(format!(
                    "room {room} does not belong to property {}",
                    before.property
                )));
            }
            after.room = room;
        }

        let fields = changed_fields(&before, &after)?;
        self.graph.items.insert(id, after);
        self.emit_update(before.property, EntityRef::item(id), fields);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Share grants
    // ------------------------------------------------------------------

    /// Create the grant with `owner` as owner, or return the existing one
    pub(crate) fn share(&mut self, property: PropertyId, owner: Participant) -> Result<ShareGrant> {
        self.property(property)?;
        if let Some(existing) = self.graph.grants.get(&property).cloned() {
            if !existing.stopped {
                return Ok(existing);
            }
            self.require_owner(property)?;
            let resumed = ShareGrant { stopped: false, ..existing.clone() };
            return self.replace_grant(&existing, resumed);
        }

        let grant = ShareGrant::new(property, owner);
        let fields = encode_grant(&grant)?;
        self.graph.grants.insert(property, grant.clone());
        self.graph.refresh_shared(property);
        self.emit_create(property, EntityRef::grant(property), fields);
        Ok(grant)
    }

    /// Add or change one participant entry.
    ///
    /// The owner may write any entry. Anybody else may only write their own,
    /// within the limits of [`ShareGrant::check_self_entry`].
    pub(crate) fn put_participant(&mut self, property: PropertyId, participant: Participant) -> Result<ShareGrant> {
        let existing = self
            .graph
            .grants
            .get(&property)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("share grant of property {property}")))?;

        if !existing.is_owner(&self.me) {
            if participant.id != self.me {
                return Err(Error::permission_denied(format!(
                    "only the owner may change participants of property {property}"
                )));
            }
            existing.check_self_entry(&participant)?;
        }

        let mut updated = existing.clone();
        updated.participants.insert(participant.id, participant);
        self.replace_grant(&existing, updated)
    }

    /// Raise the link permission to cover a link handing out `permission`.
    /// Links already published keep working, so it never goes down.
    pub(crate) fn allow_link(&mut self, property: PropertyId, permission: Permission) -> Result<ShareGrant> {
        let existing = self
            .graph
            .grants
            .get(&property)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("share grant of property {property}")))?;
        self.require_owner(property)?;

        let raised = match existing.link_permission {
            Some(Permission::ReadWrite) => Permission::ReadWrite,
            _ => permission,
        };
        if existing.link_permission == Some(raised) {
            return Ok(existing);
        }
        let updated = ShareGrant { link_permission: Some(raised), ..existing.clone() };
        self.replace_grant(&existing, updated)
    }

    /// Remove every participant but the owner and mark the grant stopped
    pub(crate) fn stop_sharing(&mut self, property: PropertyId) -> Result<ShareGrant> {
        let existing = self
            .graph
            .grants
            .get(&property)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("share grant of property {property}")))?;
        self.require_owner(property)?;

        let mut stopped = existing.clone();
        stopped.stopped = true;
        for participant in stopped.participants.values_mut() {
            if participant.id != stopped.owner {
                participant.status = AcceptanceStatus::Removed;
            }
        }
        self.replace_grant(&existing, stopped)
    }

    fn replace_grant(&mut self, before: &ShareGrant, after: ShareGrant) -> Result<ShareGrant> {
        let property = after.property;
        let fields = changed_grant_fields(before, &after)?;
        self.graph.grants.insert(property, after.clone());
        self.graph.refresh_shared(property);
        self.emit_update(property, EntityRef::grant(property), fields);
        Ok(after)
    }
}
