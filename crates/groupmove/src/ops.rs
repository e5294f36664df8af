//! User-facing operations composed from store transactions.

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::model::{
    Color, EntityPatch, ItemId, ItemPatch, Money, MoveItem, NewProperty, Property, PropertyId, Room,
    RoomId,
};
use crate::sharing::SharingService;
use crate::store::graph::Graph;
use crate::store::RecordStore;

/// Rooms of a property in display order, each with its items newest first
pub type GroupedItems = Vec<(Room, Vec<MoveItem>)>;

/// Property-level operations that keep the cross-entity invariants
pub struct PropertyManager {
    store: Arc<RecordStore>,
    sharing: Arc<SharingService>,
}

impl PropertyManager {
    /// Create a manager over `store`
    pub fn new(store: Arc<RecordStore>, sharing: Arc<SharingService>) -> Self {
        Self { store, sharing }
    }

    /// Create a property with its rooms and make it the active one.
    ///
    /// Rooms get order indices `0..n` in the order given. Everything happens
    /// in one transaction; a duplicate room name aborts all of it.
    pub fn create_property_with_defaults(
        &self,
        name: &str,
        color: Color,
        with_budget: bool,
        budget: Option<Money>,
        room_names: &[&str],
    ) -> Result<Property> {
        let property = self.store.transaction(|tx| {
            let property = tx.create_property(NewProperty {
                name: name.to_string(),
                color,
                has_budget: with_budget,
                budget: if with_budget { budget } else { None },
            })?;
            for (index, room) in room_names.iter().enumerate() {
                let index = i64::try_from(index).map_err(|_| Error::validation("too many rooms"))?;
                tx.create_room(property.id, room, Some(index))?;
            }
            tx.set_active(property.id)?;
            tx.property(property.id).cloned()
        })?;
        info!(property = %property.id, rooms = room_names.len(), "Created property");
        Ok(property)
    }

    /// Make `id` the active property
    pub fn set_active(&self, id: PropertyId) -> Result<()> {
        self.store.transaction(|tx| tx.set_active(id))
    }

    /// Delete the active property and activate `fallback`.
    ///
    /// Fails with [`Error::LastProperty`] when it is the only property.
    pub fn delete_active_property(&self, fallback: PropertyId) -> Result<()> {
        self.store.transaction(|tx| {
            if tx.properties().len() < 2 {
                return Err(Error::LastProperty);
            }
            let active = tx
                .active_property()
                .ok_or_else(|| Error::not_found("active property"))?;
            if active.id == fallback {
                return Err(Error::validation("fallback must differ from the deleted property"));
            }
            tx.property(fallback)?;
            tx.delete_property(active.id)?;
            tx.set_active(fallback)
        })
    }

    /// Append a room after the existing ones
    pub fn add_room(&self, property: PropertyId, name: &str) -> Result<Room> {
        self.store.create_room(property, name, None)
    }

    /// Move an item to another room of the same property
    pub fn move_item(&self, item: ItemId, room: RoomId) -> Result<()> {
        self.store.update_fields(EntityPatch::MoveItem(item, ItemPatch { room: Some(room), ..Default::default() }))
    }

    /// Sum of item prices, leaving out items pending deletion
    #[must_use]
    pub fn compute_used_budget(&self, property: PropertyId) -> Money {
        self.store.read(|graph| used_budget(graph, property))
    }

    /// Budget left over, for a property that tracks one
    #[must_use]
    pub fn remaining_budget(&self, property: PropertyId) -> Option<Money> {
        self.store.read(|graph| {
            let tracked = graph.properties.get(&property).filter(|p| p.has_budget)?;
            Some(tracked.budget.unwrap_or(Money::ZERO) - used_budget(graph, property))
        })
    }

    /// Rooms by order index, each with its items newest first
    #[must_use]
    pub fn group_items_by_room(&self, property: PropertyId) -> GroupedItems {
        self.store.read(|graph| {
            graph
                .rooms_of(property)
                .into_iter()
                .map(|room| (room.clone(), graph.items_in(room.id).into_iter().cloned().collect()))
                .collect()
        })
    }

    /// Mark an item for deletion without deleting it yet
    pub fn mark_pending_delete(&self, item: ItemId) -> Result<()> {
        self.store.transaction(|tx| tx.mark_pending_delete(item))
    }

    /// Keep an item that was marked for deletion
    pub fn cancel_pending_delete(&self, item: ItemId) -> Result<()> {
        self.store.transaction(|tx| tx.cancel_pending_delete(item))
    }

    /// Delete every item of the property marked for deletion
    pub fn commit_pending_deletes(&self, property: PropertyId) -> Result<usize> {
        self.store.transaction(|tx| {
            let pending = tx.pending_deletes(property);
            for item in &pending {
                tx.delete_move_item(*item)?;
            }
            Ok(pending.len())
        })
    }

    /// Names an item's owner can be picked from: the accepted participants,
    /// or just the local participant for a private property
    #[must_use]
    pub fn owner_candidates(&self, property: PropertyId) -> Vec<String> {
        let participants = self.sharing.current_participants(property);
        if participants.is_empty() {
            return vec![self.sharing.me().display_name.clone()];
        }
        participants.into_iter().map(|p| p.display_name).collect()
    }
}

fn used_budget(graph: &Graph, property: PropertyId) -> Money {
    graph
        .items_of(property)
        .into_iter()
        .filter(|item| !graph.pending_deletes.contains(&item.id))
        .map(|item| item.price)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewMoveItem, ParticipantId, Permission};
    use crate::DEFAULT_ROOMS;

    fn manager() -> (Arc<RecordStore>, PropertyManager) {
        let store = Arc::new(RecordStore::open_in_memory(ParticipantId::new()).unwrap());
        let sharing = Arc::new(SharingService::new(Arc::clone(&store), "Alex", None));
        (Arc::clone(&store), PropertyManager::new(store, sharing))
    }

    fn item(name: &str, cents: i64) -> NewMoveItem {
        NewMoveItem { name: name.into(), price: Money::from_cents(cents), ..Default::default() }
    }

    #[test]
    fn test_create_with_defaults_orders_rooms() {
        let (store, manager) = manager();
        let home = manager
            .create_property_with_defaults("Blair House", Color::default(), false, None, &DEFAULT_ROOMS)
            .unwrap();

        assert!(home.active);
        let rooms = store.rooms(home.id);
        let names: Vec<&str> = rooms.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, DEFAULT_ROOMS);
        let indices: Vec<i64> = rooms.iter().map(|r| r.order_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_room_name_aborts_creation() {
        let (store, manager) = manager();
        let result =
            manager.create_property_with_defaults("Cabin", Color::default(), false, None, &["Kitchen", "Kitchen"]);
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(store.list_properties().is_empty());
    }

    #[test]
    fn test_exactly_one_active() {
        let (store, manager) = manager();
        let first = manager
            .create_property_with_defaults("First", Color::default(), false, None, &[])
            .unwrap();
        let second = manager
            .create_property_with_defaults("Second", Color::default(), false, None, &[])
            .unwrap();
        let third = manager
            .create_property_with_defaults("Third", Color::default(), false, None, &[])
            .unwrap();

        let active = |store: &RecordStore| -> Vec<PropertyId> {
            store.list_properties().iter().filter(|p| p.active).map(|p| p.id).collect()
        };
        assert_eq!(active(&store), vec![third.id]);

        manager.delete_active_property(first.id).unwrap();
        assert_eq!(active(&store), vec![first.id]);

        manager.delete_active_property(second.id).unwrap();
        assert_eq!(active(&store), vec![second.id]);

        let last = manager.delete_active_property(second.id);
        assert!(matches!(last, Err(Error::LastProperty)));
        assert_eq!(active(&store), vec![second.id]);
    }

    #[test]
    fn test_budget_excludes_pending_deletes() {
        let (store, manager) = manager();
        let home = manager
            .create_property_with_defaults(
                "Blair House",
                Color::default(),
                true,
                Some(Money::from_cents(100_00)),
                &["Kitchen"],
            )
            .unwrap();
        let kitchen = store.rooms(home.id)[0].id;
        store.create_move_item(kitchen, home.id, item("Table", 10_00)).unwrap();
        store.create_move_item(kitchen, home.id, item("Box", 0)).unwrap();
        let lamp = store.create_move_item(kitchen, home.id, item("Lamp", 5_50)).unwrap();

        assert_eq!(manager.compute_used_budget(home.id).to_string(), "15.50");
        assert_eq!(manager.remaining_budget(home.id), Some(Money::from_cents(84_50)));

        manager.mark_pending_delete(lamp.id).unwrap();
        assert_eq!(manager.compute_used_budget(home.id).to_string(), "10.00");

        manager.cancel_pending_delete(lamp.id).unwrap();
        assert_eq!(manager.compute_used_budget(home.id).to_string(), "15.50");

        manager.mark_pending_delete(lamp.id).unwrap();
        assert_eq!(manager.commit_pending_deletes(home.id).unwrap(), 1);
        assert!(store.move_item(lamp.id).is_none());
        assert!(store.pending_deletes(home.id).is_empty());
    }

    #[test]
    fn test_remaining_budget_without_budget() {
        let (_, manager) = manager();
        let home = manager
            .create_property_with_defaults("Cabin", Color::default(), false, Some(Money::from_cents(5)), &[])
            .unwrap();
        assert_eq!(manager.remaining_budget(home.id), None);
    }

    #[test]
    fn test_move_item_between_rooms() {
        let (store, manager) = manager();
        let home = manager
            .create_property_with_defaults("Blair House", Color::default(), false, None, &["Kitchen", "Bedroom"])
            .unwrap();
        let rooms = store.rooms(home.id);
        let lamp = store.create_move_item(rooms[0].id, home.id, item("Lamp", 0)).unwrap();

        manager.move_item(lamp.id, rooms[1].id).unwrap();
        let grouped = manager.group_items_by_room(home.id);
        assert!(grouped[0].1.is_empty());
        assert_eq!(grouped[1].1[0].id, lamp.id);
    }

    #[test]
    fn test_grouping_never_sees_a_half_moved_item() {
        let (store, manager) = manager();
        let home = manager
            .create_property_with_defaults("Blair House", Color::default(), false, None, &["Kitchen", "Bedroom"])
            .unwrap();
        let rooms = store.rooms(home.id);
        let lamp = store.create_move_item(rooms[0].id, home.id, item("Lamp", 0)).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..500 {
                    manager.move_item(lamp.id, rooms[(round + 1) % 2].id).unwrap();
                }
            });
            for _ in 0..500 {
                let grouped = manager.group_items_by_room(home.id);
                let seen: usize = grouped.iter().map(|(_, items)| items.len()).sum();
                assert_eq!(seen, 1);
            }
        });
    }

    #[test]
    fn test_owner_candidates() {
        let (store, manager) = manager();
        let home = manager
            .create_property_with_defaults("Blair House", Color::default(), false, None, &[])
            .unwrap();
        assert_eq!(manager.owner_candidates(home.id), vec!["Alex".to_string()]);

        let sharing = SharingService::new(Arc::clone(&store), "Alex", None);
        sharing.invite(home.id, ParticipantId::new(), "Sam", Permission::ReadWrite).unwrap();
        // Pending participants are not offered
        assert_eq!(manager.owner_candidates(home.id), vec!["Alex".to_string()]);
    }
}
