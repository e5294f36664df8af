//! Multi-replica tests driven through the in-memory replication channel.

use std::sync::Arc;
use std::time::Duration;

use groupmove::journal::Fields;
use groupmove::{
    AcceptanceStatus, ChangeBatch, ChangeOp, ChangeRecord, Color, Delivery, EntityPatch, EntityRef, Error,
    ItemPatch, MemoryChannel, Money, NewMoveItem, Participant, ParticipantId, Permission, PropertyId,
    PropertyManager, RecordStore, ReplicationChannel, RoomId, ShareDirectory, SharingService, Stamp,
    SyncEngine, DEFAULT_ROOMS,
};

struct Replica {
    store: Arc<RecordStore>,
    sharing: Arc<SharingService>,
    ops: PropertyManager,
    sync: SyncEngine,
    link: MemoryChannel,
}

impl Replica {
    fn new(name: &str, channel: &MemoryChannel) -> Self {
        Self::with_participant(name, channel, ParticipantId::new())
    }

    fn with_participant(name: &str, channel: &MemoryChannel, id: ParticipantId) -> Self {
        let link = channel.connect();
        let store = Arc::new(RecordStore::open_in_memory(id).unwrap());
        let directory: Arc<dyn ShareDirectory> = Arc::new(link.clone());
        let sharing = Arc::new(SharingService::new(Arc::clone(&store), name, Some(directory)));
        let ops = PropertyManager::new(Arc::clone(&store), Arc::clone(&sharing));
        let sync = SyncEngine::new(Arc::clone(&store), Arc::new(link.clone()));
        Self { store, sharing, ops, sync, link }
    }

    async fn sync(&self) {
        self.store.save().unwrap();
        self.sync.sync_once().await.unwrap();
    }
}

fn item(name: &str, cents: i64) -> NewMoveItem {
    NewMoveItem { name: name.into(), price: Money::from_cents(cents), ..Default::default() }
}

/// Alex owns "Blair House" with a Kitchen holding a Microwave; Sam has joined
async fn shared_home(channel: &MemoryChannel, permission: Permission) -> (Replica, Replica, PropertyId, RoomId) {
    let alex = Replica::new("Alex", channel);
    let sam = Replica::new("Sam", channel);

    let home = alex
        .ops
        .create_property_with_defaults("Blair House", Color::default(), false, None, &["Kitchen", "Bedroom"])
        .unwrap();
    let kitchen = alex.store.rooms(home.id)[0].id;
    alex.store.create_move_item(kitchen, home.id, item("Microwave", 0)).unwrap();
    alex.sync().await;

    let token = alex.sharing.publish_invitation(home.id, permission).await.unwrap();
    alex.sync().await;
    sam.sharing.accept_share(&token).await.unwrap();
    sam.sync().await;
    alex.sync().await;

    (alex, sam, home.id, kitchen)
}

async fn price_after_concurrent_edits(alex_first: bool) -> (Money, Money) {
    let channel = MemoryChannel::new();
    let (alex, sam, _, kitchen) = shared_home(&channel, Permission::ReadWrite).await;
    let microwave = alex.store.items_in_room(kitchen)[0].id;
    let set_price = |store: &RecordStore, cents| {
        store
            .update_fields(EntityPatch::MoveItem(
                microwave,
                ItemPatch { price: Some(Money::from_cents(cents)), ..Default::default() },
            ))
            .unwrap();
        store.save().unwrap();
    };

    // Alex writes version 2, Sam writes versions 2 and 3
    set_price(&*alex.store, 100_00);
    set_price(&*sam.store, 50_00);
    set_price(&*sam.store, 75_00);

    let (first, second) = if alex_first { (&alex, &sam) } else { (&sam, &alex) };
    first.sync().await;
    second.sync().await;
    first.sync().await;

    (alex.store.move_item(microwave).unwrap().price, sam.store.move_item(microwave).unwrap().price)
}

#[tokio::test]
async fn newer_version_wins_in_either_arrival_order() {
    for alex_first in [true, false] {
        let (at_alex, at_sam) = price_after_concurrent_edits(alex_first).await;
        assert_eq!(at_alex, Money::from_cents(75_00), "alex_first = {alex_first}");
        assert_eq!(at_sam, Money::from_cents(75_00), "alex_first = {alex_first}");
    }
}

#[tokio::test]
async fn equal_versions_converge_on_one_winner() {
    let channel = MemoryChannel::new();
    let (alex, sam, _, kitchen) = shared_home(&channel, Permission::ReadWrite).await;
    let microwave = alex.store.items_in_room(kitchen)[0].id;

    for (replica, name) in [(&alex, "Alex's microwave"), (&sam, "Sam's microwave")] {
        replica
            .store
            .update_fields(EntityPatch::MoveItem(microwave, ItemPatch { name: Some(name.into()), ..Default::default() }))
            .unwrap();
    }
    alex.sync().await;
    sam.sync().await;
    alex.sync().await;

    let at_alex = alex.store.move_item(microwave).unwrap().name;
    let at_sam = sam.store.move_item(microwave).unwrap().name;
    assert_eq!(at_alex, at_sam);
}

#[tokio::test]
async fn unsaved_local_edit_survives_remote_update() {
    let channel = MemoryChannel::new();
    let (alex, sam, _, kitchen) = shared_home(&channel, Permission::ReadWrite).await;
    let microwave = alex.store.items_in_room(kitchen)[0].id;

    alex.store
        .update_fields(EntityPatch::MoveItem(
            microwave,
            ItemPatch { price: Some(Money::from_cents(42_00)), ..Default::default() },
        ))
        .unwrap();
    alex.sync().await;

    // Sam is still typing when Alex's update arrives
    sam.store
        .update_fields(EntityPatch::MoveItem(microwave, ItemPatch { notes: Some(Some("fragile".into())), ..Default::default() }))
        .unwrap();
    let report = sam.sync.pull().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(sam.store.move_item(microwave).unwrap().price, Money::ZERO);

    sam.store.save().unwrap();
    let merged = sam.store.move_item(microwave).unwrap();
    assert_eq!(merged.price, Money::from_cents(42_00));
    assert_eq!(merged.notes.as_deref(), Some("fragile"));

    sam.sync().await;
    alex.sync().await;
    assert_eq!(alex.store.move_item(microwave).unwrap().notes.as_deref(), Some("fragile"));
}

#[tokio::test]
async fn property_delete_cascades_and_redelivery_is_a_noop() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, kitchen) = shared_home(&channel, Permission::ReadWrite).await;
    for name in ["Toaster", "Kettle", "Blender"] {
        alex.store.create_move_item(kitchen, home, item(name, 0)).unwrap();
    }
    alex.sync().await;
    sam.sync().await;
    assert_eq!(sam.store.items(home).len(), 4);

    // Alex keeps a second property so the delete is allowed
    let cabin = alex
        .ops
        .create_property_with_defaults("Cabin", Color::default(), false, None, &[])
        .unwrap();
    alex.ops.set_active(home).unwrap();
    alex.ops.delete_active_property(cabin.id).unwrap();
    alex.sync().await;

    let before = channel.stream_len(home);
    sam.sync().await;
    assert!(sam.store.property(home).is_none());
    assert!(sam.store.rooms(home).is_empty());
    assert!(sam.store.items(home).is_empty());
    // Sam had nothing else to activate
    assert!(sam.store.active_property().is_none());

    let last = channel.receive(home, (before - 1) as u64, 1).await.unwrap().remove(0);
    let seq = channel.inject(last.batch.clone());
    let report = sam
        .sync
        .handle_delivery(Delivery { stream: home, seq, batch: last.batch })
        .unwrap()
        .unwrap();
    assert_eq!(report.applied, 0);
    assert!(report.duplicates > 0);
    assert!(sam.store.items(home).is_empty());
}

#[tokio::test]
async fn item_created_in_concurrently_deleted_room_is_dropped() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, _) = shared_home(&channel, Permission::ReadWrite).await;
    let bedroom = alex.store.rooms(home)[1].id;

    sam.store.create_move_item(bedroom, home, item("Lamp", 12_00)).unwrap();
    alex.store.delete_room(bedroom, false).unwrap();
    sam.sync().await;
    alex.sync().await;
    sam.sync().await;

    for replica in [&alex, &sam] {
        assert!(replica.store.room(bedroom).is_none());
        assert!(replica.store.items(home).iter().all(|i| i.room != bedroom));
        assert_eq!(replica.store.rooms(home).len(), 1);
    }
}

#[tokio::test]
async fn move_into_concurrently_deleted_room_converges() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, kitchen) = shared_home(&channel, Permission::ReadWrite).await;
    let bedroom = alex.store.rooms(home)[1].id;
    let microwave = alex.store.items_in_room(kitchen)[0].id;

    alex.store.delete_room(bedroom, false).unwrap();
    sam.ops.move_item(microwave, bedroom).unwrap();
    for _ in 0..2 {
        alex.sync().await;
        sam.sync().await;
    }

    for replica in [&alex, &sam] {
        assert!(replica.store.room(bedroom).is_none());
        assert!(replica.store.move_item(microwave).is_none());
        assert!(replica.store.items(home).is_empty());
        assert_eq!(replica.store.rooms(home).len(), 1);
    }
}

#[tokio::test]
async fn concurrent_same_name_rooms_both_survive() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, _) = shared_home(&channel, Permission::ReadWrite).await;

    alex.ops.add_room(home, "Garage").unwrap();
    sam.ops.add_room(home, "Garage").unwrap();
    for _ in 0..2 {
        alex.sync().await;
        sam.sync().await;
    }

    let at_alex: Vec<RoomId> = alex.store.rooms(home).iter().map(|r| r.id).collect();
    let at_sam: Vec<RoomId> = sam.store.rooms(home).iter().map(|r| r.id).collect();
    assert_eq!(at_alex, at_sam);
    let garages = alex.store.rooms(home).iter().filter(|r| r.name == "Garage").count();
    assert_eq!(garages, 2);

    // Locally the name stays unique
    assert!(matches!(alex.ops.add_room(home, "Garage"), Err(Error::Validation(_))));
}

/// A grant record in which `id` sets their own entry
fn self_entry(home: PropertyId, id: ParticipantId, name: &str, permission: Permission) -> ChangeRecord {
    let entry = Participant { id, display_name: name.into(), status: AcceptanceStatus::Accepted, permission };
    let mut fields = Fields::new();
    fields.insert(format!("participant:{id}"), serde_json::to_value(entry).unwrap());
    ChangeRecord { property: home, entity: EntityRef::grant(home), op: ChangeOp::Update, fields, stamp: Stamp::next(10, id) }
}

#[tokio::test]
async fn read_only_link_cannot_be_upgraded_by_guests() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, kitchen) = shared_home(&channel, Permission::ReadOnly).await;
    let kim = ParticipantId::new();

    // Sam asks for write access; Kim joins through the link asking for the same
    let sam_id = sam.store.participant();
    for (origin, name) in [(sam_id, "Sam"), (kim, "Kim")] {
        let forged = self_entry(home, origin, name, Permission::ReadWrite);
        sam.link.send(ChangeBatch::new(home, origin, &[forged]).unwrap()).await.unwrap();
    }
    let report = alex.sync.pull().await.unwrap();
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.parked, 0);

    let grant = alex.store.grant(home).unwrap();
    assert_eq!(grant.participant(&sam_id).unwrap().permission, Permission::ReadOnly);
    assert!(grant.participant(&kim).is_none());

    let mut fields = Fields::new();
    fields.insert("name".into(), serde_json::json!("Stolen"));
    let write = ChangeRecord {
        property: home,
        entity: EntityRef::room(kitchen),
        op: ChangeOp::Update,
        fields,
        stamp: Stamp::next(20, kim),
    };
    sam.link.send(ChangeBatch::new(home, kim, &[write]).unwrap()).await.unwrap();
    let report = alex.sync.pull().await.unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(alex.store.room(kitchen).unwrap().name, "Kitchen");
}

#[tokio::test]
async fn stopped_share_refuses_late_joins() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, kitchen) = shared_home(&channel, Permission::ReadWrite).await;
    let kim = Replica::new("Kim", &channel);

    let token = alex.sharing.publish_invitation(home, Permission::ReadWrite).await.unwrap();
    alex.sharing.stop_sharing(home).unwrap();
    alex.sync().await;

    // Kim redeems the link before hearing that sharing stopped
    kim.sharing.accept_share(&token).await.unwrap();
    kim.sync().await;
    alex.sync().await;
    sam.sync().await;

    let kim_id = kim.store.participant();
    for replica in [&alex, &sam] {
        let grant = replica.store.grant(home).unwrap();
        assert!(grant.stopped);
        assert!(grant.participant(&kim_id).is_none());
    }
    assert!(!kim.sharing.can_edit(home));
    let denied = kim.store.create_move_item(kitchen, home, item("Kettle", 0));
    assert!(matches!(denied, Err(Error::PermissionDenied(_))));
}

#[tokio::test]
async fn read_only_guest_is_enforced_on_both_sides() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, kitchen) = shared_home(&channel, Permission::ReadOnly).await;

    assert!(!sam.sharing.can_edit(home));
    let denied = sam.store.create_move_item(kitchen, home, item("Kettle", 0));
    assert!(matches!(denied, Err(Error::PermissionDenied(_))));

    // A forged write from the guest is skipped by the owner
    let mut fields = Fields::new();
    fields.insert("name".into(), serde_json::json!("Stolen"));
    let forged = ChangeRecord {
        property: home,
        entity: EntityRef::room(kitchen),
        op: ChangeOp::Update,
        fields,
        stamp: Stamp::next(10, sam.store.participant()),
    };
    sam.link.send(ChangeBatch::new(home, sam.store.participant(), &[forged]).unwrap()).await.unwrap();

    let report = alex.sync.pull().await.unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(alex.store.room(kitchen).unwrap().name, "Kitchen");

    let names: Vec<String> = alex.sharing.current_participants(home).into_iter().map(|p| p.display_name).collect();
    assert_eq!(names, vec!["Alex".to_string(), "Sam".to_string()]);
    assert_eq!(alex.ops.owner_candidates(home), names);
}

#[tokio::test]
async fn stop_sharing_revokes_guest_writes() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, kitchen) = shared_home(&channel, Permission::ReadWrite).await;

    alex.sharing.stop_sharing(home).unwrap();
    alex.sync().await;
    sam.sync().await;

    assert!(!sam.sharing.is_shared(home));
    let denied = sam.store.create_move_item(kitchen, home, item("Kettle", 0));
    assert!(matches!(denied, Err(Error::PermissionDenied(_))));
}

#[tokio::test]
async fn queued_records_are_pushed_after_outage() {
    let channel = MemoryChannel::new();
    let alex = Replica::new("Alex", &channel);
    let sam = Replica::new("Sam", &channel);
    let home = alex
        .ops
        .create_property_with_defaults("Blair House", Color::default(), false, None, &DEFAULT_ROOMS)
        .unwrap();
    alex.store.save().unwrap();

    alex.link.set_offline(true);
    let err = alex.sync.sync_once().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(alex.sync.status().pending_outbound, 7);
    assert!(alex.sync.status().consecutive_failures >= 1);
    assert_eq!(channel.stream_len(home.id), 0);

    alex.link.set_offline(false);
    let report = alex.sync.sync_once().await.unwrap();
    assert_eq!(report.pushed, 7);
    assert_eq!(alex.sync.status().pending_outbound, 0);
    assert_eq!(alex.sync.status().consecutive_failures, 0);

    // Nobody else sees a private property
    sam.sync().await;
    assert!(sam.store.property(home.id).is_none());
}

#[tokio::test]
async fn second_device_discovers_private_properties() {
    let channel = MemoryChannel::new();
    let me = ParticipantId::new();
    let laptop = Replica::with_participant("Alex", &channel, me);
    let phone = Replica::with_participant("Alex", &channel, me);

    let home = laptop
        .ops
        .create_property_with_defaults("Blair House", Color::default(), false, None, &["Kitchen"])
        .unwrap();
    let kitchen = laptop.store.rooms(home.id)[0].id;
    laptop.store.create_move_item(kitchen, home.id, item("Microwave", 89_99)).unwrap();
    laptop.sync().await;

    phone.sync().await;
    let synced = phone.store.property(home.id).unwrap();
    assert!(synced.active);
    assert_eq!(phone.ops.compute_used_budget(home.id), Money::from_cents(89_99));
}

#[tokio::test]
async fn grouped_view_scenario() {
    let channel = MemoryChannel::new();
    let alex = Replica::new("Alex", &channel);
    let sam = Replica::new("Sam", &channel);

    let home = alex
        .ops
        .create_property_with_defaults("Blair House", Color::default(), false, None, &["Kitchen", "Bedroom"])
        .unwrap();
    let rooms = alex.store.rooms(home.id);
    let (kitchen, bedroom) = (rooms[0].id, rooms[1].id);
    let microwave = alex.store.create_move_item(kitchen, home.id, item("Microwave", 0)).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let lamp = alex.store.create_move_item(bedroom, home.id, item("Lamp", 0)).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let kettle = alex.store.create_move_item(kitchen, home.id, item("Kettle", 0)).unwrap();

    let token = alex.sharing.publish_invitation(home.id, Permission::ReadOnly).await.unwrap();
    sam.sharing.accept_share(&token).await.unwrap();

    for replica in [&alex, &sam] {
        let grouped = replica.ops.group_items_by_room(home.id);
        let view: Vec<(String, Vec<_>)> = grouped
            .into_iter()
            .map(|(room, items)| (room.name, items.into_iter().map(|i| i.id).collect()))
            .collect();
        assert_eq!(
            view,
            vec![
                ("Kitchen".to_string(), vec![kettle.id, microwave.id]),
                ("Bedroom".to_string(), vec![lamp.id]),
            ]
        );
    }
}

#[tokio::test]
async fn reordered_rooms_replicate() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, _) = shared_home(&channel, Permission::ReadWrite).await;
    let garage = alex.ops.add_room(home, "Garage").unwrap();
    let mut order: Vec<RoomId> = alex.store.rooms(home).iter().map(|r| r.id).collect();
    order.reverse();

    alex.store.reorder_rooms(home, &order).unwrap();
    alex.sync().await;
    sam.sync().await;

    let at_sam: Vec<RoomId> = sam.store.rooms(home).iter().map(|r| r.id).collect();
    assert_eq!(at_sam, order);
    assert_eq!(at_sam[0], garage.id);
}

#[tokio::test]
async fn store_events_report_remote_changes() {
    let channel = MemoryChannel::new();
    let (alex, sam, home, kitchen) = shared_home(&channel, Permission::ReadWrite).await;
    let mut events = sam.store.subscribe();

    let toaster = alex.store.create_move_item(kitchen, home, item("Toaster", 0)).unwrap();
    alex.sync().await;
    sam.sync.pull().await.unwrap();

    let event = events.try_recv().unwrap();
    assert_eq!(event.entity, EntityRef::item(toaster.id));
    assert_eq!(event.origin, groupmove::ChangeOrigin::Remote);
    assert_eq!(event.kind, groupmove::ChangeKind::Created);
}
