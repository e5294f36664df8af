//! Basic usage example for GroupMove.
//!
//! This example demonstrates the core API:
//! - Initializing two nodes that share an in-memory replication channel
//! - Creating a property with default rooms and a budget
//! - Adding move-items and reading the grouped view
//! - Sharing the property and accepting the invitation on the other node
//! - Syncing and checking status
//! - Graceful shutdown
//!
//! Run with: cargo run --example basic_usage

use std::sync::Arc;

use groupmove::{
    Color, Config, GroupMove, MemoryChannel, Money, NewMoveItem, Permission, ReplicationChannel,
    ShareDirectory, DEFAULT_ROOMS,
};

fn handles(channel: &MemoryChannel) -> (Option<Arc<dyn ReplicationChannel>>, Option<Arc<dyn ShareDirectory>>) {
    let handle = channel.connect();
    (Some(Arc::new(handle.clone())), Some(Arc::new(handle)))
}

#[tokio::main]
async fn main() -> groupmove::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== GroupMove Basic Usage Example ===\n");

    // -------------------------------------------------------------------------
    // Step 1: Two nodes on one channel
    // -------------------------------------------------------------------------
    println!("1. Initializing nodes...");

    let base = std::env::temp_dir().join("groupmove-example");
    let channel = MemoryChannel::new();

    let (replication, directory) = handles(&channel);
    let alex = GroupMove::init_with_channel(
        Config::new(base.join("alex")).with_participant_name("Alex").with_sync_interval(3600),
        replication,
        directory,
    )
    .await?;

    let (replication, directory) = handles(&channel);
    let sam = GroupMove::init_with_channel(
        Config::new(base.join("sam")).with_participant_name("Sam").with_sync_interval(3600),
        replication,
        directory,
    )
    .await?;
    println!("   Alex: {}", alex.participant());
    println!("   Sam:  {}\n", sam.participant());

    // -------------------------------------------------------------------------
    // Step 2: A property with rooms and items
    // -------------------------------------------------------------------------
    println!("2. Creating a property...");

    let home = alex.properties().create_property_with_defaults(
        "Blair House",
        Color::default(),
        true,
        Some(Money::from_cents(2_500_00)),
        &DEFAULT_ROOMS,
    )?;
    let rooms = alex.store().rooms(home.id);
    let kitchen = &rooms[0];
    let bedroom = &rooms[4];

    alex.store().create_move_item(kitchen.id, home.id, NewMoveItem {
        name: "Microwave".into(),
        owner: "Alex".into(),
        price: "89.99".parse()?,
        ..Default::default()
    })?;
    alex.store().create_move_item(bedroom.id, home.id, NewMoveItem {
        name: "Lamp".into(),
        owner: "Alex".into(),
        price: Money::from_cents(24_50),
        ..Default::default()
    })?;
    alex.store().save()?;

    for (room, items) in alex.properties().group_items_by_room(home.id) {
        if !items.is_empty() {
            let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
            println!("   {}: {:?}", room.name, names);
        }
    }
    println!(
        "   Used budget: {} (remaining {})\n",
        alex.properties().compute_used_budget(home.id),
        alex.properties().remaining_budget(home.id).unwrap_or(Money::ZERO)
    );

    // -------------------------------------------------------------------------
    // Step 3: Share with Sam
    // -------------------------------------------------------------------------
    println!("3. Sharing...");

    let token = alex.sharing().publish_invitation(home.id, Permission::ReadWrite).await?;
    alex.sync_now().await?;
    let shared = sam.accept_share(&token).await?;
    println!("   Sam joined {:?}", shared.name);

    sam.store().create_move_item(kitchen.id, home.id, NewMoveItem {
        name: "Kettle".into(),
        owner: "Sam".into(),
        ..Default::default()
    })?;
    sam.store().save()?;
    sam.sync_now().await?;
    alex.sync_now().await?;

    let names: Vec<String> = alex
        .sharing()
        .current_participants(home.id)
        .into_iter()
        .map(|p| p.display_name)
        .collect();
    println!("   Participants: {names:?}");
    println!("   Kitchen on Alex's device: {} item(s)\n", alex.store().items_in_room(kitchen.id).len());

    // -------------------------------------------------------------------------
    // Step 4: Status and shutdown
    // -------------------------------------------------------------------------
    let status = alex.sync_status();
    println!("4. Pending outbound: {}, last push: {:?}", status.pending_outbound, status.last_push);

    alex.shutdown().await?;
    sam.shutdown().await?;
    println!("\n=== Example Complete ===");
    Ok(())
}
