//! SQLite persistence for the record store.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::graph::{EntityClock, Graph, InboxEntry, InboxReason, Tombstone};
use crate::error::{Error, Result};
use crate::journal::ChangeRecord;
use crate::model::{EntityKind, EntityRef, ItemId, MoveItem, Property, PropertyId, Room, RoomId, ShareGrant};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS properties (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        clock TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS rooms (
        id TEXT PRIMARY KEY,
        property_id TEXT NOT NULL,
        body TEXT NOT NULL,
        clock TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS move_items (
        id TEXT PRIMARY KEY,
        property_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        body TEXT NOT NULL,
        image BLOB,
        clock TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS share_grants (
        property_id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        clock TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS tombstones (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        property_id TEXT NOT NULL,
        stamp TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    );
    CREATE TABLE IF NOT EXISTS rejected (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    );
    CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        property_id TEXT NOT NULL,
        record TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        queued_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS inbox (
        position INTEGER PRIMARY KEY,
        reason TEXT NOT NULL,
        record TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pull_cursors (
        stream TEXT PRIMARY KEY,
        seq INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS local_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const ACTIVE_PROPERTY_KEY: &str = "active_property";

/// A queued outbound change record
#[derive(Debug, Clone)]
pub(crate) struct OutboxEntry {
    pub(crate) seq: i64,
    pub(crate) property: PropertyId,
    pub(crate) record: ChangeRecord,
}

/// Everything one durable commit writes
pub(crate) struct Flush<'a> {
    pub(crate) graph: &'a Graph,
    /// Entities whose row (or absence) and tombstone are rewritten
    pub(crate) entities: &'a BTreeSet<EntityRef>,
    /// Records appended to the outbox
    pub(crate) outbox: &'a [ChangeRecord],
    /// Properties whose queued records are dropped
    pub(crate) purge: &'a BTreeSet<PropertyId>,
    pub(crate) write_inbox: bool,
    pub(crate) cursor: Option<(PropertyId, u64)>,
}

/// SQLite database for entities, tombstones, outbox, inbox and cursors
pub(crate) struct Database {
    conn: Mutex<Connection>,
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::persistence(format!("failed to encode row: {e}")))
}

fn decode<T: DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::corrupt(format!("undecodable {what}: {e}")))
}

impl Database {
    /// Open or create the database
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::persistence(format!("failed to open SQLite database: {e}")))?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory database
    pub(crate) fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::persistence(format!("failed to create tables: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Load the whole graph. Undecodable rows are reported as corruption.
    pub(crate) fn load(&self) -> Result<Graph> {
        let conn = self.conn.lock();
        let mut graph = Graph::default();

        for (body, clock, _) in query_rows(&conn, "SELECT body, clock, NULL FROM properties")? {
            let property: Property = decode(&body, "property")?;
            graph.clocks.insert(EntityRef::property(property.id), decode(&clock, "clock")?);
            graph.properties.insert(property.id, property);
        }
        for (body, clock, _) in query_rows(&conn, "SELECT body, clock, NULL FROM rooms")? {
            let room: Room = decode(&body, "room")?;
            graph.clocks.insert(EntityRef::room(room.id), decode(&clock, "clock")?);
            graph.rooms.insert(room.id, room);
        }
        for (body, clock, image) in query_rows(&conn, "SELECT body, clock, image FROM move_items")? {
            let mut item: MoveItem = decode(&body, "move item")?;
            item.image = image.map(bytes::Bytes::from);
            graph.clocks.insert(EntityRef::item(item.id), decode(&clock, "clock")?);
            graph.items.insert(item.id, item);
        }
        for (body, clock, _) in query_rows(&conn, "SELECT body, clock, NULL FROM share_grants")? {
            let grant: ShareGrant = decode(&body, "share grant")?;
            graph.clocks.insert(EntityRef::grant(grant.property), decode(&clock, "clock")?);
            graph.grants.insert(grant.property, grant);
        }

        let mut stmt = conn.prepare("SELECT kind, id, property_id, stamp FROM tombstones")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (kind, id, property, stamp) = row?;
            let kind = EntityKind::parse(&kind).map_err(|e| Error::corrupt(e.to_string()))?;
            let id: uuid::Uuid = id
                .parse()
                .map_err(|e: uuid::Error| Error::corrupt(format!("bad tombstone id: {e}")))?;
            let property: PropertyId = property.parse().map_err(|e: Error| Error::corrupt(e.to_string()))?;
            graph.tombstones.insert(
                EntityRef { kind, id },
                Tombstone { property, stamp: decode(&stamp, "tombstone stamp")? },
            );
        }
        drop(stmt);

        let mut stmt = conn.prepare("SELECT kind, id FROM rejected")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (kind, id) = row?;
            let kind = EntityKind::parse(&kind).map_err(|e| Error::corrupt(e.to_string()))?;
            let id: uuid::Uuid = id
                .parse()
                .map_err(|e: uuid::Error| Error::corrupt(format!("bad rejected id: {e}")))?;
            graph.rejected.insert(EntityRef { kind, id });
        }
        drop(stmt);

        let mut stmt = conn.prepare("SELECT reason, record FROM inbox ORDER BY position")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (reason, record) = row?;
            let reason = InboxReason::parse(&reason)
                .ok_or_else(|| Error::corrupt(format!("bad inbox reason: {reason}")))?;
            graph.inbox.push(InboxEntry { reason, record: decode(&record, "inbox record")? });
        }
        drop(stmt);

        let mut stmt = conn.prepare("SELECT stream, seq FROM pull_cursors")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (stream, seq) = row?;
            let stream: PropertyId = stream.parse().map_err(|e: Error| Error::corrupt(e.to_string()))?;
            graph.cursors.insert(stream, u64::try_from(seq).unwrap_or(0));
        }
        drop(stmt);

        let active: Option<String> = conn
            .query_row(
                "SELECT value FROM local_state WHERE key = ?1",
                [ACTIVE_PROPERTY_KEY],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(active) = active {
            let id: PropertyId = active.parse().map_err(|e: Error| Error::corrupt(e.to_string()))?;
            if let Some(property) = graph.properties.get_mut(&id) {
                property.active = true;
            }
        }

        let shared: Vec<PropertyId> = graph.grants.keys().copied().collect();
        for property in shared {
            graph.refresh_shared(property);
        }

        debug!(
            properties = graph.properties.len(),
            rooms = graph.rooms.len(),
            items = graph.items.len(),
            tombstones = graph.tombstones.len(),
            "Loaded record store"
        );
        Ok(graph)
    }

    /// Write one flush inside a single SQLite transaction
    pub(crate) fn commit(&self, flush: &Flush<'_>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for entity in flush.entities {
            write_entity(&tx, flush.graph, entity)?;
        }

        for property in flush.purge {
            let purged = tx.execute("DELETE FROM outbox WHERE property_id = ?1", [property.to_string()])?;
            debug!(property = %property, purged, "Purged queued records of deleted property");
        }

        let queued_at = Utc::now().to_rfc3339();
        for record in flush.outbox {
            tx.execute(
                "INSERT INTO outbox (property_id, record, queued_at) VALUES (?1, ?2, ?3)",
                params![record.property.to_string(), encode(record)?, queued_at],
            )?;
        }

        if flush.write_inbox {
            tx.execute("DELETE FROM inbox", [])?;
            for (position, entry) in flush.graph.inbox.iter().enumerate() {
                tx.execute(
                    "INSERT INTO inbox (position, reason, record) VALUES (?1, ?2, ?3)",
                    params![i64::try_from(position).unwrap_or(i64::MAX), entry.reason.as_str(), encode(&entry.record)?],
                )?;
            }
        }

        if let Some((stream, seq)) = flush.cursor {
            tx.execute(
                "INSERT OR REPLACE INTO pull_cursors (stream, seq) VALUES (?1, ?2)",
                params![stream.to_string(), i64::try_from(seq).unwrap_or(i64::MAX)],
            )?;
        }

        match flush.graph.active_property() {
            Some(active) => tx.execute(
                "INSERT OR REPLACE INTO local_state (key, value) VALUES (?1, ?2)",
                params![ACTIVE_PROPERTY_KEY, active.id.to_string()],
            )?,
            None => tx.execute("DELETE FROM local_state WHERE key = ?1", [ACTIVE_PROPERTY_KEY])?,
        };

        tx.commit()?;
        Ok(())
    }

    /// Oldest queued records, at most `limit`
    pub(crate) fn outbox_head(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT seq, property_id, record FROM outbox ORDER BY seq LIMIT ?1")?;
        let rows = stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut entries = Vec::new();
        let mut unreadable = Vec::new();
        for row in rows {
            let (seq, property, record) = row?;
            match (property.parse::<PropertyId>(), serde_json::from_str::<ChangeRecord>(&record)) {
                (Ok(property), Ok(record)) => entries.push(OutboxEntry { seq, property, record }),
                (Err(e), _) => unreadable.push((seq, e.to_string())),
                (_, Err(e)) => unreadable.push((seq, e.to_string())),
            }
        }
        drop(stmt);

        for (seq, reason) in unreadable {
            warn!(seq, reason = %reason, "Dropping unreadable outbox row");
            conn.execute("DELETE FROM outbox WHERE seq = ?1", [seq])?;
        }
        Ok(entries)
    }

    /// Number of queued records
    pub(crate) fn outbox_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Drop records the channel accepted
    pub(crate) fn remove_outbox(&self, seqs: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for seq in seqs {
            tx.execute("DELETE FROM outbox WHERE seq = ?1", [seq])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Note a failed send against the records involved
    pub(crate) fn record_push_failure(&self, seqs: &[i64], error: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for seq in seqs {
            tx.execute(
                "UPDATE outbox SET attempts = attempts + 1, last_error = ?1 WHERE seq = ?2",
                params![error, seq],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Send attempts recorded for the oldest queued record
    pub(crate) fn head_attempts(&self) -> Result<Option<(i64, Option<String>)>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT attempts, last_error FROM outbox ORDER BY seq LIMIT 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn recreate_tables(&self) -> Result<()> {
        self.execute_raw(SCHEMA)
    }
}

type RawRow = (String, String, Option<Vec<u8>>);

fn query_rows(conn: &Connection, sql: &str) -> Result<Vec<RawRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

fn write_entity(tx: &Transaction<'_>, graph: &Graph, entity: &EntityRef) -> Result<()> {
    let id = entity.id.to_string();
    let clock = graph.clocks.get(entity).cloned().unwrap_or_default();

    match entity.kind {
        EntityKind::Property => match graph.properties.get(&PropertyId::from_uuid(entity.id)) {
            Some(property) => {
                tx.execute(
                    "INSERT OR REPLACE INTO properties (id, body, clock) VALUES (?1, ?2, ?3)",
                    params![id, encode(property)?, encode(&clock)?],
                )?;
            }
            None => {
                tx.execute("DELETE FROM properties WHERE id = ?1", [&id])?;
            }
        },
        EntityKind::Room => match graph.rooms.get(&RoomId::from_uuid(entity.id)) {
            Some(room) => {
                tx.execute(
                    "INSERT OR REPLACE INTO rooms (id, property_id, body, clock) VALUES (?1, ?2, ?3, ?4)",
                    params![id, room.property.to_string(), encode(room)?, encode(&clock)?],
                )?;
            }
            None => {
                tx.execute("DELETE FROM rooms WHERE id = ?1", [&id])?;
            }
        },
        EntityKind::MoveItem => match graph.items.get(&ItemId::from_uuid(entity.id)) {
            Some(item) => {
                let body = MoveItem { image: None, ..item.clone() };
                tx.execute(
                    "INSERT OR REPLACE INTO move_items (id, property_id, room_id, body, image, clock)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        item.property.to_string(),
                        item.room.to_string(),
                        encode(&body)?,
                        item.image.as_deref(),
                        encode(&clock)?
                    ],
                )?;
            }
            None => {
                tx.execute("DELETE FROM move_items WHERE id = ?1", [&id])?;
            }
        },
        EntityKind::ShareGrant => match graph.grants.get(&PropertyId::from_uuid(entity.id)) {
            Some(grant) => {
                tx.execute(
                    "INSERT OR REPLACE INTO share_grants (property_id, body, clock) VALUES (?1, ?2, ?3)",
                    params![id, encode(grant)?, encode(&clock)?],
                )?;
            }
            None => {
                tx.execute("DELETE FROM share_grants WHERE property_id = ?1", [&id])?;
            }
        },
    }

    if let Some(tombstone) = graph.tombstones.get(entity) {
        tx.execute(
            "INSERT OR IGNORE INTO tombstones (kind, id, property_id, stamp) VALUES (?1, ?2, ?3, ?4)",
            params![entity.kind.as_str(), id, tombstone.property.to_string(), encode(&tombstone.stamp)?],
        )?;
    }
    if graph.rejected.contains(entity) {
        tx.execute(
            "INSERT OR IGNORE INTO rejected (kind, id) VALUES (?1, ?2)",
            params![entity.kind.as_str(), id],
        )?;
    }
    Ok(())
}
