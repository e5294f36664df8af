//! Relay storage: per-property batch streams, stream writers and parked
//! share invitations

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use groupmove::{ChangeBatch, Delivery, ParticipantId, PropertyId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

/// Upper bound on batches returned by one read
pub const MAX_READ_LIMIT: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batches (
    stream TEXT NOT NULL,
    seq INTEGER NOT NULL,
    origin TEXT NOT NULL,
    batch TEXT NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (stream, seq)
);
CREATE TABLE IF NOT EXISTS writers (
    participant TEXT NOT NULL,
    stream TEXT NOT NULL,
    PRIMARY KEY (participant, stream)
);
CREATE TABLE IF NOT EXISTS shares (
    token TEXT PRIMARY KEY,
    invitation TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// SQLite database behind the relay
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.execute_batch(SCHEMA).context("Failed to create relay tables")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Append a batch to its stream and return the sequence number it got
    pub fn append(&self, batch: &ChangeBatch) -> Result<u64> {
        let stream = batch.property.to_string();
        let origin = batch.origin.to_string();
        let json = serde_json::to_string(batch).context("Failed to encode batch")?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let last: i64 = tx
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM batches WHERE stream = ?1", [&stream], |row| {
                row.get(0)
            })
            .context("Failed to read stream head")?;
        let seq = last + 1;
        tx.execute(
            "INSERT INTO batches (stream, seq, origin, batch, received_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![stream, seq, origin, json, Utc::now().to_rfc3339()],
        )
        .context("Failed to insert batch")?;
        tx.execute(
            "INSERT OR IGNORE INTO writers (participant, stream) VALUES (?1, ?2)",
            params![origin, stream],
        )
        .context("Failed to record writer")?;
        tx.commit().context("Failed to commit batch")?;

        debug!(stream = %batch.property, seq, records = batch.len(), "Batch appended");
        u64::try_from(seq).context("Sequence number out of range")
    }

    /// Batches of `stream` after `after`, oldest first
    pub fn batches_after(&self, stream: PropertyId, after: u64, limit: usize) -> Result<Vec<Delivery>> {
        let after = i64::try_from(after).context("Cursor out of range")?;
        let limit = i64::try_from(limit.min(MAX_READ_LIMIT)).context("Limit out of range")?;

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT seq, batch FROM batches WHERE stream = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3")
            .context("Failed to prepare statement")?;
        let rows = stmt
            .query_map(params![stream.to_string(), after, limit], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query batches")?;

        let mut result = Vec::new();
        for row in rows {
            let (seq, json) = row.context("Failed to read batch row")?;
            let batch: ChangeBatch = serde_json::from_str(&json).context("Failed to decode stored batch")?;
            let seq = u64::try_from(seq).context("Stored sequence number out of range")?;
            result.push(Delivery { stream, seq, batch });
        }
        Ok(result)
    }

    /// Streams `participant` has appended to
    pub fn streams_of(&self, participant: ParticipantId) -> Result<Vec<PropertyId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT stream FROM writers WHERE participant = ?1 ORDER BY stream")
            .context("Failed to prepare statement")?;
        let rows = stmt
            .query_map([participant.to_string()], |row| row.get::<_, String>(0))
            .context("Failed to query writers")?;

        let mut result = Vec::new();
        for row in rows {
            let stream = row.context("Failed to read writer row")?;
            result.push(stream.parse().context("Failed to parse stream id")?);
        }
        Ok(result)
    }

    /// Park an invitation and return the token redeeming it
    pub fn put_share(&self, invitation: &serde_json::Value) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let json = serde_json::to_string(invitation).context("Failed to encode invitation")?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shares (token, invitation, created_at) VALUES (?1, ?2, ?3)",
            params![token, json, Utc::now().to_rfc3339()],
        )
        .context("Failed to insert share")?;

        debug!(token = %token, "Share published");
        Ok(token)
    }

    /// The invitation behind `token`, if any
    pub fn get_share(&self, token: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row("SELECT invitation FROM shares WHERE token = ?1", [token], |row| row.get(0))
            .optional()
            .context("Failed to query share")?;

        json.map(|json| serde_json::from_str(&json).context("Failed to decode stored invitation"))
            .transpose()
    }
}
