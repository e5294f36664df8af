//! Change records and their wire form.
//!
//! Every committed local transaction yields an ordered list of [`ChangeRecord`]s.
//! A record names one entity, the operation, the changed fields as JSON values,
//! and a [`Stamp`] used for last-writer-wins resolution.
//!
//! Records travel inside a [`ChangeBatch`] whose records are kept as raw JSON,
//! so one undecodable record only costs itself, never the whole batch.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    EntityKind, EntityRef, MoveItem, Participant, ParticipantId, Property, PropertyId, Room,
    ShareGrant,
};

/// Field name to JSON value
pub type Fields = BTreeMap<String, Value>;

/// Field carrying a move-item's room assignment; applied after scalar fields.
pub const ROOM_FIELD: &str = "room";

/// Field naming the owning property; fixed at creation.
pub const PROPERTY_FIELD: &str = "property";

const GRANT_OWNER_FIELD: &str = "owner";
const GRANT_STOPPED_FIELD: &str = "stopped";
const GRANT_LINK_FIELD: &str = "link_permission";
const GRANT_PARTICIPANT_PREFIX: &str = "participant:";

/// Total order for last-writer-wins: version, then wall clock, then origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Per-entity logical version
    pub version: u64,
    /// Milliseconds since the Unix epoch at the origin
    pub timestamp_ms: i64,
    /// The participant that produced the change
    pub origin: ParticipantId,
}

impl Stamp {
    /// Stamp a local change following `current` (the entity's highest version)
    #[must_use]
    pub fn next(current: u64, origin: ParticipantId) -> Self {
        Self {
            version: current + 1,
            timestamp_ms: Utc::now().timestamp_millis(),
            origin,
        }
    }
}

/// What a record does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// The entity came into existence with all of `fields`
    Create,
    /// Some fields changed
    Update,
    /// The entity was deleted; terminal
    Delete,
}

/// One field-level or lifecycle mutation of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The property whose stream carries this record
    pub property: PropertyId,
    /// The entity changed
    pub entity: EntityRef,
    /// Operation
    pub op: ChangeOp,
    /// Changed fields; empty for deletes
    #[serde(default)]
    pub fields: Fields,
    /// Resolution stamp
    #[serde(flatten)]
    pub stamp: Stamp,
}

impl ChangeRecord {
    /// Whether the record carries the move-item room relationship
    #[must_use]
    pub fn moves_item(&self) -> bool {
        self.entity.kind == EntityKind::MoveItem && self.fields.contains_key(ROOM_FIELD)
    }

    /// Split off the relationship fields, leaving the scalar ones in `self`
    pub(crate) fn split_relationship(&mut self) -> Option<Self> {
        if self.entity.kind != EntityKind::MoveItem {
            return None;
        }
        let room = self.fields.remove(ROOM_FIELD)?;
        Some(Self {
            fields: Fields::from([(ROOM_FIELD.to_string(), room)]),
            ..self.clone()
        })
    }
}

/// A group of records for one property, as handed to the replication channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Stream key
    pub property: PropertyId,
    /// Sender
    pub origin: ParticipantId,
    /// Encoded [`ChangeRecord`]s in emission order
    pub records: Vec<Value>,
}

impl ChangeBatch {
    /// Encode records into a batch
    pub fn new(property: PropertyId, origin: ParticipantId, records: &[ChangeRecord]) -> Result<Self> {
        let records = records
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::validation(format!("unencodable change record: {e}")))?;
        Ok(Self { property, origin, records })
    }

    /// Decode every record independently
    #[must_use]
    pub fn decode(&self) -> Vec<std::result::Result<ChangeRecord, String>> {
        self.records
            .iter()
            .map(|raw| {
                let record: ChangeRecord =
                    serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
                if record.property != self.property {
                    return Err(format!(
                        "record for property {} in stream {}",
                        record.property, self.property
                    ));
                }
                Ok(record)
            })
            .collect()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch carries no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A batch as stored by the channel, with its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Stream the batch was appended to
    pub stream: PropertyId,
    /// Monotonic sequence number within the stream
    pub seq: u64,
    /// The batch itself
    pub batch: ChangeBatch,
}

// ============================================================================
// Field codec
// ============================================================================

/// Entities replicated through serde field maps.
pub(crate) trait Replicated: Serialize + DeserializeOwned + Clone {
    /// Serialized fields that never leave this replica
    const LOCAL_FIELDS: &'static [&'static str];

    fn entity_ref(&self) -> EntityRef;
}

impl Replicated for Property {
    const LOCAL_FIELDS: &'static [&'static str] = &["id", "is_shared", "active"];

    fn entity_ref(&self) -> EntityRef {
        EntityRef::property(self.id)
    }
}

impl Replicated for Room {
    const LOCAL_FIELDS: &'static [&'static str] = &["id"];

    fn entity_ref(&self) -> EntityRef {
        EntityRef::room(self.id)
    }
}

impl Replicated for MoveItem {
    const LOCAL_FIELDS: &'static [&'static str] = &["id"];

    fn entity_ref(&self) -> EntityRef {
        EntityRef::item(self.id)
    }
}

fn to_object<T: Serialize>(entity: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::validation("entity did not encode to an object")),
        Err(e) => Err(Error::validation(format!("unencodable entity: {e}"))),
    }
}

/// All replicated fields of an entity
pub(crate) fn encode_fields<T: Replicated>(entity: &T) -> Result<Fields> {
    Ok(to_object(entity)?
        .into_iter()
        .filter(|(name, _)| !T::LOCAL_FIELDS.contains(&name.as_str()))
        .collect())
}

/// Replicated fields whose value differs between `before` and `after`
pub(crate) fn changed_fields<T: Replicated>(before: &T, after: &T) -> Result<Fields> {
    let before = encode_fields(before)?;
    Ok(encode_fields(after)?
        .into_iter()
        .filter(|(name, value)| before.get(name) != Some(value))
        .collect())
}

/// Build an entity from `fields`, on top of `base` when it already exists
pub(crate) fn decode_entity<T: Replicated>(id: Uuid, base: Option<&T>, fields: &Fields) -> Result<T> {
    let mut object = match base {
        Some(entity) => to_object(entity)?,
        None => Map::new(),
    };
    object.insert("id".to_string(), Value::String(id.to_string()));
    for (name, value) in fields {
        if T::LOCAL_FIELDS.contains(&name.as_str()) {
            continue;
        }
        object.insert(name.clone(), value.clone());
    }
    serde_json::from_value(Value::Object(object))
        .map_err(|e| Error::validation(format!("malformed fields: {e}")))
}

/// All replicated fields of a share grant
pub(crate) fn encode_grant(grant: &ShareGrant) -> Result<Fields> {
    let mut fields = Fields::new();
    fields.insert(GRANT_OWNER_FIELD.to_string(), Value::String(grant.owner.to_string()));
    fields.insert(GRANT_STOPPED_FIELD.to_string(), Value::Bool(grant.stopped));
    if let Some(permission) = grant.link_permission {
        fields.insert(
            GRANT_LINK_FIELD.to_string(),
            serde_json::to_value(permission).map_err(|e| Error::validation(format!("unencodable permission: {e}")))?,
        );
    }
    for participant in grant.participants.values() {
        fields.insert(participant_field(&participant.id), encode_participant(participant)?);
    }
    Ok(fields)
}

/// Grant fields that differ between `before` and `after`
pub(crate) fn changed_grant_fields(before: &ShareGrant, after: &ShareGrant) -> Result<Fields> {
    let before = encode_grant(before)?;
    Ok(encode_grant(after)?
        .into_iter()
        .filter(|(name, value)| before.get(name) != Some(value))
        .collect())
}

/// Owner named by the fields of a grant record, if any
pub(crate) fn grant_owner(fields: &Fields) -> Option<ParticipantId> {
    serde_json::from_value(fields.get(GRANT_OWNER_FIELD)?.clone()).ok()
}

/// Field name of one participant entry
pub(crate) fn participant_field(id: &ParticipantId) -> String {
    format!("{GRANT_PARTICIPANT_PREFIX}{id}")
}

/// Participant named by a grant field, if it is a participant entry
pub(crate) fn participant_of_field(name: &str) -> Option<ParticipantId> {
    name.strip_prefix(GRANT_PARTICIPANT_PREFIX)?.parse().ok()
}

fn encode_participant(participant: &Participant) -> Result<Value> {
    serde_json::to_value(participant).map_err(|e| Error::validation(format!("unencodable participant: {e}")))
}

/// Apply one replicated field to a grant
pub(crate) fn apply_grant_field(grant: &mut ShareGrant, name: &str, value: &Value) -> Result<()> {
    let malformed = |e: serde_json::Error| Error::validation(format!("malformed grant field {name}: {e}"));
    match name {
        GRANT_OWNER_FIELD => grant.owner = serde_json::from_value(value.clone()).map_err(malformed)?,
        GRANT_STOPPED_FIELD => grant.stopped = serde_json::from_value(value.clone()).map_err(malformed)?,
        GRANT_LINK_FIELD => grant.link_permission = serde_json::from_value(value.clone()).map_err(malformed)?,
        _ => {
            let id = participant_of_field(name)
                .ok_or_else(|| Error::validation(format!("unknown grant field: {name}")))?;
            let participant: Participant = serde_json::from_value(value.clone()).map_err(malformed)?;
            if participant.id != id {
                return Err(Error::validation(format!("participant entry {name} names {}", participant.id)));
            }
            grant.participants.insert(id, participant);
        }
    }
    Ok(())
}

/// Build a grant from the fields of its create record
pub(crate) fn decode_grant(property: PropertyId, fields: &Fields) -> Result<ShareGrant> {
    let owner_value = fields
        .get(GRANT_OWNER_FIELD)
        .ok_or_else(|| Error::validation("grant create without owner"))?;
    let owner: ParticipantId = serde_json::from_value(owner_value.clone())
        .map_err(|e| Error::validation(format!("malformed grant owner: {e}")))?;
    let mut grant = ShareGrant {
        property,
        owner,
        participants: BTreeMap::new(),
        stopped: false,
        link_permission: None,
    };
    for (name, value) in fields {
        apply_grant_field(&mut grant, name, value)?;
    }
    Ok(grant)
}
