//! Entity model: properties, rooms, move-items and share grants.
//!
//! Entities are plain values. Relationships are held as typed ids
//! ([`Room::property`], [`MoveItem::room`]) and resolved through the
//! [`RecordStore`](crate::RecordStore), which is the only place that enforces
//! relationship integrity.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// The underlying UUID
            #[must_use]
            pub const fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| Error::validation(format!("invalid {}: {e}", stringify!($name))))
            }
        }
    };
}

entity_id!(
    /// Identifier of a [`Property`]
    PropertyId
);
entity_id!(
    /// Identifier of a [`Room`]
    RoomId
);
entity_id!(
    /// Identifier of a [`MoveItem`]
    ItemId
);
entity_id!(
    /// Identifier of a participant (a user on one or more devices)
    ParticipantId
);

/// Fixed-point decimal amount with two fractional digits, stored as cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Build from a whole number of cents
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// The amount in cents
    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Whether the amount is exactly zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Money {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));

        let invalid = || Error::validation(format!("invalid amount: {s:?}"));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -cents } else { cents }))
    }
}

/// A palette token: six hex digits, stored upper-case without `#`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    /// Parse a hex token, accepting an optional leading `#`
    pub fn parse(token: &str) -> Result<Self> {
        let hex = token.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::validation(format!("invalid color token: {token:?}")));
        }
        Ok(Self(hex.to_ascii_uppercase()))
    }

    /// The normalized hex token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Color {
    fn default() -> Self {
        Self(crate::DEFAULT_COLOR.to_string())
    }
}

impl TryFrom<String> for Color {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A home being tracked; root aggregate owning rooms and move-items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Stable id
    pub id: PropertyId,
    /// Display name
    pub name: String,
    /// Palette token
    pub color: Color,
    /// Budget amount, `None` meaning "no budget"
    pub budget: Option<Money>,
    /// Whether item prices count against a budget
    pub has_budget: bool,
    /// Cached from the share grant; local to this replica
    #[serde(default)]
    pub is_shared: bool,
    /// Whether this is the local user's active property; local to this replica
    #[serde(default)]
    pub active: bool,
    /// Creation time
    pub date_created: DateTime<Utc>,
}

/// An ordered sub-container of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Stable id
    pub id: RoomId,
    /// Owning property
    pub property: PropertyId,
    /// Display name
    pub name: String,
    /// Display and move order within the property
    pub order_index: i64,
}

/// A single inventoried object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveItem {
    /// Stable id
    pub id: ItemId,
    /// Owning property
    pub property: PropertyId,
    /// The room the item is assigned to; never absent
    pub room: RoomId,
    /// Display name, never empty
    pub name: String,
    /// Free-form notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Participant display name
    pub owner: String,
    /// Price, meaningful only when the property has a budget
    #[serde(default)]
    pub price: Money,
    /// Encoded photo, base64 in serialized form
    #[serde(default, with = "image_base64")]
    pub image: Option<Bytes>,
    /// Creation time
    pub date_created: DateTime<Utc>,
}

mod image_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(image: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match image {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

/// Fields for [`RecordStore::create_property`](crate::RecordStore::create_property).
#[derive(Debug, Clone, Default)]
pub struct NewProperty {
    /// Display name
    pub name: String,
    /// Palette token
    pub color: Color,
    /// Whether a budget is tracked
    pub has_budget: bool,
    /// Budget amount
    pub budget: Option<Money>,
}

/// Fields for creating a [`MoveItem`].
#[derive(Debug, Clone, Default)]
pub struct NewMoveItem {
    /// Display name, must not be empty
    pub name: String,
    /// Free-form notes
    pub notes: Option<String>,
    /// Participant display name
    pub owner: String,
    /// Price
    pub price: Money,
    /// Encoded photo
    pub image: Option<Bytes>,
}

/// Partial update of a [`Property`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct PropertyPatch {
    /// New name
    pub name: Option<String>,
    /// New color
    pub color: Option<Color>,
    /// New budget; `Some(None)` clears it
    pub budget: Option<Option<Money>>,
    /// New budget flag
    pub has_budget: Option<bool>,
}

/// Partial update of a [`Room`].
#[derive(Debug, Clone, Default)]
pub struct RoomPatch {
    /// New name
    pub name: Option<String>,
}

/// Partial update of a [`MoveItem`].
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    /// New name
    pub name: Option<String>,
    /// New notes; `Some(None)` clears them
    pub notes: Option<Option<String>>,
    /// New owner
    pub owner: Option<String>,
    /// New price
    pub price: Option<Money>,
    /// New image; `Some(None)` clears it
    pub image: Option<Option<Bytes>>,
    /// Reassign to another room of the same property
    pub room: Option<RoomId>,
}

/// A partial update addressed to one entity, for
/// [`RecordStore::update_fields`](crate::RecordStore::update_fields).
#[derive(Debug, Clone)]
pub enum EntityPatch {
    /// Update a property
    Property(PropertyId, PropertyPatch),
    /// Update a room
    Room(RoomId, RoomPatch),
    /// Update a move-item
    MoveItem(ItemId, ItemPatch),
}

/// Acceptance state of a participant in a share grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    /// Invited, not yet answered
    Pending,
    /// Participating
    Accepted,
    /// Declined, left, or removed by the owner
    Removed,
}

/// Permission level of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// May read but not write
    ReadOnly,
    /// May read and write
    ReadWrite,
}

/// A participant of a shared property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant id
    pub id: ParticipantId,
    /// Display name, also used as [`MoveItem::owner`]
    pub display_name: String,
    /// Acceptance status
    pub status: AcceptanceStatus,
    /// Permission level
    pub permission: Permission,
}

impl Participant {
    /// Whether the participant currently takes part in the share
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.status == AcceptanceStatus::Accepted
    }

    /// Whether the participant may write
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.is_accepted() && self.permission == Permission::ReadWrite
    }
}

/// Share topology of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGrant {
    /// The shared property
    pub property: PropertyId,
    /// The owning participant, also present in `participants`
    pub owner: ParticipantId,
    /// Every participant ever invited, keyed by id
    pub participants: BTreeMap<ParticipantId, Participant>,
    /// Set by the owner when sharing was stopped
    #[serde(default)]
    pub stopped: bool,
    /// Highest permission a published link hands out; `None` until one is
    /// published
    #[serde(default)]
    pub link_permission: Option<Permission>,
}

impl ShareGrant {
    /// Create a grant owned by `owner`
    #[must_use]
    pub fn new(property: PropertyId, owner: Participant) -> Self {
        let owner_id = owner.id;
        let owner = Participant {
            status: AcceptanceStatus::Accepted,
            permission: Permission::ReadWrite,
            ..owner
        };
        Self {
            property,
            owner: owner_id,
            participants: BTreeMap::from([(owner_id, owner)]),
            stopped: false,
            link_permission: None,
        }
    }

    /// Look up a participant
    #[must_use]
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Whether `id` is the owner
    #[must_use]
    pub fn is_owner(&self, id: &ParticipantId) -> bool {
        self.owner == *id
    }

    /// Whether `id` may write records for the property. Only the owner may
    /// once sharing stopped.
    #[must_use]
    pub fn can_write(&self, id: &ParticipantId) -> bool {
        self.is_owner(id) || (!self.stopped && self.participant(id).is_some_and(Participant::can_write))
    }

    /// Check an entry a non-owner writes about themselves.
    ///
    /// A named participant may change their status but never their
    /// permission, and after sharing stopped may only leave. Anybody else
    /// joins through the published link: only while sharing is on, and at
    /// most with the link's permission.
    pub fn check_self_entry(&self, entry: &Participant) -> Result<()> {
        if let Some(existing) = self.participant(&entry.id) {
            if existing.permission != entry.permission {
                return Err(Error::permission_denied("participants may not change their own permission"));
            }
            if self.stopped && entry.status != AcceptanceStatus::Removed {
                return Err(Error::permission_denied("sharing was stopped"));
            }
            return Ok(());
        }

        if self.stopped {
            return Err(Error::permission_denied("sharing was stopped"));
        }
        match (self.link_permission, entry.permission) {
            (None, _) => Err(Error::permission_denied("property has no published link")),
            (Some(Permission::ReadOnly), Permission::ReadWrite) => {
                Err(Error::permission_denied("link only grants read access"))
            }
            _ => Ok(()),
        }
    }

    /// Accepted participants, owner first, then by display name
    #[must_use]
    pub fn accepted(&self) -> Vec<Participant> {
        let mut accepted: Vec<Participant> = self
            .participants
            .values()
            .filter(|p| p.is_accepted())
            .cloned()
            .collect();
        accepted.sort_by(|a, b| {
            (a.id != self.owner, &a.display_name).cmp(&(b.id != self.owner, &b.display_name))
        });
        accepted
    }
}

/// Kinds of replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// [`Property`]
    Property,
    /// [`Room`]
    Room,
    /// [`MoveItem`]
    MoveItem,
    /// [`ShareGrant`], keyed by its property id
    ShareGrant,
}

impl EntityKind {
    /// Stable lowercase name used in storage
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Property => "property",
            Self::Room => "room",
            Self::MoveItem => "move_item",
            Self::ShareGrant => "share_grant",
        }
    }

    /// Parse the storage name
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "property" => Ok(Self::Property),
            "room" => Ok(Self::Room),
            "move_item" => Ok(Self::MoveItem),
            "share_grant" => Ok(Self::ShareGrant),
            other => Err(Error::validation(format!("unknown entity kind: {other}"))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-tagged reference to any replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity type
    pub kind: EntityKind,
    /// Entity id
    pub id: Uuid,
}

impl EntityRef {
    /// Reference a property
    #[must_use]
    pub const fn property(id: PropertyId) -> Self {
        Self { kind: EntityKind::Property, id: id.uuid() }
    }

    /// Reference a room
    #[must_use]
    pub const fn room(id: RoomId) -> Self {
        Self { kind: EntityKind::Room, id: id.uuid() }
    }

    /// Reference a move-item
    #[must_use]
    pub const fn item(id: ItemId) -> Self {
        Self { kind: EntityKind::MoveItem, id: id.uuid() }
    }

    /// Reference the share grant of a property
    #[must_use]
    pub const fn grant(property: PropertyId) -> Self {
        Self { kind: EntityKind::ShareGrant, id: property.uuid() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
