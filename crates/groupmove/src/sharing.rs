//! Share topology and access control.
//!
//! A property without a [`ShareGrant`] is private: the local participant owns
//! it and may do anything. Once shared, the grant decides who may edit. The
//! queries here are what a UI uses to enable or disable actions; the record
//! store re-checks the same rules on every local write and the sync engine on
//! every remote one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::journal::ChangeRecord;
use crate::model::{
    AcceptanceStatus, Participant, ParticipantId, Permission, Property, PropertyId, ShareGrant,
};
use crate::store::RecordStore;
use crate::sync::channel::ShareDirectory;

/// Opaque token handed to an invitee, redeemed with
/// [`SharingService::accept_share`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareToken(String);

impl ShareToken {
    /// Wrap a token string
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ShareToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        if token.is_empty() {
            return Err(Error::share("empty share token"));
        }
        Ok(Self(token.to_string()))
    }
}

/// What an invitee receives: the property subtree plus the permission offered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    /// The shared property
    pub property: PropertyId,
    /// The owner who sent the invitation
    pub inviter: Participant,
    /// Permission granted on acceptance
    pub permission: Permission,
    /// Records rebuilding the property, its grant, rooms and items
    pub records: Vec<ChangeRecord>,
}

/// Sharing and access-control queries for one local participant
pub struct SharingService {
    store: Arc<RecordStore>,
    me: Participant,
    directory: Option<Arc<dyn ShareDirectory>>,
}

impl SharingService {
    /// Create the service. `display_name` is how this participant shows up
    /// in other participants' lists.
    pub fn new(
        store: Arc<RecordStore>,
        display_name: impl Into<String>,
        directory: Option<Arc<dyn ShareDirectory>>,
    ) -> Self {
        let me = Participant {
            id: store.participant(),
            display_name: display_name.into(),
            status: AcceptanceStatus::Accepted,
            permission: Permission::ReadWrite,
        };
        Self { store, me, directory }
    }

    /// The local participant
    #[must_use]
    pub fn me(&self) -> &Participant {
        &self.me
    }

    /// Share a property, making the local participant its owner.
    ///
    /// Idempotent: an existing grant is returned unchanged. A stopped grant is
    /// resumed.
    pub fn share_property(&self, property: PropertyId) -> Result<ShareGrant> {
        let grant = self.store.transaction(|tx| tx.share(property, self.me.clone()))?;
        debug!(property = %property, owner = %grant.owner, "Property shared");
        Ok(grant)
    }

    /// Whether the property currently has a live grant
    #[must_use]
    pub fn is_shared(&self, property: PropertyId) -> bool {
        self.store.grant(property).is_some_and(|g| !g.stopped)
    }

    /// Whether the local participant owns the property
    #[must_use]
    pub fn is_owner(&self, property: PropertyId) -> bool {
        self.store.grant(property).map_or(true, |g| g.is_owner(&self.me.id))
    }

    /// Whether the local participant may edit the property
    #[must_use]
    pub fn can_edit(&self, property: PropertyId) -> bool {
        self.store.grant(property).map_or(true, |g| g.can_write(&self.me.id))
    }

    /// Whether the local participant may delete the property
    #[must_use]
    pub fn can_delete(&self, property: PropertyId) -> bool {
        self.is_owner(property)
    }

    /// Accepted participants, owner first. Empty for a private property.
    #[must_use]
    pub fn current_participants(&self, property: PropertyId) -> Vec<Participant> {
        self.store.grant(property).map(|g| g.accepted()).unwrap_or_default()
    }

    /// Every participant of the grant, whatever their status
    #[must_use]
    pub fn participants(&self, property: PropertyId) -> Vec<Participant> {
        self.store
            .grant(property)
            .map(|g| g.participants.into_values().collect())
            .unwrap_or_default()
    }

    /// Add a pending participant. Owner only; shares the property first if needed.
    pub fn invite(&self, property: PropertyId, id: ParticipantId, display_name: &str, permission: Permission) -> Result<ShareGrant> {
        self.store.transaction(|tx| {
            tx.share(property, self.me.clone())?;
            tx.require_owner(property)?;
            tx.put_participant(
                property,
                Participant {
                    id,
                    display_name: display_name.to_string(),
                    status: AcceptanceStatus::Pending,
                    permission,
                },
            )
        })
    }

    /// Change the permission of an existing participant. Owner only.
    pub fn set_permission(&self, property: PropertyId, id: ParticipantId, permission: Permission) -> Result<ShareGrant> {
        self.store.transaction(|tx| {
            let participant = tx
                .grant(property)
                .and_then(|g| g.participant(&id).cloned())
                .ok_or_else(|| Error::not_found(format!("participant {id} of property {property}")))?;
            tx.put_participant(property, Participant { permission, ..participant })
        })
    }

    /// Stop sharing: every participant but the owner is removed
    pub fn stop_sharing(&self, property: PropertyId) -> Result<ShareGrant> {
        let grant = self.store.transaction(|tx| tx.stop_sharing(property))?;
        info!(property = %property, "Stopped sharing property");
        Ok(grant)
    }

    /// Leave a property shared by somebody else
    pub fn leave(&self, property: PropertyId) -> Result<ShareGrant> {
        self.store.transaction(|tx| {
            let participant = tx
                .grant(property)
                .and_then(|g| g.participant(&self.me.id).cloned())
                .ok_or_else(|| Error::not_found(format!("participant {} of property {property}", self.me.id)))?;
            tx.put_participant(property, Participant { status: AcceptanceStatus::Removed, ..participant })
        })
    }

    fn directory(&self) -> Result<&Arc<dyn ShareDirectory>> {
        self.directory.as_ref().ok_or_else(|| Error::share("no share directory configured"))
    }

    /// Share the property and publish an invitation for it.
    ///
    /// Saves first, so the snapshot matches what is queued for replication.
    pub async fn publish_invitation(&self, property: PropertyId, permission: Permission) -> Result<ShareToken> {
        let directory = self.directory()?;
        if !self.is_owner(property) {
            return Err(Error::permission_denied(format!("only the owner may invite to property {property}")));
        }
        self.share_property(property)?;
        self.store.transaction(|tx| tx.allow_link(property, permission))?;
        self.store.save()?;

        let invitation = Invitation {
            property,
            inviter: self.me.clone(),
            permission,
            records: self.store.snapshot(property)?,
        };
        let records = invitation.records.len();
        let token = directory.publish(invitation).await?;
        info!(property = %property, records, "Published share invitation");
        Ok(token)
    }

    /// Accept an invitation: attach the remote property locally and join its grant
    pub async fn accept_share(&self, token: &ShareToken) -> Result<Property> {
        let invitation = self.directory()?.resolve(token).await?;
        self.accept_invitation(invitation)
    }

    /// Accept an invitation that was already fetched
    pub fn accept_invitation(&self, invitation: Invitation) -> Result<Property> {
        let property = invitation.property;
        if invitation.records.iter().any(|r| r.property != property) {
            return Err(Error::share("invitation mixes records of several properties"));
        }
        if self.store.is_deleted(property) {
            return Err(Error::share(format!("property {property} was deleted on this device")));
        }

        let records = invitation.records.into_iter().map(Ok).collect();
        let report = self.store.apply_remote(records, None, true)?;
        debug!(property = %property, applied = report.applied, "Applied invitation snapshot");

        let grant = self
            .store
            .grant(property)
            .ok_or_else(|| Error::share("invitation carries no share grant"))?;
        if grant.stopped {
            return Err(Error::share(format!("sharing of property {property} was stopped")));
        }

        if !grant.is_owner(&self.me.id) {
            let permission = grant.participant(&self.me.id).map_or(invitation.permission, |p| p.permission);
            let joined = Participant { status: AcceptanceStatus::Accepted, permission, ..self.me.clone() };
            self.store.transaction(|tx| tx.put_participant(property, joined))?;
        }
        self.store.save()?;

        let accepted = self
            .store
            .property(property)
            .ok_or_else(|| Error::share("invitation did not contain the property"))?;
        info!(property = %property, inviter = %invitation.inviter.display_name, "Accepted share");
        Ok(accepted)
    }
}
