//! Replication channel and share directory interfaces, with two
//! implementations: an in-process [`MemoryChannel`] and an [`HttpChannel`]
//! talking to `groupmove-relay`.
//!
//! A channel is a durable append-only log per property ("stream"). `send`
//! appends one batch; `receive` returns batches after a sequence number. The
//! channel delivers at least once and keeps records in order within a batch;
//! it promises nothing about ordering across origins.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::journal::{ChangeBatch, Delivery};
use crate::model::{ParticipantId, PropertyId};
use crate::sharing::{Invitation, ShareToken};

/// Request timeout of the HTTP channel
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The replicated log the sync engine pushes to and pulls from
#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    /// Append a batch to the stream of `batch.property`
    async fn send(&self, batch: ChangeBatch) -> Result<()>;

    /// Batches of `stream` with a sequence number greater than `after`, oldest first
    async fn receive(&self, stream: PropertyId, after: u64, limit: usize) -> Result<Vec<Delivery>>;

    /// Streams `participant` has ever written to
    async fn streams(&self, participant: ParticipantId) -> Result<Vec<PropertyId>>;
}

/// Where share invitations are parked until the invitee redeems them
#[async_trait]
pub trait ShareDirectory: Send + Sync {
    /// Store an invitation and return the token that redeems it
    async fn publish(&self, invitation: Invitation) -> Result<ShareToken>;

    /// Look up an invitation; unknown tokens fail with [`Error::Share`]
    async fn resolve(&self, token: &ShareToken) -> Result<Invitation>;
}

// ============================================================================
// Wire types shared with the relay
// ============================================================================

/// Response to appending a batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchReceipt {
    /// Sequence number assigned to the batch
    pub seq: u64,
}

/// Query of a batch read
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReceiveQuery {
    /// Only batches with a greater sequence number
    #[serde(default)]
    pub after: u64,
    /// Maximum number of batches
    pub limit: Option<usize>,
}

/// Response to publishing an invitation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Token redeeming the invitation
    pub token: ShareToken,
}

// ============================================================================
// In-process channel
// ============================================================================

#[derive(Debug, Default)]
struct Hub {
    streams: HashMap<PropertyId, Vec<Delivery>>,
    writers: HashMap<ParticipantId, BTreeSet<PropertyId>>,
    shares: HashMap<ShareToken, Invitation>,
}

/// Channel kept in memory, shared by every handle made with [`MemoryChannel::connect`].
///
/// Each handle can be taken offline on its own, which makes all of its calls
/// fail with [`Error::Transport`].
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    hub: Arc<Mutex<Hub>>,
    offline: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Create an empty channel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Another handle to the same log with its own connectivity
    #[must_use]
    pub fn connect(&self) -> Self {
        Self { hub: Arc::clone(&self.hub), offline: Arc::new(AtomicBool::new(false)) }
    }

    /// Simulate losing or regaining connectivity
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of batches in a stream
    #[must_use]
    pub fn stream_len(&self, stream: PropertyId) -> usize {
        self.hub.lock().streams.get(&stream).map_or(0, Vec::len)
    }

    /// Append a delivery as-is, e.g. to replay a duplicate
    pub fn inject(&self, batch: ChangeBatch) -> u64 {
        let mut hub = self.hub.lock();
        let deliveries = hub.streams.entry(batch.property).or_default();
        let seq = deliveries.len() as u64 + 1;
        deliveries.push(Delivery { stream: batch.property, seq, batch });
        seq
    }

    fn online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::transport("channel offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationChannel for MemoryChannel {
    async fn send(&self, batch: ChangeBatch) -> Result<()> {
        self.online()?;
        let (property, origin, records) = (batch.property, batch.origin, batch.len());
        self.hub.lock().writers.entry(origin).or_default().insert(property);
        let seq = self.inject(batch);
        debug!(stream = %property, seq, records, "Appended batch");
        Ok(())
    }

    async fn receive(&self, stream: PropertyId, after: u64, limit: usize) -> Result<Vec<Delivery>> {
        self.online()?;
        let hub = self.hub.lock();
        Ok(hub
            .streams
            .get(&stream)
            .map(|deliveries| deliveries.iter().filter(|d| d.seq > after).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn streams(&self, participant: ParticipantId) -> Result<Vec<PropertyId>> {
        self.online()?;
        let hub = self.hub.lock();
        Ok(hub.writers.get(&participant).map(|s| s.iter().copied().collect()).unwrap_or_default())
    }
}

#[async_trait]
impl ShareDirectory for MemoryChannel {
    async fn publish(&self, invitation: Invitation) -> Result<ShareToken> {
        self.online()?;
        let token = ShareToken::new(Uuid::new_v4().simple().to_string());
        self.hub.lock().shares.insert(token.clone(), invitation);
        Ok(token)
    }

    async fn resolve(&self, token: &ShareToken) -> Result<Invitation> {
        self.online()?;
        self.hub
            .lock()
            .shares
            .get(token)
            .cloned()
            .ok_or_else(|| Error::share(format!("unknown share token {token}")))
    }
}

// ============================================================================
// HTTP relay client
// ============================================================================

/// Channel backed by a `groupmove-relay` server
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    base: String,
}

impl HttpChannel {
    /// Create a client for the relay at `relay_url`
    pub fn new(relay_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base: relay_url.trim_end_matches('/').to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(Error::transport(format!("relay returned {status}: {text}")))
}

fn unreachable_relay(e: &reqwest::Error) -> Error {
    Error::transport(format!("failed to reach relay: {e}"))
}

fn bad_response(e: &reqwest::Error) -> Error {
    Error::transport(format!("invalid response from relay: {e}"))
}

#[async_trait]
impl ReplicationChannel for HttpChannel {
    async fn send(&self, batch: ChangeBatch) -> Result<()> {
        let url = self.url(&format!("/streams/{}/batches", batch.property));
        let response = self.client.post(&url).json(&batch).send().await.map_err(|e| unreachable_relay(&e))?;
        let receipt: BatchReceipt = check(response).await?.json().await.map_err(|e| bad_response(&e))?;
        debug!(stream = %batch.property, seq = receipt.seq, records = batch.len(), "Sent batch to relay");
        Ok(())
    }

    async fn receive(&self, stream: PropertyId, after: u64, limit: usize) -> Result<Vec<Delivery>> {
        let url = self.url(&format!("/streams/{stream}/batches"));
        let query = ReceiveQuery { after, limit: Some(limit) };
        let response = self.client.get(&url).query(&query).send().await.map_err(|e| unreachable_relay(&e))?;
        check(response).await?.json().await.map_err(|e| bad_response(&e))
    }

    async fn streams(&self, participant: ParticipantId) -> Result<Vec<PropertyId>> {
        let url = self.url(&format!("/participants/{participant}/streams"));
        let response = self.client.get(&url).send().await.map_err(|e| unreachable_relay(&e))?;
        check(response).await?.json().await.map_err(|e| bad_response(&e))
    }
}

#[async_trait]
impl ShareDirectory for HttpChannel {
    async fn publish(&self, invitation: Invitation) -> Result<ShareToken> {
        let response = self
            .client
            .post(self.url("/shares"))
            .json(&invitation)
            .send()
            .await
            .map_err(|e| Error::share(format!("failed to reach relay: {e}")))?;
        let receipt: PublishReceipt = check(response)
            .await
            .map_err(|e| Error::share(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::share(format!("invalid response from relay: {e}")))?;
        Ok(receipt.token)
    }

    async fn resolve(&self, token: &ShareToken) -> Result<Invitation> {
        let response = self
            .client
            .get(self.url(&format!("/shares/{token}")))
            .send()
            .await
            .map_err(|e| Error::share(format!("failed to reach relay: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::share(format!("unknown share token {token}")));
        }
        check(response)
            .await
            .map_err(|e| Error::share(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::share(format!("invalid invitation from relay: {e}")))
    }
}
