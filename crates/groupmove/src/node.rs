//! Main GroupMove node implementation.
//!
//! This module contains the [`GroupMove`] struct, the entry point for
//! applications. It owns:
//!
//! - **Participant identity**: persistent id attributed to every local write
//! - **Record store**: the SQLite-backed entity graph
//! - **Sharing and operations**: [`SharingService`] and [`PropertyManager`]
//! - **Background sync**: periodic push and pull against the replication channel
//!
//! # Example
//!
//! ```rust,no_run
//! use groupmove::{Color, Config, GroupMove, DEFAULT_ROOMS};
//!
//! # async fn example() -> groupmove::Result<()> {
//! let node = GroupMove::init(Config::default().with_relay_url("https://relay.example.com")).await?;
//!
//! let home = node
//!     .properties()
//!     .create_property_with_defaults("Blair House", Color::default(), false, None, &DEFAULT_ROOMS)?;
//! node.store().save()?;
//!
//! // Push and pull right away instead of waiting for the next cycle
//! node.sync_now().await?;
//! println!("{} change(s) still queued", node.sync_status().pending_outbound);
//!
//! node.shutdown().await?;
//! # let _ = home;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::identity::load_or_create_participant;
use crate::model::{ParticipantId, Property};
use crate::ops::PropertyManager;
use crate::sharing::{ShareToken, SharingService};
use crate::store::RecordStore;
use crate::sync::{HttpChannel, ReplicationChannel, ShareDirectory, SyncEngine, SyncReport, SyncStatus};

/// Internal state of the node
enum NodeState {
    /// Node is running
    Running {
        /// Handle to the background sync loop task
        sync_loop_handle: Option<JoinHandle<()>>,
        /// Sender to signal shutdown to the sync loop
        shutdown_tx: watch::Sender<bool>,
    },
    /// Node has been shut down
    Shutdown,
}

/// The main GroupMove node.
///
/// # Lifecycle
///
/// 1. Create with [`GroupMove::init()`] (or [`GroupMove::init_with_channel()`])
/// 2. Mutate through [`GroupMove::properties()`], [`GroupMove::store()`] and
///    [`GroupMove::sharing()`], calling [`RecordStore::save`] to make changes durable
/// 3. Shut down with [`GroupMove::shutdown()`]
///
/// Without a replication channel the node is local-only and never syncs.
pub struct GroupMove {
    config: Config,
    participant: ParticipantId,
    state: Arc<RwLock<NodeState>>,
    store: Arc<RecordStore>,
    sharing: Arc<SharingService>,
    properties: PropertyManager,
    sync: Option<Arc<SyncEngine>>,
}

impl std::fmt::Debug for GroupMove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMove")
            .field("participant", &self.participant)
            .field("storage_path", &self.config.storage_path)
            .field("syncing", &self.sync.is_some())
            .finish_non_exhaustive()
    }
}

impl GroupMove {
    /// Initialize a node, syncing through the relay at `config.relay_url` if set
    pub async fn init(config: Config) -> Result<Self> {
        let relay = match &config.relay_url {
            Some(url) => Some(Arc::new(HttpChannel::new(url)?)),
            None => None,
        };
        let channel = relay.clone().map(|c| c as Arc<dyn ReplicationChannel>);
        let directory = relay.map(|c| c as Arc<dyn ShareDirectory>);
        Self::init_with_channel(config, channel, directory).await
    }

    /// Initialize a node with explicit replication and share directory backends
    ///
    /// This will:
    /// 1. Load or create the persistent participant id
    /// 2. Open the record store
    /// 3. Start the background sync loop, if there is a channel
    pub async fn init_with_channel(
        config: Config,
        channel: Option<Arc<dyn ReplicationChannel>>,
        directory: Option<Arc<dyn ShareDirectory>>,
    ) -> Result<Self> {
        info!("Initializing GroupMove node");

        tokio::fs::create_dir_all(&config.storage_path)
            .await
            .map_err(|e| Error::config(format!("failed to create storage directory: {e}")))?;

        let participant = load_or_create_participant(&config.identity_path(), config.participant_id).await?;
        info!(participant = %participant, "Participant identity ready");

        let store = Arc::new(RecordStore::open(&config.database_path(), participant)?);
        let sharing = Arc::new(SharingService::new(
            Arc::clone(&store),
            config.participant_name.clone(),
            directory,
        ));
        let properties = PropertyManager::new(Arc::clone(&store), Arc::clone(&sharing));
        let sync = channel.map(|channel| {
            Arc::new(
                SyncEngine::new(Arc::clone(&store), channel)
                    .with_push_batch_size(config.push_batch_size)
                    .with_pull_batch_limit(config.pull_batch_limit),
            )
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sync_loop_handle = sync
            .as_ref()
            .map(|engine| Self::start_sync_loop(Arc::clone(engine), config.sync_interval_secs, shutdown_rx));
        if sync.is_none() {
            info!("No replication channel configured, running local-only");
        }

        info!("GroupMove node initialized successfully");
        Ok(Self {
            config,
            participant,
            state: Arc::new(RwLock::new(NodeState::Running { sync_loop_handle, shutdown_tx })),
            store,
            sharing,
            properties,
            sync,
        })
    }

    /// The local participant id
    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    /// The record store
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Sharing and access control
    pub fn sharing(&self) -> &Arc<SharingService> {
        &self.sharing
    }

    /// Property-level operations
    pub fn properties(&self) -> &PropertyManager {
        &self.properties
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replication status; the default status when running local-only
    pub fn sync_status(&self) -> SyncStatus {
        self.sync.as_ref().map(|engine| engine.status()).unwrap_or_default()
    }

    /// Check if the node is running
    pub fn is_running(&self) -> bool {
        matches!(&*self.state.read(), NodeState::Running { .. })
    }

    /// Trigger an immediate push and pull
    pub async fn sync_now(&self) -> Result<SyncReport> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        match &self.sync {
            Some(engine) => engine.sync_once().await,
            None => Ok(SyncReport::default()),
        }
    }

    /// Redeem a share token, then sync so the new property catches up
    pub async fn accept_share(&self, token: &ShareToken) -> Result<Property> {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }
        let property = self.sharing.accept_share(token).await?;
        if let Some(engine) = &self.sync {
            if let Err(e) = engine.sync_once().await {
                warn!(error = %e, "Sync after accepting share failed, will retry in background");
            }
        }
        Ok(property)
    }

    /// Shut down the node gracefully, saving pending changes
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down GroupMove node");

        let (sync_loop_handle, shutdown_tx) = {
            let mut state = self.state.write();
            match std::mem::replace(&mut *state, NodeState::Shutdown) {
                NodeState::Running { sync_loop_handle, shutdown_tx } => (sync_loop_handle, shutdown_tx),
                NodeState::Shutdown => {
                    debug!("Node already shut down");
                    return Ok(());
                }
            }
        };

        if shutdown_tx.send(true).is_err() {
            debug!("Sync loop already stopped (receiver dropped)");
        }

        if let Some(handle) = sync_loop_handle {
            debug!("Waiting for sync loop to stop");
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => debug!("Sync loop stopped gracefully"),
                Ok(Err(e)) => warn!("Sync loop task panicked: {e}"),
                Err(_) => warn!("Sync loop did not stop within timeout, aborting"),
            }
        }

        // Queued records survive in the outbox and are pushed on next start
        self.store.save()?;

        info!("GroupMove node shut down successfully");
        Ok(())
    }

    /// Start the background sync loop
    fn start_sync_loop(
        engine: Arc<SyncEngine>,
        sync_interval_secs: u64,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let sync_interval = Duration::from_secs(sync_interval_secs);

        tokio::spawn(async move {
            info!(interval_secs = sync_interval_secs, "Background sync loop started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Sync loop received shutdown signal");
                            break;
                        }
                    }
                    () = tokio::time::sleep(sync_interval) => {
                        match engine.sync_once().await {
                            Ok(report) => debug!(pushed = report.pushed, pulled = report.pulled, "Sync cycle finished"),
                            Err(e) => warn!(error = %e, "Sync cycle failed"),
                        }
                    }
                }
            }

            info!("Background sync loop stopped");
        })
    }
}
