//! Participant identity management
//!
//! Each installation has a persistent participant id (a UUID). It stamps every
//! locally produced change record and identifies the local user in share grants.

use std::path::Path;

use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::ParticipantId;

/// Load or create a persistent participant id
///
/// If an identity file exists at the given path, it is loaded. Otherwise a new
/// id is generated and saved. When `pinned` is set, it overrides whatever is on
/// disk and is written back so later starts agree.
pub async fn load_or_create_participant(
    path: &Path,
    pinned: Option<ParticipantId>,
) -> Result<ParticipantId> {
    if let Some(id) = pinned {
        write_participant(path, id).await?;
        return Ok(id);
    }

    if fs::try_exists(path)
        .await
        .map_err(|e| Error::config(format!("failed to stat identity file: {e}")))?
    {
        load_participant(path).await
    } else {
        let id = ParticipantId::new();
        write_participant(path, id).await?;
        info!(participant = %id, path = %path.display(), "Generated new participant identity");
        Ok(id)
    }
}

async fn load_participant(path: &Path) -> Result<ParticipantId> {
    debug!(path = %path.display(), "Loading participant identity");

    let text = fs::read_to_string(path)
        .await
        .map_err(|e| Error::config(format!("failed to read identity file: {e}")))?;

    let id: ParticipantId = text
        .trim()
        .parse()
        .map_err(|_| Error::config("invalid identity file (expected a UUID)"))?;

    info!(participant = %id, "Loaded existing participant identity");
    Ok(id)
}

async fn write_participant(path: &Path, id: ParticipantId) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::config(format!("failed to create directory: {e}")))?;
    }

    fs::write(path, format!("{id}\n"))
        .await
        .map_err(|e| Error::config(format!("failed to write identity file: {e}")))
}
