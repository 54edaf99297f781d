//! Propagation of the whitelist to the running relay.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use relaygate_core::db::unix_timestamp;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::process::RelayProcess;
use crate::error::{AdminError, Result};
use crate::storage::AdminDatabase;

/// On-disk policy read by the relay.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyFile {
    pub pubkeys: Vec<String>,
    pub updated_at: i64,
}

/// Writes the whitelist for the relay and asks it to reload.
pub struct AccessSync {
    db: AdminDatabase,
    process: Arc<dyn RelayProcess>,
    policy_file: Option<PathBuf>,
}

impl AccessSync {
    pub fn new(
        db: AdminDatabase,
        process: Arc<dyn RelayProcess>,
        policy_file: Option<PathBuf>,
    ) -> Self {
        Self {
            db,
            process,
            policy_file,
        }
    }

    /// Publish the current whitelist. Returns the number of pubkeys written.
    pub async fn sync(&self) -> Result<usize> {
        let entries = self.db.list_whitelist().await?;
        let count = entries.len();

        if let Some(path) = &self.policy_file {
            let policy = PolicyFile {
                pubkeys: entries.into_iter().map(|e| e.pubkey).collect(),
                updated_at: unix_timestamp(),
            };
            write_atomically(path, &policy).await?;
            info!(path = %path.display(), pubkeys = count, "Relay policy written");
        }

        self.process.reload().await?;
        Ok(count)
    }

    /// [`Self::sync`] with failures logged instead of returned.
    pub async fn sync_best_effort(&self) {
        if let Err(e) = self.sync().await {
            warn!(error = %e, "Whitelist sync to relay failed; will retry on next change");
        }
    }
}

async fn write_atomically(path: &Path, policy: &PolicyFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(policy)
        .map_err(|e| AdminError::TransientExternal(format!("Failed to encode policy: {e}")))?;
    let io_err = |e: std::io::Error| {
        AdminError::TransientExternal(format!("Failed to write {}: {e}", path.display()))
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}
