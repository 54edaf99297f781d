//! Expiry of time-limited access grants.

use std::sync::Arc;

use async_trait::async_trait;
use relaygate_core::db::unix_timestamp;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::access::AccessSync;
use crate::error::Result;
use crate::storage::{AdminDatabase, AuditAction, SYSTEM_ACTOR};
use crate::supervisor::PeriodicJob;

pub struct ExpiryEngine {
    db: AdminDatabase,
    access: Arc<AccessSync>,
}

impl ExpiryEngine {
    pub const fn new(db: AdminDatabase, access: Arc<AccessSync>) -> Self {
        Self { db, access }
    }

    /// Expire every lapsed grant and drop it from the whitelist.
    ///
    /// Returns the number of grants expired by this call.
    pub async fn run_once(&self) -> Result<usize> {
        let now = unix_timestamp();
        let lapsed = self.db.list_expired_grants(now).await?;
        let mut expired = 0;

        for grant in lapsed {
            if !self.db.expire_grant(&grant.pubkey, now).await? {
                debug!(pubkey = %grant.pubkey, "Grant already expired or renewed");
                continue;
            }
            expired += 1;

            match self.db.remove_whitelist_entry(&grant.pubkey).await {
                Ok(true) => {}
                Ok(false) => debug!(pubkey = %grant.pubkey, "No removable whitelist entry"),
                Err(e) => warn!(pubkey = %grant.pubkey, error = %e, "Failed to remove whitelist entry"),
            }

            let details = json!({
                "pubkey": grant.pubkey,
                "tier_id": grant.tier_id,
                "expires_at": grant.expires_at,
            });
            if let Err(e) = self
                .db
                .add_audit_log(AuditAction::GrantExpired, &details.to_string(), SYSTEM_ACTOR)
                .await
            {
                warn!(error = %e, "Failed to write audit log");
            }
            info!(pubkey = %grant.pubkey, tier_id = %grant.tier_id, "Grant expired");
        }

        if expired > 0 {
            self.access.sync_best_effort().await;
        }
        Ok(expired)
    }
}

#[async_trait]
impl PeriodicJob for ExpiryEngine {
    async fn run(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}
