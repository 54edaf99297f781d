//! Pricing tier, whitelist and grant queries.

use relaygate_core::db::unix_timestamp;

use super::db::{AdminDatabase, DatabaseError};
use super::models::{Grant, PricingTier, WhitelistEntry};

/// Parameters for creating or updating a pricing tier.
pub struct TierParams<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub amount_sats: i64,
    pub duration_days: Option<i64>,
    pub active: bool,
}

/// Parameters for adding or refreshing a whitelist entry.
pub struct WhitelistParams<'a> {
    pub pubkey: &'a str,
    pub npub: &'a str,
    pub nickname: &'a str,
    pub is_operator: bool,
    pub added_by: &'a str,
    pub tier_id: Option<&'a str>,
}

/// Parameters for upserting an active grant.
pub struct GrantParams<'a> {
    pub pubkey: &'a str,
    pub npub: &'a str,
    pub tier_id: &'a str,
    pub amount_sats: i64,
    pub expires_at: Option<i64>,
}

impl AdminDatabase {
    // =========================================================================
    // Pricing tiers
    // =========================================================================

    pub async fn upsert_tier(&self, params: &TierParams<'_>) -> Result<PricingTier, DatabaseError> {
        sqlx::query(
            "INSERT INTO pricing_tiers (id, name, amount_sats, duration_days, active, created_at) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, amount_sats = excluded.amount_sats,
                duration_days = excluded.duration_days, active = excluded.active",
        )
        .bind(params.id)
        .bind(params.name)
        .bind(params.amount_sats)
        .bind(params.duration_days)
        .bind(params.active)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_tier(params.id).await
    }

    pub async fn get_tier(&self, id: &str) -> Result<PricingTier, DatabaseError> {
        sqlx::query_as::<_, PricingTier>("SELECT * FROM pricing_tiers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Pricing tier {id}")))
    }

    pub async fn list_tiers(&self) -> Result<Vec<PricingTier>, DatabaseError> {
        let tiers =
            sqlx::query_as::<_, PricingTier>("SELECT * FROM pricing_tiers ORDER BY amount_sats ASC")
                .fetch_all(self.pool())
                .await?;
        Ok(tiers)
    }

    // =========================================================================
    // Whitelist
    // =========================================================================

    /// Add an entry, or refresh npub and granting tier of an existing one.
    ///
    /// The operator flag is sticky: refreshing never clears it.
    pub async fn upsert_whitelist_entry(
        &self,
        params: &WhitelistParams<'_>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO whitelist (pubkey, npub, nickname, is_operator, added_by, tier_id, added_at) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(pubkey) DO UPDATE SET npub = excluded.npub,
                tier_id = COALESCE(excluded.tier_id, whitelist.tier_id),
                is_operator = MAX(whitelist.is_operator, excluded.is_operator)",
        )
        .bind(params.pubkey)
        .bind(params.npub)
        .bind(params.nickname)
        .bind(params.is_operator)
        .bind(params.added_by)
        .bind(params.tier_id)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Remove a non-operator entry. Returns `false` if nothing was removed.
    pub async fn remove_whitelist_entry(&self, pubkey: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM whitelist WHERE pubkey = ? AND is_operator = 0")
            .bind(pubkey)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_whitelist_entry(
        &self,
        pubkey: &str,
    ) -> Result<Option<WhitelistEntry>, DatabaseError> {
        let entry = sqlx::query_as::<_, WhitelistEntry>("SELECT * FROM whitelist WHERE pubkey = ?")
            .bind(pubkey)
            .fetch_optional(self.pool())
            .await?;
        Ok(entry)
    }

    pub async fn list_whitelist(&self) -> Result<Vec<WhitelistEntry>, DatabaseError> {
        let entries =
            sqlx::query_as::<_, WhitelistEntry>("SELECT * FROM whitelist ORDER BY added_at, pubkey")
                .fetch_all(self.pool())
                .await?;
        Ok(entries)
    }

    /// Pubkey of the operator entry, if one is registered.
    pub async fn operator_pubkey(&self) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT pubkey FROM whitelist WHERE is_operator = 1 LIMIT 1")
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|r| r.0))
    }

    // =========================================================================
    // Grants (paid users)
    // =========================================================================

    /// Create or reactivate a grant.
    pub async fn upsert_grant(&self, params: &GrantParams<'_>) -> Result<Grant, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO paid_users (pubkey, npub, tier_id, amount_sats, status, expires_at, created_at, updated_at) VALUES (?, ?, ?, ?, 'active', ?, ?, ?)
             ON CONFLICT(pubkey) DO UPDATE SET npub = excluded.npub, tier_id = excluded.tier_id,
                amount_sats = excluded.amount_sats, status = 'active',
                expires_at = excluded.expires_at, updated_at = excluded.updated_at",
        )
        .bind(params.pubkey)
        .bind(params.npub)
        .bind(params.tier_id)
        .bind(params.amount_sats)
        .bind(params.expires_at)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_grant(params.pubkey)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Grant {}", params.pubkey)))
    }

    pub async fn get_grant(&self, pubkey: &str) -> Result<Option<Grant>, DatabaseError> {
        let grant = sqlx::query_as::<_, Grant>("SELECT * FROM paid_users WHERE pubkey = ?")
            .bind(pubkey)
            .fetch_optional(self.pool())
            .await?;
        Ok(grant)
    }

    /// Active grants whose expiry has passed.
    ///
    /// Lifetime grants have `expires_at IS NULL` and can never match.
    pub async fn list_expired_grants(&self, now: i64) -> Result<Vec<Grant>, DatabaseError> {
        let grants = sqlx::query_as::<_, Grant>(
            "SELECT * FROM paid_users WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ? ORDER BY expires_at",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(grants)
    }

    /// Flip an active grant that has lapsed by `now` to expired.
    ///
    /// Returns `false` if the grant is no longer active or was renewed past
    /// `now` since it was listed.
    pub async fn expire_grant(&self, pubkey: &str, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE paid_users SET status = 'expired', updated_at = ?
             WHERE pubkey = ? AND status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(unix_timestamp())
        .bind(pubkey)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
