use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult};
use crate::models::{Venue, WalletSlot};

#[async_trait]
pub trait WalletRepo: Send + Sync {
    async fn add_wallet(&self, venue: Venue, address: &str, credential_ref: &str)
        -> StoreResult<WalletSlot>;

    /// Hand the user a free slot for `venue`, or return the one they already hold.
    /// `None` when the pool for that venue is exhausted.
    async fn claim_wallet(&self, user_id: &str, venue: Venue) -> StoreResult<Option<WalletSlot>>;

    async fn release_wallet(&self, slot_id: Uuid) -> StoreResult<bool>;

    async fn wallet_for(&self, user_id: &str, venue: Venue) -> StoreResult<Option<WalletSlot>>;

    async fn wallets_for_user(&self, user_id: &str) -> StoreResult<Vec<WalletSlot>>;
}

#[derive(FromRow)]
struct WalletRow {
    id: Uuid,
    venue: String,
    address: String,
    credential_ref: String,
    assigned_user_id: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
}

impl TryFrom<WalletRow> for WalletSlot {
    type Error = StoreError;

    fn try_from(row: WalletRow) -> Result<Self, Self::Error> {
        Ok(WalletSlot {
            id: row.id,
            venue: Venue::from_str(&row.venue)
                .ok_or_else(|| StoreError::corrupt("wallet_pool.venue", &row.venue))?,
            address: row.address,
            credential_ref: row.credential_ref,
            assigned_user_id: row.assigned_user_id,
            assigned_at: row.assigned_at,
        })
    }
}

const WALLET_COLUMNS: &str = "id, venue, address, credential_ref, assigned_user_id, assigned_at";

#[async_trait]
impl WalletRepo for PgStore {
    async fn add_wallet(
        &self,
        venue: Venue,
        address: &str,
        credential_ref: &str,
    ) -> StoreResult<WalletSlot> {
        let row = sqlx::query_as::<_, WalletRow>(&format!(
            "INSERT INTO wallet_pool (venue, address, credential_ref) VALUES ($1, $2, $3) RETURNING {WALLET_COLUMNS}"
        ))
        .bind(venue.as_str())
        .bind(address)
        .bind(credential_ref)
        .fetch_one(self.pool())
        .await?;

        row.try_into()
    }

    async fn claim_wallet(&self, user_id: &str, venue: Venue) -> StoreResult<Option<WalletSlot>> {
        if let Some(held) = self.wallet_for(user_id, venue).await? {
            return Ok(Some(held));
        }

        // One conditional update; the partial unique index on (user, venue)
        // rejects a concurrent second claim by the same user.
        let claimed = sqlx::query_as::<_, WalletRow>(&format!(
            r#"
            UPDATE wallet_pool
            SET assigned_user_id = $1, assigned_at = NOW()
            WHERE id = (
                SELECT id FROM wallet_pool
                WHERE venue = $2 AND assigned_user_id IS NULL
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND assigned_user_id IS NULL
            RETURNING {WALLET_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(venue.as_str())
        .fetch_optional(self.pool())
        .await;

        match claimed {
            Ok(row) => row.map(TryInto::try_into).transpose(),
            Err(e) => match StoreError::from(e) {
                StoreError::UniqueViolation(_) => self.wallet_for(user_id, venue).await,
                other => Err(other),
            },
        }
    }

    async fn release_wallet(&self, slot_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE wallet_pool SET assigned_user_id = NULL, assigned_at = NULL
            WHERE id = $1 AND assigned_user_id IS NOT NULL
            "#,
        )
        .bind(slot_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn wallet_for(&self, user_id: &str, venue: Venue) -> StoreResult<Option<WalletSlot>> {
        let row = sqlx::query_as::<_, WalletRow>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallet_pool WHERE assigned_user_id = $1 AND venue = $2"
        ))
        .bind(user_id)
        .bind(venue.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn wallets_for_user(&self, user_id: &str) -> StoreResult<Vec<WalletSlot>> {
        let rows = sqlx::query_as::<_, WalletRow>(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallet_pool WHERE assigned_user_id = $1 ORDER BY venue"
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
