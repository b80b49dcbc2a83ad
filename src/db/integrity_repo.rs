use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreResult};
use crate::models::IntegrityRejection;

#[async_trait]
pub trait IntegrityRepo: Send + Sync {
    async fn record_integrity_rejection(
        &self,
        source_identity: &str,
        external_event_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<IntegrityRejection>;

    async fn recent_integrity_rejections(&self, limit: i64)
        -> StoreResult<Vec<IntegrityRejection>>;
}

#[derive(FromRow)]
struct IntegrityRow {
    id: Uuid,
    source_identity: String,
    external_event_id: String,
    reason: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<IntegrityRow> for IntegrityRejection {
    fn from(row: IntegrityRow) -> Self {
        IntegrityRejection {
            id: row.id,
            source_identity: row.source_identity,
            external_event_id: row.external_event_id,
            reason: row.reason,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl IntegrityRepo for PgStore {
    async fn record_integrity_rejection(
        &self,
        source_identity: &str,
        external_event_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<IntegrityRejection> {
        let row = sqlx::query_as::<_, IntegrityRow>(
            r#"
            INSERT INTO integrity_rejections (source_identity, external_event_id, reason, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(source_identity)
        .bind(external_event_id)
        .bind(reason)
        .bind(payload)
        .fetch_one(self.pool())
        .await?;

        Ok(row.into())
    }

    async fn recent_integrity_rejections(
        &self,
        limit: i64,
    ) -> StoreResult<Vec<IntegrityRejection>> {
        let rows = sqlx::query_as::<_, IntegrityRow>(
            "SELECT * FROM integrity_rejections ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
