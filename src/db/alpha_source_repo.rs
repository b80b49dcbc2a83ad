use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult};
use crate::models::{AlphaSource, SourceKind};

#[async_trait]
pub trait AlphaSourceRepo: Send + Sync {
    /// Return the source registered under `identity`, creating it on first sight.
    /// An existing source keeps its original kind.
    async fn upsert_alpha_source(&self, identity: &str, kind: SourceKind)
        -> StoreResult<AlphaSource>;

    async fn get_alpha_source(&self, id: Uuid) -> StoreResult<Option<AlphaSource>>;

    async fn list_alpha_sources(&self) -> StoreResult<Vec<AlphaSource>>;

    async fn update_reputation(&self, id: Uuid, score: Decimal) -> StoreResult<()>;

    /// Sources are never deleted, only toggled.
    async fn set_alpha_source_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;
}

#[derive(FromRow)]
struct AlphaSourceRow {
    id: Uuid,
    identity: String,
    kind: String,
    reputation_score: Decimal,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AlphaSourceRow> for AlphaSource {
    type Error = StoreError;

    fn try_from(row: AlphaSourceRow) -> Result<Self, Self::Error> {
        Ok(AlphaSource {
            id: row.id,
            kind: SourceKind::from_str(&row.kind)
                .ok_or_else(|| StoreError::corrupt("alpha_sources.kind", &row.kind))?,
            identity: row.identity,
            reputation_score: row.reputation_score,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl AlphaSourceRepo for PgStore {
    async fn upsert_alpha_source(
        &self,
        identity: &str,
        kind: SourceKind,
    ) -> StoreResult<AlphaSource> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query_as::<_, AlphaSourceRow>(
            r#"
            INSERT INTO alpha_sources (identity, kind)
            VALUES ($1, $2)
            ON CONFLICT (identity) DO UPDATE SET identity = EXCLUDED.identity
            RETURNING *
            "#,
        )
        .bind(identity)
        .bind(kind.as_str())
        .fetch_one(self.pool())
        .await?;

        row.try_into()
    }

    async fn get_alpha_source(&self, id: Uuid) -> StoreResult<Option<AlphaSource>> {
        let row = sqlx::query_as::<_, AlphaSourceRow>("SELECT * FROM alpha_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_alpha_sources(&self) -> StoreResult<Vec<AlphaSource>> {
        let rows = sqlx::query_as::<_, AlphaSourceRow>(
            "SELECT * FROM alpha_sources ORDER BY reputation_score DESC, created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_reputation(&self, id: Uuid, score: Decimal) -> StoreResult<()> {
        sqlx::query(
            "UPDATE alpha_sources SET reputation_score = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(score)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn set_alpha_source_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE alpha_sources SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
