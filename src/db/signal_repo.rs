use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult};
use crate::models::{NewSignal, RoutingRationale, Side, Signal, SizeModel, Venue};

#[async_trait]
pub trait SignalRepo: Send + Sync {
    /// Fails with `StoreError::UniqueViolation` when the dedup key already exists.
    async fn insert_signal(&self, signal: &NewSignal) -> StoreResult<Signal>;

    async fn signal_exists(&self, dedup_key: &str) -> StoreResult<bool>;

    async fn get_signal(&self, id: Uuid) -> StoreResult<Option<Signal>>;

    async fn recent_signals(&self, limit: i64) -> StoreResult<Vec<Signal>>;

    /// Signals not yet fanned out to deployments, oldest first.
    async fn signals_pending_fanout(&self, limit: i64) -> StoreResult<Vec<Signal>>;

    async fn mark_signal_fanned_out(&self, id: Uuid) -> StoreResult<()>;

    /// Write the routing decision only if none was recorded yet.
    async fn record_signal_route(
        &self,
        id: Uuid,
        venue: Venue,
        size_model: &SizeModel,
        rationale: &RoutingRationale,
    ) -> StoreResult<bool>;
}

#[derive(FromRow)]
struct SignalRow {
    id: Uuid,
    alpha_source_id: Uuid,
    external_event_id: String,
    token_symbol: String,
    side: String,
    confidence: f64,
    reasoning: Option<String>,
    attested: bool,
    dedup_key: String,
    venue: Option<String>,
    size_model: Option<Json<SizeModel>>,
    routing_rationale: Option<Json<RoutingRationale>>,
    fanned_out_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SignalRow> for Signal {
    type Error = StoreError;

    fn try_from(row: SignalRow) -> Result<Self, Self::Error> {
        let side = Side::from_api_str(&row.side)
            .ok_or_else(|| StoreError::corrupt("signals.side", &row.side))?;
        let venue = match row.venue {
            Some(v) => Some(Venue::from_str(&v).ok_or_else(|| StoreError::corrupt("signals.venue", &v))?),
            None => None,
        };

        Ok(Signal {
            id: row.id,
            alpha_source_id: row.alpha_source_id,
            external_event_id: row.external_event_id,
            token_symbol: row.token_symbol,
            side,
            confidence: row.confidence,
            reasoning: row.reasoning,
            attested: row.attested,
            dedup_key: row.dedup_key,
            venue,
            size_model: row.size_model.map(|j| j.0),
            routing_rationale: row.routing_rationale.map(|j| j.0),
            fanned_out_at: row.fanned_out_at,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl SignalRepo for PgStore {
    async fn insert_signal(&self, signal: &NewSignal) -> StoreResult<Signal> {
        let row = sqlx::query_as::<_, SignalRow>(
            r#"
            INSERT INTO signals
                (alpha_source_id, external_event_id, token_symbol, side, confidence,
                 reasoning, attested, dedup_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(signal.alpha_source_id)
        .bind(&signal.external_event_id)
        .bind(&signal.token_symbol)
        .bind(signal.side.as_str())
        .bind(signal.confidence)
        .bind(&signal.reasoning)
        .bind(signal.attested)
        .bind(signal.dedup_key())
        .fetch_one(self.pool())
        .await?;

        row.try_into()
    }

    async fn signal_exists(&self, dedup_key: &str) -> StoreResult<bool> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM signals WHERE dedup_key = $1)")
                .bind(dedup_key)
                .fetch_one(self.pool())
                .await?;

        Ok(row.0)
    }

    async fn get_signal(&self, id: Uuid) -> StoreResult<Option<Signal>> {
        let row = sqlx::query_as::<_, SignalRow>("SELECT * FROM signals WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn recent_signals(&self, limit: i64) -> StoreResult<Vec<Signal>> {
        let rows = sqlx::query_as::<_, SignalRow>(
            "SELECT * FROM signals ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn signals_pending_fanout(&self, limit: i64) -> StoreResult<Vec<Signal>> {
        let rows = sqlx::query_as::<_, SignalRow>(
            r#"
            SELECT * FROM signals
            WHERE fanned_out_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_signal_fanned_out(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE signals SET fanned_out_at = NOW() WHERE id = $1 AND fanned_out_at IS NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn record_signal_route(
        &self,
        id: Uuid,
        venue: Venue,
        size_model: &SizeModel,
        rationale: &RoutingRationale,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE signals
            SET venue = $2, size_model = $3, routing_rationale = $4
            WHERE id = $1 AND venue IS NULL
            "#,
        )
        .bind(id)
        .bind(venue.as_str())
        .bind(Json(size_model))
        .bind(Json(rationale))
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
