use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult};
use crate::models::{IntentState, IntentUpdate, NewIntent, RoutingRationale, SizeModel, TradeIntent, Venue};

#[async_trait]
pub trait IntentRepo: Send + Sync {
    /// Insert unless an intent already exists for the (signal, deployment) pair.
    /// Returns `None` when another router got there first.
    async fn create_intent(&self, intent: &NewIntent) -> StoreResult<Option<TradeIntent>>;

    async fn get_intent(&self, id: Uuid) -> StoreResult<Option<TradeIntent>>;

    async fn intent_for(&self, signal_id: Uuid, deployment_id: Uuid)
        -> StoreResult<Option<TradeIntent>>;

    /// Oldest first.
    async fn intents_in_state(&self, state: IntentState, limit: i64) -> StoreResult<Vec<TradeIntent>>;

    async fn list_intents(&self, state: Option<IntentState>, limit: i64)
        -> StoreResult<Vec<TradeIntent>>;

    /// Conditional `from → to` transition. `None` means the intent was not in `from`.
    async fn transition_intent(
        &self,
        id: Uuid,
        from: IntentState,
        to: IntentState,
        update: &IntentUpdate,
    ) -> StoreResult<Option<TradeIntent>>;

    /// Intents sitting in one of `states` without progress since `before`.
    async fn stale_intents(&self, states: &[IntentState], before: DateTime<Utc>)
        -> StoreResult<Vec<TradeIntent>>;
}

#[derive(FromRow)]
struct IntentRow {
    id: Uuid,
    signal_id: Uuid,
    deployment_id: Uuid,
    state: String,
    venue: Option<String>,
    size_model: Option<Json<SizeModel>>,
    rationale: Option<Json<RoutingRationale>>,
    excluded_venues: Vec<String>,
    tx_ref: Option<String>,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for TradeIntent {
    type Error = StoreError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        let state = IntentState::from_str(&row.state)
            .ok_or_else(|| StoreError::corrupt("trade_intents.state", &row.state))?;
        let venue = match row.venue {
            Some(v) => Some(
                Venue::from_str(&v).ok_or_else(|| StoreError::corrupt("trade_intents.venue", &v))?,
            ),
            None => None,
        };
        let excluded_venues = row
            .excluded_venues
            .iter()
            .map(|v| {
                Venue::from_str(v)
                    .ok_or_else(|| StoreError::corrupt("trade_intents.excluded_venues", v))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TradeIntent {
            id: row.id,
            signal_id: row.signal_id,
            deployment_id: row.deployment_id,
            state,
            venue,
            size_model: row.size_model.map(|j| j.0),
            rationale: row.rationale.map(|j| j.0),
            excluded_venues,
            tx_ref: row.tx_ref,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn venue_names(venues: &[Venue]) -> Vec<&'static str> {
    venues.iter().map(|v| v.as_str()).collect()
}

#[async_trait]
impl IntentRepo for PgStore {
    async fn create_intent(&self, intent: &NewIntent) -> StoreResult<Option<TradeIntent>> {
        let row = sqlx::query_as::<_, IntentRow>(
            r#"
            INSERT INTO trade_intents
                (signal_id, deployment_id, state, venue, size_model, rationale, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (signal_id, deployment_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(intent.signal_id)
        .bind(intent.deployment_id)
        .bind(intent.state.as_str())
        .bind(intent.venue.map(|v| v.as_str()))
        .bind(intent.size_model.as_ref().map(Json))
        .bind(intent.rationale.as_ref().map(Json))
        .bind(&intent.last_error)
        .fetch_optional(self.pool())
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_intent(&self, id: Uuid) -> StoreResult<Option<TradeIntent>> {
        let row = sqlx::query_as::<_, IntentRow>("SELECT * FROM trade_intents WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn intent_for(
        &self,
        signal_id: Uuid,
        deployment_id: Uuid,
    ) -> StoreResult<Option<TradeIntent>> {
        let row = sqlx::query_as::<_, IntentRow>(
            "SELECT * FROM trade_intents WHERE signal_id = $1 AND deployment_id = $2",
        )
        .bind(signal_id)
        .bind(deployment_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn intents_in_state(
        &self,
        state: IntentState,
        limit: i64,
    ) -> StoreResult<Vec<TradeIntent>> {
        let rows = sqlx::query_as::<_, IntentRow>(
            r#"
            SELECT * FROM trade_intents
            WHERE state = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_intents(
        &self,
        state: Option<IntentState>,
        limit: i64,
    ) -> StoreResult<Vec<TradeIntent>> {
        let rows = sqlx::query_as::<_, IntentRow>(
            r#"
            SELECT * FROM trade_intents
            WHERE ($1::TEXT IS NULL OR state = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(state.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn transition_intent(
        &self,
        id: Uuid,
        from: IntentState,
        to: IntentState,
        update: &IntentUpdate,
    ) -> StoreResult<Option<TradeIntent>> {
        let row = sqlx::query_as::<_, IntentRow>(
            r#"
            UPDATE trade_intents
            SET state = $3,
                venue = COALESCE($4, venue),
                size_model = COALESCE($5, size_model),
                rationale = COALESCE($6, rationale),
                excluded_venues = COALESCE($7, excluded_venues),
                tx_ref = COALESCE($8, tx_ref),
                last_error = COALESCE($9, last_error),
                attempts = attempts + $10,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(update.venue.map(|v| v.as_str()))
        .bind(update.size_model.as_ref().map(Json))
        .bind(update.rationale.as_ref().map(Json))
        .bind(update.excluded_venues.as_deref().map(venue_names))
        .bind(&update.tx_ref)
        .bind(&update.last_error)
        .bind(i32::from(update.bump_attempts))
        .fetch_optional(self.pool())
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn stale_intents(
        &self,
        states: &[IntentState],
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<TradeIntent>> {
        let names: Vec<&str> = states.iter().map(|s| s.as_str()).collect();

        let rows = sqlx::query_as::<_, IntentRow>(
            r#"
            SELECT * FROM trade_intents
            WHERE state = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC
            "#,
        )
        .bind(&names)
        .bind(before)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
