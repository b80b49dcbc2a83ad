use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult};
use crate::models::{CloseReason, NewPosition, Position, PositionClose, Side, Venue};

/// A source's weight in a position's outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attribution {
    pub alpha_source_id: Uuid,
    pub weight: Decimal,
}

#[async_trait]
pub trait PositionRepo: Send + Sync {
    /// Record an opened position together with its in-flight impact records.
    ///
    /// If a position already exists for the (signal, deployment) pair it is
    /// returned with `false` and nothing is written.
    async fn open_position(
        &self,
        position: &NewPosition,
        attribution: &[Attribution],
    ) -> StoreResult<(Position, bool)>;

    async fn get_position(&self, id: Uuid) -> StoreResult<Option<Position>>;

    async fn position_for(&self, signal_id: Uuid, deployment_id: Uuid)
        -> StoreResult<Option<Position>>;

    async fn list_positions(&self, open_only: bool, limit: i64) -> StoreResult<Vec<Position>>;

    /// The single OPEN → CLOSED transition. `None` if the position was already closed.
    async fn close_position(&self, id: Uuid, close: &PositionClose) -> StoreResult<Option<Position>>;

    /// Closed positions awaiting settlement, oldest close first.
    async fn closed_unsettled_positions(&self, limit: i64) -> StoreResult<Vec<Position>>;
}

#[derive(FromRow)]
struct PositionRow {
    id: Uuid,
    signal_id: Option<Uuid>,
    deployment_id: Uuid,
    intent_id: Option<Uuid>,
    venue: String,
    token_symbol: String,
    side: String,
    wallet_address: Option<String>,
    venue_position_ref: Option<String>,
    entry_price: Decimal,
    qty: Decimal,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    exit_price: Option<Decimal>,
    pnl: Option<Decimal>,
    close_reason: Option<String>,
    settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<PositionRow> for Position {
    type Error = StoreError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        let venue = Venue::from_str(&row.venue)
            .ok_or_else(|| StoreError::corrupt("positions.venue", &row.venue))?;
        let side = Side::from_api_str(&row.side)
            .ok_or_else(|| StoreError::corrupt("positions.side", &row.side))?;
        let close_reason = match row.close_reason {
            Some(r) => Some(
                CloseReason::from_str(&r)
                    .ok_or_else(|| StoreError::corrupt("positions.close_reason", &r))?,
            ),
            None => None,
        };

        Ok(Position {
            id: row.id,
            signal_id: row.signal_id,
            deployment_id: row.deployment_id,
            intent_id: row.intent_id,
            venue,
            token_symbol: row.token_symbol,
            side,
            wallet_address: row.wallet_address,
            venue_position_ref: row.venue_position_ref,
            entry_price: row.entry_price,
            qty: row.qty,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            exit_price: row.exit_price,
            pnl: row.pnl,
            close_reason,
            settled_at: row.settled_at,
        })
    }
}

#[async_trait]
impl PositionRepo for PgStore {
    async fn open_position(
        &self,
        position: &NewPosition,
        attribution: &[Attribution],
    ) -> StoreResult<(Position, bool)> {
        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query_as::<_, PositionRow>(
            r#"
            INSERT INTO positions
                (signal_id, deployment_id, intent_id, venue, token_symbol, side,
                 wallet_address, venue_position_ref, entry_price, qty)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (signal_id, deployment_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(position.signal_id)
        .bind(position.deployment_id)
        .bind(position.intent_id)
        .bind(position.venue.as_str())
        .bind(&position.token_symbol)
        .bind(position.side.as_str())
        .bind(&position.wallet_address)
        .bind(&position.venue_position_ref)
        .bind(position.entry_price)
        .bind(position.qty)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            let signal_id = position
                .signal_id
                .ok_or_else(|| StoreError::Corrupt("position insert conflicted without a signal".into()))?;
            let existing = self
                .position_for(signal_id, position.deployment_id)
                .await?
                .ok_or_else(|| StoreError::Corrupt(format!("conflicting position for signal {signal_id} vanished")))?;
            return Ok((existing, false));
        };

        for a in attribution {
            sqlx::query(
                r#"
                INSERT INTO impact_factor_records
                    (alpha_source_id, signal_id, position_id, weight, in_flight)
                VALUES ($1, $2, $3, $4, TRUE)
                ON CONFLICT (position_id, alpha_source_id) DO NOTHING
                "#,
            )
            .bind(a.alpha_source_id)
            .bind(position.signal_id)
            .bind(row.id)
            .bind(a.weight)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((row.try_into()?, true))
    }

    async fn get_position(&self, id: Uuid) -> StoreResult<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>("SELECT * FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn position_for(
        &self,
        signal_id: Uuid,
        deployment_id: Uuid,
    ) -> StoreResult<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE signal_id = $1 AND deployment_id = $2",
        )
        .bind(signal_id)
        .bind(deployment_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_positions(&self, open_only: bool, limit: i64) -> StoreResult<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT * FROM positions
            WHERE (NOT $1 OR closed_at IS NULL)
            ORDER BY opened_at DESC
            LIMIT $2
            "#,
        )
        .bind(open_only)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn close_position(
        &self,
        id: Uuid,
        close: &PositionClose,
    ) -> StoreResult<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>(
            r#"
            UPDATE positions
            SET closed_at = $2, exit_price = $3, pnl = $4, close_reason = $5
            WHERE id = $1 AND closed_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(close.closed_at)
        .bind(close.exit_price)
        .bind(close.pnl)
        .bind(close.reason.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn closed_unsettled_positions(&self, limit: i64) -> StoreResult<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT * FROM positions
            WHERE closed_at IS NOT NULL AND settled_at IS NULL
            ORDER BY closed_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
