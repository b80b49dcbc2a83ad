use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult};
use crate::models::{BillingEvent, BillingKind, BillingStatus, ImpactFactorRecord, PnlSnapshot};

/// Settled impact of one source: mean contribution over `samples` records.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ReputationAggregate {
    pub alpha_source_id: Uuid,
    pub mean_contribution: Decimal,
    pub samples: i64,
}

#[async_trait]
pub trait SettlementRepo: Send + Sync {
    async fn billing_events_for(&self, position_id: Uuid) -> StoreResult<Vec<BillingEvent>>;

    /// Insert under the (position, kind) constraint. `None` if that kind was already billed.
    async fn insert_billing_event(
        &self,
        position_id: Uuid,
        deployment_id: Uuid,
        kind: BillingKind,
        amount: Decimal,
        status: BillingStatus,
    ) -> StoreResult<Option<BillingEvent>>;

    /// In one transaction: mark the position settled, add `pnl` to the
    /// deployment's snapshot for `day`, and finalize the position's impact
    /// records. Returns `false` if the position was already settled.
    async fn finalize_settlement(
        &self,
        position_id: Uuid,
        deployment_id: Uuid,
        day: NaiveDate,
        pnl: Decimal,
    ) -> StoreResult<bool>;

    async fn pnl_snapshot(&self, deployment_id: Uuid, day: NaiveDate)
        -> StoreResult<Option<PnlSnapshot>>;

    /// Most recent day first.
    async fn pnl_history(&self, deployment_id: Uuid, limit: i64) -> StoreResult<Vec<PnlSnapshot>>;

    async fn impact_records_for_position(&self, position_id: Uuid)
        -> StoreResult<Vec<ImpactFactorRecord>>;

    /// Mean settled contribution per source; in-flight records are ignored.
    async fn reputation_aggregates(&self) -> StoreResult<Vec<ReputationAggregate>>;
}

#[derive(FromRow)]
struct BillingRow {
    id: Uuid,
    position_id: Uuid,
    deployment_id: Uuid,
    kind: String,
    amount: Decimal,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<BillingRow> for BillingEvent {
    type Error = StoreError;

    fn try_from(row: BillingRow) -> Result<Self, Self::Error> {
        Ok(BillingEvent {
            id: row.id,
            position_id: row.position_id,
            deployment_id: row.deployment_id,
            kind: BillingKind::from_str(&row.kind)
                .ok_or_else(|| StoreError::corrupt("billing_events.kind", &row.kind))?,
            amount: row.amount,
            status: BillingStatus::from_str(&row.status)
                .ok_or_else(|| StoreError::corrupt("billing_events.status", &row.status))?,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl SettlementRepo for PgStore {
    async fn billing_events_for(&self, position_id: Uuid) -> StoreResult<Vec<BillingEvent>> {
        let rows = sqlx::query_as::<_, BillingRow>(
            "SELECT * FROM billing_events WHERE position_id = $1 ORDER BY created_at ASC",
        )
        .bind(position_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_billing_event(
        &self,
        position_id: Uuid,
        deployment_id: Uuid,
        kind: BillingKind,
        amount: Decimal,
        status: BillingStatus,
    ) -> StoreResult<Option<BillingEvent>> {
        let row = sqlx::query_as::<_, BillingRow>(
            r#"
            INSERT INTO billing_events (position_id, deployment_id, kind, amount, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (position_id, kind) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(position_id)
        .bind(deployment_id)
        .bind(kind.as_str())
        .bind(amount)
        .bind(status.as_str())
        .fetch_optional(self.pool())
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn finalize_settlement(
        &self,
        position_id: Uuid,
        deployment_id: Uuid,
        day: NaiveDate,
        pnl: Decimal,
    ) -> StoreResult<bool> {
        let mut tx = self.pool().begin().await?;

        let marked = sqlx::query(
            r#"
            UPDATE positions SET settled_at = NOW()
            WHERE id = $1 AND closed_at IS NOT NULL AND settled_at IS NULL
            "#,
        )
        .bind(position_id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO pnl_snapshots (deployment_id, day, pnl)
            VALUES ($1, $2, $3)
            ON CONFLICT (deployment_id, day) DO UPDATE SET pnl = pnl_snapshots.pnl + EXCLUDED.pnl
            "#,
        )
        .bind(deployment_id)
        .bind(day)
        .bind(pnl)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE impact_factor_records
            SET pnl_contribution = $2 * weight, in_flight = FALSE
            WHERE position_id = $1 AND in_flight
            "#,
        )
        .bind(position_id)
        .bind(pnl)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn pnl_snapshot(
        &self,
        deployment_id: Uuid,
        day: NaiveDate,
    ) -> StoreResult<Option<PnlSnapshot>> {
        let snap = sqlx::query_as::<_, PnlSnapshot>(
            "SELECT deployment_id, day, pnl FROM pnl_snapshots WHERE deployment_id = $1 AND day = $2",
        )
        .bind(deployment_id)
        .bind(day)
        .fetch_optional(self.pool())
        .await?;

        Ok(snap)
    }

    async fn pnl_history(&self, deployment_id: Uuid, limit: i64) -> StoreResult<Vec<PnlSnapshot>> {
        let snaps = sqlx::query_as::<_, PnlSnapshot>(
            r#"
            SELECT deployment_id, day, pnl FROM pnl_snapshots
            WHERE deployment_id = $1
            ORDER BY day DESC
            LIMIT $2
            "#,
        )
        .bind(deployment_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(snaps)
    }

    async fn impact_records_for_position(
        &self,
        position_id: Uuid,
    ) -> StoreResult<Vec<ImpactFactorRecord>> {
        let records = sqlx::query_as::<_, ImpactFactorRecord>(
            r#"
            SELECT alpha_source_id, signal_id, position_id, pnl_contribution, weight, in_flight
            FROM impact_factor_records
            WHERE position_id = $1
            ORDER BY alpha_source_id
            "#,
        )
        .bind(position_id)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    async fn reputation_aggregates(&self) -> StoreResult<Vec<ReputationAggregate>> {
        let rows = sqlx::query_as::<_, ReputationAggregate>(
            r#"
            SELECT alpha_source_id,
                   AVG(pnl_contribution) AS mean_contribution,
                   COUNT(*) AS samples
            FROM impact_factor_records
            WHERE NOT in_flight AND pnl_contribution IS NOT NULL
            GROUP BY alpha_source_id
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}
