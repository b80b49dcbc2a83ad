use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{PgStore, StoreError, StoreResult};
use crate::models::{AgentDeployment, RiskPreferences, Venue};

#[async_trait]
pub trait DeploymentRepo: Send + Sync {
    async fn upsert_deployment(&self, deployment: &AgentDeployment) -> StoreResult<AgentDeployment>;

    async fn get_deployment(&self, id: Uuid) -> StoreResult<Option<AgentDeployment>>;

    async fn list_deployments(&self) -> StoreResult<Vec<AgentDeployment>>;

    /// Active deployments subscribed to the source, oldest first.
    async fn deployments_for_source(&self, alpha_source_id: Uuid)
        -> StoreResult<Vec<AgentDeployment>>;
}

#[derive(FromRow)]
struct DeploymentRow {
    id: Uuid,
    user_id: String,
    alpha_source_ids: Vec<Uuid>,
    enabled_venues: Vec<String>,
    risk_preferences: Json<RiskPreferences>,
    capital_usd: Decimal,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for AgentDeployment {
    type Error = StoreError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        let enabled_venues = row
            .enabled_venues
            .iter()
            .map(|v| {
                Venue::from_str(v).ok_or_else(|| StoreError::corrupt("agent_deployments.enabled_venues", v))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AgentDeployment {
            id: row.id,
            user_id: row.user_id,
            alpha_source_ids: row.alpha_source_ids,
            enabled_venues,
            risk_preferences: row.risk_preferences.0,
            capital_usd: row.capital_usd,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl DeploymentRepo for PgStore {
    async fn upsert_deployment(&self, deployment: &AgentDeployment) -> StoreResult<AgentDeployment> {
        let venues: Vec<&str> = deployment.enabled_venues.iter().map(|v| v.as_str()).collect();

        let row = sqlx::query_as::<_, DeploymentRow>(
            r#"
            INSERT INTO agent_deployments
                (id, user_id, alpha_source_ids, enabled_venues, risk_preferences, capital_usd, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                alpha_source_ids = EXCLUDED.alpha_source_ids,
                enabled_venues = EXCLUDED.enabled_venues,
                risk_preferences = EXCLUDED.risk_preferences,
                capital_usd = EXCLUDED.capital_usd,
                is_active = EXCLUDED.is_active
            RETURNING *
            "#,
        )
        .bind(deployment.id)
        .bind(&deployment.user_id)
        .bind(&deployment.alpha_source_ids)
        .bind(&venues)
        .bind(Json(&deployment.risk_preferences))
        .bind(deployment.capital_usd)
        .bind(deployment.is_active)
        .fetch_one(self.pool())
        .await?;

        row.try_into()
    }

    async fn get_deployment(&self, id: Uuid) -> StoreResult<Option<AgentDeployment>> {
        let row =
            sqlx::query_as::<_, DeploymentRow>("SELECT * FROM agent_deployments WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_deployments(&self) -> StoreResult<Vec<AgentDeployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>(
            "SELECT * FROM agent_deployments ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn deployments_for_source(
        &self,
        alpha_source_id: Uuid,
    ) -> StoreResult<Vec<AgentDeployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>(
            r#"
            SELECT * FROM agent_deployments
            WHERE is_active AND $1 = ANY(alpha_source_ids)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(alpha_source_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
