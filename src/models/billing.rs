use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A charge issued for a settled position. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub position_id: Uuid,
    pub deployment_id: Uuid,
    pub kind: BillingKind,
    pub amount: Decimal,
    pub status: BillingStatus,
    pub created_at: DateTime<Utc>,
}

impl BillingEvent {
    /// Idempotency key handed to the billing gateway.
    pub fn idempotency_key(position_id: Uuid, kind: BillingKind) -> String {
        format!("{position_id}:{}", kind.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingKind {
    InfraFee,
    ProfitShare,
}

impl BillingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingKind::InfraFee => "INFRA_FEE",
            BillingKind::ProfitShare => "PROFIT_SHARE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INFRA_FEE" => Some(BillingKind::InfraFee),
            "PROFIT_SHARE" => Some(BillingKind::ProfitShare),
            _ => None,
        }
    }
}

impl fmt::Display for BillingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BillingStatus {
    Charged,
    Failed,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Charged => "CHARGED",
            BillingStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CHARGED" => Some(BillingStatus::Charged),
            "FAILED" => Some(BillingStatus::Failed),
            _ => None,
        }
    }
}

/// Realised PnL of a deployment for one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PnlSnapshot {
    pub deployment_id: Uuid,
    pub day: NaiveDate,
    pub pnl: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_position_and_kind() {
        let id = Uuid::nil();
        assert_eq!(
            BillingEvent::idempotency_key(id, BillingKind::ProfitShare),
            "00000000-0000-0000-0000-000000000000:PROFIT_SHARE"
        );
    }
}
