use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{BillingEvent, BillingKind};

/// Flat infrastructure fee plus a share of realised profit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeSchedule {
    pub infra_fee_usd: Decimal,
    pub profit_share_rate: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            infra_fee_usd: Decimal::new(2, 1),
            profit_share_rate: Decimal::new(10, 2),
        }
    }
}

impl FeeSchedule {
    /// Charges owed for a settled position. Profit share only applies to a gain.
    pub fn charges_for(&self, pnl: Decimal) -> Vec<(BillingKind, Decimal)> {
        let mut charges = vec![(BillingKind::InfraFee, self.infra_fee_usd)];
        if pnl > Decimal::ZERO {
            charges.push((BillingKind::ProfitShare, (pnl * self.profit_share_rate).round_dp(6)));
        }
        charges
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("billing gateway: {0}")]
pub struct BillingError(pub String);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub idempotency_key: String,
    pub position_id: Uuid,
    pub deployment_id: Uuid,
    pub kind: BillingKind,
    pub amount_usd: Decimal,
}

impl ChargeRequest {
    pub fn new(position_id: Uuid, deployment_id: Uuid, kind: BillingKind, amount_usd: Decimal) -> Self {
        Self {
            idempotency_key: BillingEvent::idempotency_key(position_id, kind),
            position_id,
            deployment_id,
            kind,
            amount_usd,
        }
    }
}

/// Where charges are collected. Implementations must treat a repeated
/// idempotency key as the same charge.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<(), BillingError>;
}

/// Records charges in the ledger only. Used when no billing service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerOnlyBilling;

#[async_trait]
impl BillingGateway for LedgerOnlyBilling {
    async fn charge(&self, request: &ChargeRequest) -> Result<(), BillingError> {
        tracing::debug!(
            key = %request.idempotency_key,
            amount = %request.amount_usd,
            "Charge recorded in ledger only"
        );
        Ok(())
    }
}

/// Posts charges to an external billing service.
#[derive(Debug, Clone)]
pub struct HttpBillingGateway {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBillingGateway {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl BillingGateway for HttpBillingGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<(), BillingError> {
        let resp = self
            .http
            .post(format!("{}/charges", self.base_url))
            .timeout(self.timeout)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| BillingError(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BillingError(format!(
            "{status}: {}",
            body.chars().take(200).collect::<String>()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profit_share_only_on_gain() {
        let fees = FeeSchedule::default();

        let win = fees.charges_for(Decimal::from(20));
        assert_eq!(
            win,
            vec![
                (BillingKind::InfraFee, Decimal::new(2, 1)),
                (BillingKind::ProfitShare, Decimal::from(2)),
            ]
        );

        let flat = fees.charges_for(Decimal::ZERO);
        assert_eq!(flat, vec![(BillingKind::InfraFee, Decimal::new(2, 1))]);

        let loss = fees.charges_for(Decimal::from(-5));
        assert_eq!(loss.len(), 1);
    }

    #[test]
    fn charge_request_carries_idempotency_key() {
        let position = Uuid::new_v4();
        let req = ChargeRequest::new(position, Uuid::new_v4(), BillingKind::InfraFee, Decimal::ONE);
        assert_eq!(req.idempotency_key, format!("{position}:INFRA_FEE"));
    }
}
