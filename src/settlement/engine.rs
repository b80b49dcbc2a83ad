use futures_util::stream::{self, StreamExt};
use metrics::counter;
use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use super::billing::{BillingGateway, ChargeRequest, FeeSchedule};
use crate::db::{Attribution, Store};
use crate::errors::PipelineError;
use crate::models::{BillingKind, BillingStatus, Position, Side};

/// Realised PnL of a closed position.
pub fn compute_pnl(entry_price: Decimal, exit_price: Decimal, qty: Decimal, side: Side) -> Decimal {
    (exit_price - entry_price) * qty * side.direction_sign()
}

/// Equal-weight attribution across distinct sources. Weights are truncated so
/// they never sum above 1.
pub fn attribution_for(sources: &[Uuid]) -> Vec<Attribution> {
    let mut distinct: Vec<Uuid> = Vec::with_capacity(sources.len());
    for id in sources {
        if !distinct.contains(id) {
            distinct.push(*id);
        }
    }
    if distinct.is_empty() {
        return Vec::new();
    }

    let weight = (Decimal::ONE / Decimal::from(distinct.len()))
        .round_dp_with_strategy(6, RoundingStrategy::ToZero);
    distinct
        .into_iter()
        .map(|alpha_source_id| Attribution {
            alpha_source_id,
            weight,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReport {
    pub position_id: Uuid,
    pub pnl: Decimal,
    pub charged: Vec<BillingKind>,
    pub failed: Vec<BillingKind>,
    /// False when another worker settled the position first.
    pub finalized: bool,
}

/// Bills and books closed positions.
pub struct SettlementEngine {
    store: Arc<dyn Store>,
    billing: Arc<dyn BillingGateway>,
    fees: FeeSchedule,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn Store>, billing: Arc<dyn BillingGateway>, fees: FeeSchedule) -> Self {
        Self { store, billing, fees }
    }

    /// Settle every closed, unsettled position, `parallelism` at a time.
    pub async fn run_once(&self, batch: i64, parallelism: usize) -> Result<usize, PipelineError> {
        let positions = self.store.closed_unsettled_positions(batch).await?;
        if positions.is_empty() {
            return Ok(0);
        }

        let results: Vec<_> = stream::iter(positions)
            .map(|position| async move {
                let result = self.settle_position(&position).await;
                (position.id, result)
            })
            .buffered(parallelism.max(1))
            .collect()
            .await;

        let mut settled = 0;
        for (position_id, result) in results {
            match result {
                Ok(report) if report.finalized => settled += 1,
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(position_id = %position_id, error = %e, "Settlement failed");
                }
            }
        }
        Ok(settled)
    }

    pub async fn settle_position(&self, position: &Position) -> Result<SettlementReport, PipelineError> {
        let (Some(exit_price), Some(closed_at)) = (position.exit_price, position.closed_at) else {
            return Err(PipelineError::StateConflict(format!(
                "position {} is not closed",
                position.id
            )));
        };
        let pnl = position.pnl.unwrap_or_else(|| {
            compute_pnl(position.entry_price, exit_price, position.qty, position.side)
        });

        let mut report = SettlementReport {
            position_id: position.id,
            pnl,
            charged: Vec::new(),
            failed: Vec::new(),
            finalized: false,
        };

        let already: Vec<BillingKind> = self
            .store
            .billing_events_for(position.id)
            .await?
            .into_iter()
            .map(|e| e.kind)
            .collect();

        for (kind, amount) in self.fees.charges_for(pnl) {
            if already.contains(&kind) {
                continue;
            }
            let request = ChargeRequest::new(position.id, position.deployment_id, kind, amount);
            let status = match self.billing.charge(&request).await {
                Ok(()) => BillingStatus::Charged,
                Err(e) => {
                    tracing::error!(
                        position_id = %position.id,
                        kind = %kind,
                        error = %e,
                        "Billing charge failed"
                    );
                    BillingStatus::Failed
                }
            };

            let inserted = self
                .store
                .insert_billing_event(position.id, position.deployment_id, kind, amount, status)
                .await?;
            if inserted.is_some() {
                counter!("billing_events_total", "kind" => kind.as_str(), "status" => status.as_str())
                    .increment(1);
                match status {
                    BillingStatus::Charged => report.charged.push(kind),
                    BillingStatus::Failed => report.failed.push(kind),
                }
            }
        }

        report.finalized = self
            .store
            .finalize_settlement(position.id, position.deployment_id, closed_at.date_naive(), pnl)
            .await?;

        if report.finalized {
            counter!("positions_settled_total").increment(1);
            tracing::info!(
                position_id = %position.id,
                deployment_id = %position.deployment_id,
                pnl = %pnl,
                charged = report.charged.len(),
                failed = report.failed.len(),
                "Position settled"
            );
        }
        Ok(report)
    }
}
