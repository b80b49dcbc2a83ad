use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One source's share of a position's outcome.
///
/// Registered with `in_flight = true` when the position opens and finalized
/// with the realised contribution when it settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ImpactFactorRecord {
    pub alpha_source_id: Uuid,
    pub signal_id: Option<Uuid>,
    pub position_id: Uuid,
    pub pnl_contribution: Option<Decimal>,
    pub weight: Decimal,
    pub in_flight: bool,
}
