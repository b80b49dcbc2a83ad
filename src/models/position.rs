use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{Side, Venue};

/// An open or closed exposure on a venue for one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub signal_id: Option<Uuid>,
    pub deployment_id: Uuid,
    pub intent_id: Option<Uuid>,
    pub venue: Venue,
    pub token_symbol: String,
    pub side: Side,
    pub wallet_address: Option<String>,
    pub venue_position_ref: Option<String>,
    pub entry_price: Decimal,
    pub qty: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }
}

/// Insert payload for a confirmed order.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub signal_id: Option<Uuid>,
    pub deployment_id: Uuid,
    pub intent_id: Option<Uuid>,
    pub venue: Venue,
    pub token_symbol: String,
    pub side: Side,
    pub wallet_address: Option<String>,
    pub venue_position_ref: Option<String>,
    pub entry_price: Decimal,
    pub qty: Decimal,
}

/// Values written by the single OPEN → CLOSED transition.
#[derive(Debug, Clone)]
pub struct PositionClose {
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub closed_at: DateTime<Utc>,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    Reconciliation,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "MANUAL",
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::TakeProfit => "TAKE_PROFIT",
            CloseReason::Reconciliation => "RECONCILIATION",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MANUAL" => Some(CloseReason::Manual),
            "STOP_LOSS" => Some(CloseReason::StopLoss),
            "TAKE_PROFIT" => Some(CloseReason::TakeProfit),
            "RECONCILIATION" => Some(CloseReason::Reconciliation),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
