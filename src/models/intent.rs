use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{RoutingRationale, SizeModel, Venue};

/// Routing + execution record for one (signal, deployment) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub deployment_id: Uuid,
    pub state: IntentState,
    pub venue: Option<Venue>,
    pub size_model: Option<SizeModel>,
    pub rationale: Option<RoutingRationale>,
    pub excluded_venues: Vec<Venue>,
    /// Venue-side order reference once an order has been accepted.
    pub tx_ref: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a trade intent.
///
/// `ROUTED → PREPARING → SUBMITTING → CONFIRMING → {OPEN | FAILED | AMBIGUOUS}`,
/// with `UNROUTABLE`, `SIZING_FAILED` and `SKIPPED` as routing-time dead ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    Routed,
    Unroutable,
    SizingFailed,
    Skipped,
    Preparing,
    Submitting,
    Confirming,
    Open,
    Failed,
    Ambiguous,
}

impl IntentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Routed => "ROUTED",
            IntentState::Unroutable => "UNROUTABLE",
            IntentState::SizingFailed => "SIZING_FAILED",
            IntentState::Skipped => "SKIPPED",
            IntentState::Preparing => "PREPARING",
            IntentState::Submitting => "SUBMITTING",
            IntentState::Confirming => "CONFIRMING",
            IntentState::Open => "OPEN",
            IntentState::Failed => "FAILED",
            IntentState::Ambiguous => "AMBIGUOUS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ROUTED" => Some(IntentState::Routed),
            "UNROUTABLE" => Some(IntentState::Unroutable),
            "SIZING_FAILED" => Some(IntentState::SizingFailed),
            "SKIPPED" => Some(IntentState::Skipped),
            "PREPARING" => Some(IntentState::Preparing),
            "SUBMITTING" => Some(IntentState::Submitting),
            "CONFIRMING" => Some(IntentState::Confirming),
            "OPEN" => Some(IntentState::Open),
            "FAILED" => Some(IntentState::Failed),
            "AMBIGUOUS" => Some(IntentState::Ambiguous),
            _ => None,
        }
    }

    /// No worker moves an intent out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Unroutable
                | IntentState::SizingFailed
                | IntentState::Skipped
                | IntentState::Open
                | IntentState::Failed
        )
    }

    /// States in which an order may already exist at the venue.
    pub fn in_flight(&self) -> bool {
        matches!(self, IntentState::Submitting | IntentState::Confirming)
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insert payload produced by the router.
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub signal_id: Uuid,
    pub deployment_id: Uuid,
    pub state: IntentState,
    pub venue: Option<Venue>,
    pub size_model: Option<SizeModel>,
    pub rationale: Option<RoutingRationale>,
    pub last_error: Option<String>,
}

/// Fields written alongside a state transition. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct IntentUpdate {
    pub venue: Option<Venue>,
    pub size_model: Option<SizeModel>,
    pub rationale: Option<RoutingRationale>,
    pub excluded_venues: Option<Vec<Venue>>,
    pub tx_ref: Option<String>,
    pub last_error: Option<String>,
    pub bump_attempts: bool,
}

impl IntentUpdate {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            last_error: Some(msg.into()),
            ..Default::default()
        }
    }
}
