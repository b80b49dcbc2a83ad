pub mod alpha_source;
pub mod billing;
pub mod deployment;
pub mod impact;
pub mod intent;
pub mod position;
pub mod signal;
pub mod venue;
pub mod wallet;

pub use alpha_source::{AlphaSource, SourceKind};
pub use billing::{BillingEvent, BillingKind, BillingStatus, PnlSnapshot};
pub use deployment::{AgentDeployment, RiskPreferences};
pub use impact::ImpactFactorRecord;
pub use intent::{IntentState, IntentUpdate, NewIntent, TradeIntent};
pub use position::{CloseReason, NewPosition, Position, PositionClose};
pub use signal::{
    Attestation, ClassifiedCandidate, IntegrityRejection, NewSignal, RoutingRationale, Signal,
    SizeModel, VenueCheck, VenueCheckOutcome,
};
pub use venue::{parse_venues, Venue, VenueConstraints, VENUE_PRIORITY};
pub use wallet::WalletSlot;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// Accepts the spellings classifiers and venue services emit.
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Some(Side::Long),
            "SHORT" | "SELL" => Some(Side::Short),
            _ => None,
        }
    }

    /// +1 for longs, -1 for shorts.
    pub fn direction_sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
