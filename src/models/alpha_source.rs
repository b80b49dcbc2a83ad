use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An account, channel, institute or tracked trader whose activity is mined for ideas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlphaSource {
    pub id: Uuid,
    /// External handle, e.g. `x:@handle` or a tracked wallet address.
    pub identity: String,
    pub kind: SourceKind,
    pub reputation_score: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    #[default]
    Social,
    Channel,
    Institute,
    Trader,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Social => "SOCIAL",
            SourceKind::Channel => "CHANNEL",
            SourceKind::Institute => "INSTITUTE",
            SourceKind::Trader => "TRADER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SOCIAL" => Some(SourceKind::Social),
            "CHANNEL" => Some(SourceKind::Channel),
            "INSTITUTE" => Some(SourceKind::Institute),
            "TRADER" => Some(SourceKind::Trader),
            _ => None,
        }
    }

    /// Crowd-sourced feeds get the user's social weighting applied at sizing time.
    pub fn is_social(&self) -> bool {
        matches!(self, SourceKind::Social | SourceKind::Channel)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
