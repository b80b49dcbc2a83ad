use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Side, SourceKind, Venue};

// ---------------------------------------------------------------------------
// Classifier input
// ---------------------------------------------------------------------------

/// A structured, already-classified event handed over by an ingestion adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedCandidate {
    pub source_identity: String,
    #[serde(default)]
    pub source_kind: SourceKind,
    pub external_event_id: String,
    pub token_symbols: Vec<String>,
    /// Raw side as emitted by the classifier (`long`, `SHORT`, `buy`...).
    pub side: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub attestation: Option<Attestation>,
}

/// Signature over the classifier's output, produced by the inference operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub signing_address: String,
    /// 65-byte `r || s || v` signature, hex encoded.
    pub signature: String,
    pub raw_output: String,
    pub chain_id: u64,
    pub model_id: String,
    pub full_prompt: String,
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A vetted, deduplicated instruction candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub alpha_source_id: Uuid,
    pub external_event_id: String,
    pub token_symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub attested: bool,
    pub dedup_key: String,
    pub venue: Option<Venue>,
    pub size_model: Option<SizeModel>,
    pub routing_rationale: Option<RoutingRationale>,
    pub fanned_out_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a freshly accepted signal.
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub alpha_source_id: Uuid,
    pub external_event_id: String,
    pub token_symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub attested: bool,
}

impl NewSignal {
    pub fn dedup_key(&self) -> String {
        dedup_key(self.alpha_source_id, &self.external_event_id)
    }
}

/// `<alpha_source_id>:<external_event_id>`; unique across all signals.
pub fn dedup_key(alpha_source_id: Uuid, external_event_id: &str) -> String {
    format!("{alpha_source_id}:{external_event_id}")
}

// ---------------------------------------------------------------------------
// Sizing + routing decisions
// ---------------------------------------------------------------------------

/// Output of the position sizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeModel {
    pub size_percent: f64,
    pub leverage: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub reasoning: String,
}

/// Why a venue was or was not picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum VenueCheckOutcome {
    Selected,
    NotEnabled,
    Excluded,
    NoAdapter,
    AssetUnavailable,
    WalletNotConfigured,
    CheckFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueCheck {
    pub venue: Venue,
    #[serde(flatten)]
    pub outcome: VenueCheckOutcome,
}

/// Audit record of one routing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRationale {
    pub checked: Vec<VenueCheck>,
    pub selected: Option<Venue>,
    pub excluded: Vec<Venue>,
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl RoutingRationale {
    /// Rationale for a decision taken without consulting any venue.
    pub fn note_only(note: impl Into<String>) -> Self {
        Self {
            checked: Vec::new(),
            selected: None,
            excluded: Vec::new(),
            note: Some(note.into()),
            decided_at: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Integrity audit
// ---------------------------------------------------------------------------

/// A candidate rejected for integrity reasons, kept for operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRejection {
    pub id: Uuid,
    pub source_identity: String,
    pub external_event_id: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
