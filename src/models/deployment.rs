use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Venue;

/// Neutral value for any preference the user left unset.
pub const DEFAULT_PREFERENCE: u8 = 50;

/// A user's subscription of an agent to a set of alpha sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeployment {
    pub id: Uuid,
    pub user_id: String,
    pub alpha_source_ids: Vec<Uuid>,
    pub enabled_venues: Vec<Venue>,
    #[serde(default)]
    pub risk_preferences: RiskPreferences,
    pub capital_usd: Decimal,
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl AgentDeployment {
    pub fn subscribes_to(&self, alpha_source_id: Uuid) -> bool {
        self.alpha_source_ids.contains(&alpha_source_id)
    }

    pub fn venue_enabled(&self, venue: Venue) -> bool {
        self.enabled_venues.contains(&venue)
    }
}

/// Per-user sizing knobs. Every weight is expected in `0..=100`.
///
/// Values are kept as given so that out-of-range input reaches the sizer
/// and fails loudly instead of being clamped on the way in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskPreferences {
    #[serde(default)]
    pub risk_tolerance: Option<i32>,
    #[serde(default)]
    pub trade_frequency: Option<i32>,
    #[serde(default)]
    pub social_weight: Option<i32>,
    #[serde(default)]
    pub momentum_weight: Option<i32>,
    #[serde(default)]
    pub stop_loss_percent: Option<f64>,
    #[serde(default)]
    pub take_profit_percent: Option<f64>,
}

impl RiskPreferences {
    pub fn risk_tolerance(&self) -> i32 {
        self.risk_tolerance.unwrap_or(DEFAULT_PREFERENCE as i32)
    }

    pub fn trade_frequency(&self) -> i32 {
        self.trade_frequency.unwrap_or(DEFAULT_PREFERENCE as i32)
    }

    pub fn social_weight(&self) -> i32 {
        self.social_weight.unwrap_or(DEFAULT_PREFERENCE as i32)
    }

    pub fn momentum_weight(&self) -> i32 {
        self.momentum_weight.unwrap_or(DEFAULT_PREFERENCE as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_preferences_fall_back_to_neutral() {
        let prefs = RiskPreferences {
            risk_tolerance: Some(80),
            ..Default::default()
        };
        assert_eq!(prefs.risk_tolerance(), 80);
        assert_eq!(prefs.trade_frequency(), 50);
        assert_eq!(prefs.social_weight(), 50);
        assert_eq!(prefs.momentum_weight(), 50);
    }

    #[test]
    fn preferences_deserialize_from_partial_json() {
        let prefs: RiskPreferences =
            serde_json::from_str(r#"{"riskTolerance": 20, "stopLossPercent": 3.5}"#).unwrap();
        assert_eq!(prefs.risk_tolerance, Some(20));
        assert_eq!(prefs.stop_loss_percent, Some(3.5));
        assert_eq!(prefs.momentum_weight, None);
    }
}
