use serde::{Deserialize, Serialize};

use crate::models::{RiskPreferences, SizeModel, SourceKind, VenueConstraints};

/// Platform-wide sizing knobs, in percent of deployment capital.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizingPolicy {
    pub base_size_percent: f64,
    pub max_position_percent: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            base_size_percent: 5.0,
            max_position_percent: 20.0,
            stop_loss_percent: 5.0,
            take_profit_percent: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SizingError {
    #[error("{name} preference {value} outside 0..=100")]
    PreferenceOutOfRange { name: &'static str, value: i32 },

    #[error("{name} is not a usable number ({value})")]
    InvalidValue { name: &'static str, value: f64 },

    #[error("computed position size is zero")]
    ZeroSize,
}

/// Inputs for one sizing decision.
#[derive(Debug, Clone, Copy)]
pub struct SizingInput<'a> {
    pub confidence: f64,
    pub source_kind: SourceKind,
    pub preferences: &'a RiskPreferences,
    pub constraints: VenueConstraints,
}

/// Size, leverage and exits for a signal on a venue.
///
/// Deterministic in its inputs. Any invalid preference or non-finite
/// intermediate is an error; nothing is silently defaulted.
pub fn size_position(policy: &SizingPolicy, input: SizingInput<'_>) -> Result<SizeModel, SizingError> {
    let prefs = input.preferences;
    let risk = preference("risk_tolerance", prefs.risk_tolerance())?;
    let frequency = preference("trade_frequency", prefs.trade_frequency())?;
    let social = preference("social_weight", prefs.social_weight())?;
    let momentum = preference("momentum_weight", prefs.momentum_weight())?;

    let confidence = usable("confidence", input.confidence)?;
    if confidence > 1.0 {
        return Err(SizingError::InvalidValue {
            name: "confidence",
            value: confidence,
        });
    }
    let base = usable("base_size_percent", policy.base_size_percent)?;
    let cap = usable("max_position_percent", policy.max_position_percent)?;

    let risk_factor = risk / 50.0;
    let frequency_factor = 1.5 - frequency / 100.0;
    let social_factor = if input.source_kind.is_social() {
        0.5 + social / 100.0
    } else {
        1.0
    };

    let raw = usable(
        "size_percent",
        base * confidence * risk_factor * frequency_factor * social_factor,
    )?;
    let size_percent = raw.min(cap);
    if size_percent <= 0.0 {
        return Err(SizingError::ZeroSize);
    }

    let min_lev = usable("venue_min_leverage", input.constraints.min_leverage)?;
    let max_lev = usable("venue_max_leverage", input.constraints.max_leverage)?;
    let leverage = usable(
        "leverage",
        min_lev + (max_lev - min_lev) * (risk / 100.0) * confidence,
    )?
    .clamp(min_lev, max_lev.max(min_lev));

    let stop_loss_percent = usable(
        "stop_loss_percent",
        prefs.stop_loss_percent.unwrap_or(policy.stop_loss_percent),
    )?;
    let take_profit_percent = match prefs.take_profit_percent {
        Some(tp) => usable("take_profit_percent", tp)?,
        None => usable(
            "take_profit_percent",
            policy.take_profit_percent * (0.5 + momentum / 100.0),
        )?,
    };

    let reasoning = format!(
        "base {base}% x confidence {confidence:.2} x risk {risk_factor:.2} x frequency {frequency_factor:.2} x social {social_factor:.2} = {raw:.4}% (cap {cap}%); leverage {leverage:.2}x in [{min_lev}, {max_lev}]"
    );

    Ok(SizeModel {
        size_percent,
        leverage,
        stop_loss_percent,
        take_profit_percent,
        reasoning,
    })
}

fn preference(name: &'static str, value: i32) -> Result<f64, SizingError> {
    if !(0..=100).contains(&value) {
        return Err(SizingError::PreferenceOutOfRange { name, value });
    }
    Ok(f64::from(value))
}

fn usable(name: &'static str, value: f64) -> Result<f64, SizingError> {
    if !value.is_finite() || value < 0.0 {
        return Err(SizingError::InvalidValue { name, value });
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;

    fn input(confidence: f64, kind: SourceKind, prefs: &RiskPreferences, venue: Venue) -> SizingInput<'_> {
        SizingInput {
            confidence,
            source_kind: kind,
            preferences: prefs,
            constraints: venue.constraints(),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn neutral_preferences_scale_by_confidence() {
        let prefs = RiskPreferences::default();
        let m = size_position(
            &SizingPolicy::default(),
            input(0.8, SourceKind::Institute, &prefs, Venue::Hyperliquid),
        )
        .unwrap();
        // 5 × 0.8 × 1.0 × 1.0 × 1.0
        assert!(close(m.size_percent, 4.0));
        // 1 + 49 × 0.5 × 0.8
        assert!(close(m.leverage, 20.6));
        assert!(close(m.stop_loss_percent, 5.0));
        assert!(close(m.take_profit_percent, 10.0));
    }

    #[test]
    fn social_weight_applies_only_to_social_sources() {
        let prefs = RiskPreferences {
            social_weight: Some(100),
            ..Default::default()
        };
        let policy = SizingPolicy::default();
        let social = size_position(&policy, input(1.0, SourceKind::Social, &prefs, Venue::Gmx)).unwrap();
        let trader = size_position(&policy, input(1.0, SourceKind::Trader, &prefs, Venue::Gmx)).unwrap();
        assert!(close(social.size_percent, 7.5));
        assert!(close(trader.size_percent, 5.0));
    }

    #[test]
    fn size_is_capped_at_policy_max() {
        let prefs = RiskPreferences {
            risk_tolerance: Some(100),
            trade_frequency: Some(0),
            ..Default::default()
        };
        let policy = SizingPolicy {
            base_size_percent: 50.0,
            ..Default::default()
        };
        let m = size_position(&policy, input(1.0, SourceKind::Trader, &prefs, Venue::Ostium)).unwrap();
        assert!(close(m.size_percent, policy.max_position_percent));
    }

    #[test]
    fn spot_leverage_stays_at_one() {
        let prefs = RiskPreferences {
            risk_tolerance: Some(100),
            ..Default::default()
        };
        let m = size_position(&SizingPolicy::default(), input(1.0, SourceKind::Trader, &prefs, Venue::Spot)).unwrap();
        assert!(close(m.leverage, 1.0));
    }

    #[test]
    fn overrides_win_over_bands() {
        let prefs = RiskPreferences {
            stop_loss_percent: Some(2.5),
            take_profit_percent: Some(30.0),
            momentum_weight: Some(100),
            ..Default::default()
        };
        let m = size_position(&SizingPolicy::default(), input(0.5, SourceKind::Trader, &prefs, Venue::Gmx)).unwrap();
        assert!(close(m.stop_loss_percent, 2.5));
        assert!(close(m.take_profit_percent, 30.0));
    }

    #[test]
    fn out_of_range_preference_is_an_error() {
        let prefs = RiskPreferences {
            risk_tolerance: Some(150),
            ..Default::default()
        };
        let err = size_position(&SizingPolicy::default(), input(0.9, SourceKind::Trader, &prefs, Venue::Gmx))
            .unwrap_err();
        assert_eq!(
            err,
            SizingError::PreferenceOutOfRange {
                name: "risk_tolerance",
                value: 150
            }
        );
    }

    #[test]
    fn non_finite_override_is_an_error() {
        let prefs = RiskPreferences {
            stop_loss_percent: Some(f64::NAN),
            ..Default::default()
        };
        let err = size_position(&SizingPolicy::default(), input(0.9, SourceKind::Trader, &prefs, Venue::Gmx))
            .unwrap_err();
        assert!(matches!(err, SizingError::InvalidValue { name: "stop_loss_percent", .. }));
    }

    #[test]
    fn zero_risk_tolerance_is_zero_size() {
        let prefs = RiskPreferences {
            risk_tolerance: Some(0),
            ..Default::default()
        };
        let err = size_position(&SizingPolicy::default(), input(0.9, SourceKind::Trader, &prefs, Venue::Gmx))
            .unwrap_err();
        assert_eq!(err, SizingError::ZeroSize);
    }
}
