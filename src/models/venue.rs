use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution destination for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Venue {
    Hyperliquid,
    Ostium,
    Gmx,
    Spot,
}

/// Router preference order, highest first. Ties are always broken by this table.
pub const VENUE_PRIORITY: [Venue; 4] = [Venue::Hyperliquid, Venue::Ostium, Venue::Gmx, Venue::Spot];

/// Leverage range a venue accepts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VenueConstraints {
    pub min_leverage: f64,
    pub max_leverage: f64,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Hyperliquid => "HYPERLIQUID",
            Venue::Ostium => "OSTIUM",
            Venue::Gmx => "GMX",
            Venue::Spot => "SPOT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "HYPERLIQUID" => Some(Venue::Hyperliquid),
            "OSTIUM" => Some(Venue::Ostium),
            "GMX" => Some(Venue::Gmx),
            "SPOT" => Some(Venue::Spot),
            _ => None,
        }
    }

    /// Position in [`VENUE_PRIORITY`]; lower is preferred.
    pub fn priority(&self) -> usize {
        VENUE_PRIORITY
            .iter()
            .position(|v| v == self)
            .unwrap_or(VENUE_PRIORITY.len())
    }

    pub fn constraints(&self) -> VenueConstraints {
        match self {
            Venue::Hyperliquid => VenueConstraints {
                min_leverage: 1.0,
                max_leverage: 50.0,
            },
            Venue::Ostium => VenueConstraints {
                min_leverage: 1.0,
                max_leverage: 100.0,
            },
            Venue::Gmx => VenueConstraints {
                min_leverage: 1.1,
                max_leverage: 100.0,
            },
            Venue::Spot => VenueConstraints {
                min_leverage: 1.0,
                max_leverage: 1.0,
            },
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a list of venue names, dropping unknown entries.
pub fn parse_venues<S: AsRef<str>>(names: &[S]) -> Vec<Venue> {
    names.iter().filter_map(|n| Venue::from_str(n.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_follows_table_order() {
        assert!(Venue::Hyperliquid.priority() < Venue::Ostium.priority());
        assert!(Venue::Ostium.priority() < Venue::Gmx.priority());
        assert!(Venue::Gmx.priority() < Venue::Spot.priority());
    }

    #[test]
    fn parse_round_trips_db_strings() {
        for v in VENUE_PRIORITY {
            assert_eq!(Venue::from_str(v.as_str()), Some(v));
        }
        assert_eq!(Venue::from_str("binance"), None);
        assert_eq!(parse_venues(&["gmx", "nope", "SPOT"]), vec![Venue::Gmx, Venue::Spot]);
    }

    #[test]
    fn spot_is_unlevered() {
        let c = Venue::Spot.constraints();
        assert_eq!(c.min_leverage, 1.0);
        assert_eq!(c.max_leverage, 1.0);
    }
}
