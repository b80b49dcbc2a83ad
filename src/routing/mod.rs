pub mod router;

pub use router::{FanOutSummary, VenueRouter};

use rust_decimal::Decimal;

use crate::execution::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Sources scoring below this are recorded as skipped instead of routed.
    pub min_source_reputation: Option<Decimal>,
    /// Availability checks retry transient failures under this policy.
    pub retry: RetryPolicy,
    /// Deployments routed concurrently per signal.
    pub parallelism: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            min_source_reputation: None,
            retry: RetryPolicy::default(),
            parallelism: 4,
        }
    }
}
