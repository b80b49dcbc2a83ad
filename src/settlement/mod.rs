pub mod billing;
pub mod engine;
pub mod impact_scorer;

pub use billing::{BillingGateway, FeeSchedule, HttpBillingGateway, LedgerOnlyBilling};
pub use engine::{SettlementEngine, SettlementReport};
pub use impact_scorer::ImpactScorer;
