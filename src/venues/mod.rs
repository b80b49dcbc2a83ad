pub mod auth;
pub mod http_adapter;
pub mod paper;

pub use auth::GatewayAuth;
pub use http_adapter::HttpVenueAdapter;
pub use paper::PaperVenue;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{CloseReason, Side, Venue};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VenueError {
    #[error("venue call timed out: {0}")]
    Timeout(String),

    /// Network failure, rate limit or 5xx. Safe to retry.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// The venue refused the request outright.
    #[error("venue rejected request: {0}")]
    Rejected(String),

    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("not found at venue: {0}")]
    NotFound(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Timeout(_) | VenueError::Transient(_))
    }
}

/// A sized order as handed to a venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParams {
    /// Intent id. Venues deduplicate submissions on it.
    pub client_ref: String,
    pub token_symbol: String,
    pub side: Side,
    pub collateral_usd: Decimal,
    pub leverage: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub wallet_address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderStatus {
    Open {
        entry_price: Decimal,
        qty: Decimal,
        position_ref: String,
    },
    Failed(String),
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseFill {
    pub exit_price: Decimal,
    pub qty: Decimal,
}

/// A position the venue closed on its own, e.g. a stop or take-profit hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueClose {
    pub position_ref: String,
    pub fill: CloseFill,
    pub trigger: CloseReason,
}

/// Order lifecycle operations every execution venue supports.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Whether `token_symbol` currently trades on this venue.
    async fn is_available(&self, token_symbol: &str) -> Result<bool, VenueError>;

    async fn available_balance(&self, wallet_address: &str) -> Result<Decimal, VenueError>;

    /// Returns the venue's order reference.
    async fn submit_order(&self, params: &OrderParams) -> Result<String, VenueError>;

    async fn get_order_status(&self, tx_ref: &str) -> Result<OrderStatus, VenueError>;

    /// Venue order reference for a submission the venue accepted under
    /// `client_ref`, if it ever arrived.
    async fn find_order(&self, client_ref: &str) -> Result<Option<String>, VenueError>;

    async fn close_position(&self, position_ref: &str) -> Result<CloseFill, VenueError>;

    /// Positions held by `wallet_address` that the venue has already closed.
    async fn closed_positions(&self, wallet_address: &str) -> Result<Vec<VenueClose>, VenueError>;
}

/// Adapters keyed by venue.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn VenueAdapter>) {
        self.adapters.insert(adapter.venue(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn VenueAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, venue: Venue) -> Option<Arc<dyn VenueAdapter>> {
        self.adapters.get(&venue).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Registered venues in priority order.
    pub fn venues(&self) -> Vec<Venue> {
        let mut v: Vec<Venue> = self.adapters.keys().copied().collect();
        v.sort_by_key(|v| v.priority());
        v
    }
}

/// Build adapters from configuration: paper venues for every venue in dry-run
/// mode, otherwise one HTTP adapter per configured gateway URL.
pub fn registry_from_config(config: &crate::config::AppConfig, http: reqwest::Client) -> VenueRegistry {
    let mut registry = VenueRegistry::new();

    if config.dry_run {
        for venue in crate::models::VENUE_PRIORITY {
            registry.register(Arc::new(PaperVenue::new(
                venue,
                config.paper_balance,
                config.paper_prices.clone(),
            )));
        }
        tracing::warn!("DRY_RUN enabled, orders go to paper venues");
        return registry;
    }

    let auth = config.venue_api_secret.clone().map(GatewayAuth::new);
    if auth.is_none() {
        tracing::warn!("VENUE_API_SECRET not set, gateway requests are unsigned");
    }
    let timeout = std::time::Duration::from_secs(config.venue_call_timeout_secs);

    for (venue, url) in &config.venue_urls {
        registry.register(Arc::new(HttpVenueAdapter::new(
            http.clone(),
            *venue,
            url.clone(),
            auth.clone(),
            timeout,
        )));
        tracing::info!(venue = %venue, url = %url, "Venue gateway registered");
    }
    if registry.is_empty() {
        tracing::warn!("No venue gateways configured; every intent will be unroutable");
    }
    registry
}
