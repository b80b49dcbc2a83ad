#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use alphaflow::config::AppConfig;
use alphaflow::db::{AlphaSourceRepo, DeploymentRepo, MemoryStore, Store, WalletRepo};
use alphaflow::models::{
    AgentDeployment, AlphaSource, ClassifiedCandidate, CloseReason, RiskPreferences, SourceKind, Venue,
};
use alphaflow::services::Pipeline;
use alphaflow::settlement::billing::{BillingError, ChargeRequest};
use alphaflow::settlement::{BillingGateway, LedgerOnlyBilling};
use alphaflow::venues::{
    CloseFill, OrderParams, OrderStatus, VenueAdapter, VenueClose, VenueError, VenueRegistry,
};

pub const USER: &str = "user-1";

/// Config with fast retries and a one-second confirmation window.
pub fn test_config(extra: &[(&str, &str)]) -> AppConfig {
    let mut vars: HashMap<String, String> = [
        ("DATABASE_URL", "postgres://unused/alphaflow_test"),
        ("MIN_CONFIDENCE", "0.5"),
        ("SUPPORTED_ASSETS", "BTC,ETH,SOL"),
        ("BACKOFF_BASE_MS", "1"),
        ("BACKOFF_MAX_MS", "2"),
        ("VENUE_CALL_TIMEOUT_SECS", "2"),
        ("CONFIRM_TIMEOUT_SECS", "1"),
        ("CONFIRM_POLL_MS", "20"),
        ("INFRA_FEE_USD", "0.2"),
        ("PROFIT_SHARE_RATE", "0.1"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    AppConfig::from_lookup(move |key| vars.get(key).cloned()).expect("test config")
}

pub fn build_pipeline(store: Arc<MemoryStore>, venues: VenueRegistry, config: &AppConfig) -> Pipeline {
    build_pipeline_with_billing(store, venues, config, Arc::new(LedgerOnlyBilling))
}

pub fn build_pipeline_with_billing(
    store: Arc<MemoryStore>,
    venues: VenueRegistry,
    config: &AppConfig,
    billing: Arc<dyn BillingGateway>,
) -> Pipeline {
    let store: Arc<dyn Store> = store;
    Pipeline::build(store, venues, billing, config, None)
}

pub fn candidate(source: &str, event: &str, token: &str, side: &str, confidence: f64) -> ClassifiedCandidate {
    ClassifiedCandidate {
        source_identity: source.into(),
        source_kind: SourceKind::Institute,
        external_event_id: event.into(),
        token_symbols: vec![token.into()],
        side: side.into(),
        confidence,
        reasoning: Some("test".into()),
        attestation: None,
    }
}

/// A source, one deployment following it on `venues`, and a claimed wallet per venue.
pub async fn seed_world(store: &MemoryStore, venues: &[Venue]) -> (AlphaSource, AgentDeployment) {
    let source = store
        .upsert_alpha_source("inst:desk-1", SourceKind::Institute)
        .await
        .unwrap();
    let deployment = seed_deployment(store, source.id, venues, Decimal::from(1_000)).await;
    (source, deployment)
}

pub async fn seed_deployment(
    store: &MemoryStore,
    source_id: Uuid,
    venues: &[Venue],
    capital: Decimal,
) -> AgentDeployment {
    let deployment = store
        .upsert_deployment(&AgentDeployment {
            id: Uuid::new_v4(),
            user_id: USER.into(),
            alpha_source_ids: vec![source_id],
            enabled_venues: venues.to_vec(),
            risk_preferences: RiskPreferences::default(),
            capital_usd: capital,
            is_active: true,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    for venue in venues {
        if store.wallet_for(USER, *venue).await.unwrap().is_none() {
            let slot = venue.priority() + 1;
            store
                .add_wallet(*venue, &format!("0x{slot:040x}"), &format!("vault://{venue}/{slot}"))
                .await
                .unwrap();
            store.claim_wallet(USER, *venue).await.unwrap();
        }
    }
    deployment
}

pub fn prices(pairs: &[(&str, i64)]) -> HashMap<String, Decimal> {
    pairs
        .iter()
        .map(|(s, p)| (s.to_string(), Decimal::from(*p)))
        .collect()
}

// ---------------------------------------------------------------------------
// Scripted venue
// ---------------------------------------------------------------------------

/// How the venue answers status polls.
#[derive(Debug, Clone)]
pub enum StatusScript {
    FillAt { entry_price: Decimal },
    FailWith(String),
    NeverConfirm,
}

/// Venue double with scripted submit results and a submission log.
pub struct ScriptedVenue {
    venue: Venue,
    tokens: HashSet<String>,
    balance: Mutex<Decimal>,
    submit_script: Mutex<VecDeque<Result<String, VenueError>>>,
    status: Mutex<StatusScript>,
    submissions: Mutex<Vec<OrderParams>>,
    availability_script: Mutex<VecDeque<Result<bool, VenueError>>>,
    /// client_ref → tx_ref for orders the venue holds without us knowing.
    landed: Mutex<HashMap<String, String>>,
    venue_closes: Mutex<Vec<VenueClose>>,
    pub submit_calls: AtomicU32,
    pub availability_calls: AtomicU32,
    pub close_price: Mutex<Decimal>,
    pub close_qty: Mutex<Decimal>,
}

impl ScriptedVenue {
    pub fn new(venue: Venue, tokens: &[&str]) -> Self {
        Self {
            venue,
            tokens: tokens.iter().map(|t| t.to_uppercase()).collect(),
            balance: Mutex::new(Decimal::from(100_000)),
            submit_script: Mutex::new(VecDeque::new()),
            status: Mutex::new(StatusScript::FillAt {
                entry_price: Decimal::from(100),
            }),
            submissions: Mutex::new(Vec::new()),
            availability_script: Mutex::new(VecDeque::new()),
            landed: Mutex::new(HashMap::new()),
            venue_closes: Mutex::new(Vec::new()),
            submit_calls: AtomicU32::new(0),
            availability_calls: AtomicU32::new(0),
            close_price: Mutex::new(Decimal::from(110)),
            close_qty: Mutex::new(Decimal::from(2)),
        }
    }

    /// Queue results for upcoming availability checks; once drained, the
    /// token list decides.
    pub async fn script_availability(&self, results: Vec<Result<bool, VenueError>>) {
        self.availability_script.lock().await.extend(results);
    }

    /// The venue holds an order for `client_ref` even though submit never answered.
    pub async fn land_order(&self, client_ref: &str) {
        self.landed
            .lock()
            .await
            .insert(client_ref.to_string(), format!("{}-{client_ref}", self.venue));
    }

    /// The venue closes `position_ref` on its own.
    pub async fn close_at_venue(&self, position_ref: &str, exit_price: Decimal, qty: Decimal, trigger: CloseReason) {
        self.venue_closes.lock().await.push(VenueClose {
            position_ref: position_ref.to_string(),
            fill: CloseFill { exit_price, qty },
            trigger,
        });
    }

    pub async fn set_balance(&self, balance: Decimal) {
        *self.balance.lock().await = balance;
    }

    /// Queue results for upcoming submits; once drained, submits succeed.
    pub async fn script_submits(&self, results: Vec<Result<String, VenueError>>) {
        self.submit_script.lock().await.extend(results);
    }

    pub async fn set_status(&self, status: StatusScript) {
        *self.status.lock().await = status;
    }

    pub async fn submissions(&self) -> Vec<OrderParams> {
        self.submissions.lock().await.clone()
    }

    pub fn submit_count(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VenueAdapter for ScriptedVenue {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn is_available(&self, token_symbol: &str) -> Result<bool, VenueError> {
        self.availability_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.availability_script.lock().await.pop_front() {
            return scripted;
        }
        Ok(self.tokens.contains(&token_symbol.to_uppercase()))
    }

    async fn available_balance(&self, _wallet_address: &str) -> Result<Decimal, VenueError> {
        Ok(*self.balance.lock().await)
    }

    async fn submit_order(&self, params: &OrderParams) -> Result<String, VenueError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.submit_script.lock().await.pop_front();
        let result = scripted.unwrap_or_else(|| Ok(format!("{}-{}", self.venue, params.client_ref)));
        if result.is_ok() {
            self.submissions.lock().await.push(params.clone());
        }
        result
    }

    async fn get_order_status(&self, tx_ref: &str) -> Result<OrderStatus, VenueError> {
        match self.status.lock().await.clone() {
            StatusScript::FillAt { entry_price } => Ok(OrderStatus::Open {
                entry_price,
                qty: Decimal::from(2),
                position_ref: format!("pos-{tx_ref}"),
            }),
            StatusScript::FailWith(reason) => Ok(OrderStatus::Failed(reason)),
            StatusScript::NeverConfirm => Ok(OrderStatus::Pending),
        }
    }

    async fn find_order(&self, client_ref: &str) -> Result<Option<String>, VenueError> {
        Ok(self.landed.lock().await.get(client_ref).cloned())
    }

    async fn close_position(&self, _position_ref: &str) -> Result<CloseFill, VenueError> {
        Ok(CloseFill {
            exit_price: *self.close_price.lock().await,
            qty: *self.close_qty.lock().await,
        })
    }

    async fn closed_positions(&self, _wallet_address: &str) -> Result<Vec<VenueClose>, VenueError> {
        Ok(self.venue_closes.lock().await.clone())
    }
}

// ---------------------------------------------------------------------------
// Billing double
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingBilling {
    pub charges: Mutex<Vec<ChargeRequest>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl BillingGateway for RecordingBilling {
    async fn charge(&self, request: &ChargeRequest) -> Result<(), BillingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError("billing service down".into()));
        }
        self.charges.lock().await.push(request.clone());
        Ok(())
    }
}
