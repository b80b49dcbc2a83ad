use anyhow::Context;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::execution::position_sizer::SizingPolicy;
use crate::execution::retry::RetryPolicy;
use crate::execution::trade_executor::ExecutorConfig;
use crate::ingestion::normalizer::NormalizerConfig;
use crate::models::Venue;
use crate::routing::RoutingConfig;
use crate::services::Stage;
use crate::settlement::billing::FeeSchedule;

const DEFAULT_SUPPORTED_ASSETS: &str = "BTC,ETH,SOL,ARB,AVAX,DOGE,LINK,OP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Polling intervals per worker stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerIntervals {
    pub routing: Duration,
    pub execution: Duration,
    pub settlement: Duration,
    pub impact: Duration,
    pub sweep: Duration,
    pub position_monitor: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    /// Bearer token for `/api/*`. Unset disables auth.
    pub api_token: Option<String>,

    // Workers
    pub worker_stages: Vec<Stage>,
    pub worker_parallelism: usize,
    pub worker_batch_size: i64,
    pub intervals: WorkerIntervals,

    // Normalizer
    pub min_confidence: f64,
    pub supported_assets: Vec<String>,
    pub attestation_operator_address: Option<String>,
    pub require_attestation: bool,

    // Routing + sizing
    pub min_source_reputation: Option<Decimal>,
    pub base_size_percent: f64,
    pub max_position_percent: f64,
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,

    // Execution
    pub submit_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub venue_call_timeout_secs: u64,
    pub confirm_timeout_secs: u64,
    pub confirm_poll_ms: u64,
    pub stale_intent_secs: i64,

    // Venue gateways
    pub venue_urls: HashMap<Venue, String>,
    pub venue_api_secret: Option<String>,
    pub dry_run: bool,
    pub paper_balance: Decimal,
    pub paper_prices: HashMap<String, Decimal>,

    // Settlement
    pub infra_fee_usd: Decimal,
    pub profit_share_rate: Decimal,
    pub billing_service_url: Option<String>,

    // Notifications
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

/// Where settings are read from: the process environment, or a map in tests.
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn non_empty(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parse `key` when set, otherwise use `default`. A malformed value is an error.
    fn parse_or<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.non_empty(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("{key}={raw:?} is malformed: {e}")),
            None => Ok(default),
        }
    }

    fn parse_opt<T>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.non_empty(key)
            .map(|raw| {
                raw.parse()
                    .map_err(|e| anyhow::anyhow!("{key}={raw:?} is malformed: {e}"))
            })
            .transpose()
    }
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `BTC=65000,ETH=3200` → symbol → price.
fn parse_prices(raw: &str) -> anyhow::Result<HashMap<String, Decimal>> {
    csv(raw)
        .into_iter()
        .map(|pair| {
            let (sym, price) = pair
                .split_once('=')
                .with_context(|| format!("PAPER_PRICES entry {pair:?} is not SYMBOL=PRICE"))?;
            let price = Decimal::from_str(price.trim())
                .with_context(|| format!("PAPER_PRICES price for {sym} is malformed"))?;
            Ok((sym.trim().to_uppercase(), price))
        })
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let vars = Vars { lookup: &lookup };
        let worker_stages = match vars.non_empty("WORKER_STAGES") {
            Some(raw) => csv(&raw)
                .iter()
                .map(|s| Stage::from_str(s).ok_or_else(|| anyhow::anyhow!("unknown worker stage {s:?}")))
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => Stage::ALL.to_vec(),
        };

        let log_format = match vars.non_empty("LOG_FORMAT").as_deref().map(str::to_lowercase).as_deref() {
            Some("json") => LogFormat::Json,
            Some("text") | None => LogFormat::Text,
            Some(other) => anyhow::bail!("LOG_FORMAT={other:?} is malformed: expected text or json"),
        };

        let mut venue_urls = HashMap::new();
        for (venue, key) in [
            (Venue::Hyperliquid, "HYPERLIQUID_SERVICE_URL"),
            (Venue::Ostium, "OSTIUM_SERVICE_URL"),
            (Venue::Gmx, "GMX_SERVICE_URL"),
            (Venue::Spot, "SPOT_SERVICE_URL"),
        ] {
            if let Some(url) = vars.non_empty(key) {
                venue_urls.insert(venue, url);
            }
        }

        let config = Self {
            database_url: vars
                .non_empty("DATABASE_URL")
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?,
            host: vars.non_empty("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: vars.parse_or("PORT", 8080)?,
            log_format,
            api_token: vars.non_empty("API_TOKEN"),

            worker_stages,
            worker_parallelism: vars.parse_or("WORKER_PARALLELISM", 4)?,
            worker_batch_size: vars.parse_or("WORKER_BATCH_SIZE", 100)?,
            intervals: WorkerIntervals {
                routing: Duration::from_millis(vars.parse_or("ROUTING_INTERVAL_MS", 2_000)?),
                execution: Duration::from_millis(vars.parse_or("EXECUTION_INTERVAL_MS", 2_000)?),
                settlement: Duration::from_millis(vars.parse_or("SETTLEMENT_INTERVAL_MS", 10_000)?),
                impact: Duration::from_millis(vars.parse_or("IMPACT_INTERVAL_MS", 60_000)?),
                sweep: Duration::from_millis(vars.parse_or("SWEEP_INTERVAL_MS", 30_000)?),
                position_monitor: Duration::from_millis(vars.parse_or("POSITION_MONITOR_INTERVAL_MS", 15_000)?),
            },

            min_confidence: vars.parse_or("MIN_CONFIDENCE", 0.6)?,
            supported_assets: csv(
                &vars.non_empty("SUPPORTED_ASSETS").unwrap_or_else(|| DEFAULT_SUPPORTED_ASSETS.into()),
            )
            .into_iter()
            .map(|s| s.to_uppercase())
            .collect(),
            attestation_operator_address: vars.non_empty("ATTESTATION_OPERATOR_ADDRESS"),
            require_attestation: vars.parse_or("REQUIRE_ATTESTATION", false)?,

            min_source_reputation: vars.parse_opt("MIN_SOURCE_REPUTATION")?,
            base_size_percent: vars.parse_or("BASE_SIZE_PERCENT", 5.0)?,
            max_position_percent: vars.parse_or("MAX_POSITION_PERCENT", 20.0)?,
            stop_loss_percent: vars.parse_or("STOP_LOSS_PERCENT", 5.0)?,
            take_profit_percent: vars.parse_or("TAKE_PROFIT_PERCENT", 10.0)?,

            submit_max_attempts: vars.parse_or("SUBMIT_MAX_ATTEMPTS", 3)?,
            backoff_base_ms: vars.parse_or("BACKOFF_BASE_MS", 250)?,
            backoff_max_ms: vars.parse_or("BACKOFF_MAX_MS", 5_000)?,
            venue_call_timeout_secs: vars.parse_or("VENUE_CALL_TIMEOUT_SECS", 10)?,
            confirm_timeout_secs: vars.parse_or("CONFIRM_TIMEOUT_SECS", 60)?,
            confirm_poll_ms: vars.parse_or("CONFIRM_POLL_MS", 2_000)?,
            stale_intent_secs: vars.parse_or("STALE_INTENT_SECS", 300)?,

            venue_urls,
            venue_api_secret: vars.non_empty("VENUE_API_SECRET"),
            dry_run: vars.parse_or("DRY_RUN", false)?,
            paper_balance: vars.parse_or("PAPER_BALANCE_USD", Decimal::from(10_000))?,
            paper_prices: match vars.non_empty("PAPER_PRICES") {
                Some(raw) => parse_prices(&raw)?,
                None => HashMap::new(),
            },

            infra_fee_usd: vars.parse_or("INFRA_FEE_USD", Decimal::new(2, 1))?,
            profit_share_rate: vars.parse_or("PROFIT_SHARE_RATE", Decimal::new(10, 2))?,
            billing_service_url: vars.non_empty("BILLING_SERVICE_URL"),

            telegram_bot_token: vars.non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: vars.non_empty("TELEGRAM_CHAT_ID"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            anyhow::bail!("MIN_CONFIDENCE must be within [0, 1]");
        }
        if self.worker_parallelism == 0 {
            anyhow::bail!("WORKER_PARALLELISM must be at least 1");
        }
        if self.profit_share_rate < Decimal::ZERO || self.profit_share_rate > Decimal::ONE {
            anyhow::bail!("PROFIT_SHARE_RATE must be within [0, 1]");
        }
        if self.infra_fee_usd < Decimal::ZERO {
            anyhow::bail!("INFRA_FEE_USD must not be negative");
        }
        Ok(())
    }

    pub fn runs(&self, stage: Stage) -> bool {
        self.worker_stages.contains(&stage)
    }

    // -----------------------------------------------------------------------
    // Derived sub-configs
    // -----------------------------------------------------------------------

    pub fn normalizer(&self) -> NormalizerConfig {
        NormalizerConfig {
            min_confidence: self.min_confidence,
            supported_assets: self.supported_assets.clone(),
            operator_address: self.attestation_operator_address.clone(),
            require_attestation: self.require_attestation,
        }
    }

    pub fn sizing(&self) -> SizingPolicy {
        SizingPolicy {
            base_size_percent: self.base_size_percent,
            max_position_percent: self.max_position_percent,
            stop_loss_percent: self.stop_loss_percent,
            take_profit_percent: self.take_profit_percent,
        }
    }

    pub fn routing(&self) -> RoutingConfig {
        RoutingConfig {
            min_source_reputation: self.min_source_reputation,
            retry: self.retry(),
            parallelism: self.worker_parallelism,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.submit_max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            call_timeout: Duration::from_secs(self.venue_call_timeout_secs),
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: self.retry(),
            confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
            confirm_poll: Duration::from_millis(self.confirm_poll_ms),
            stale_after: chrono::Duration::seconds(self.stale_intent_secs),
        }
    }

    pub fn fees(&self) -> FeeSchedule {
        FeeSchedule {
            infra_fee_usd: self.infra_fee_usd,
            profit_share_rate: self.profit_share_rate,
        }
    }
}
