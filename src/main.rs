use std::sync::Arc;
use std::time::Duration;

use alphaflow::api::create_router;
use alphaflow::config::{AppConfig, LogFormat};
use alphaflow::db::{self, PgStore, Store};
use alphaflow::services::notifier::Notifier;
use alphaflow::services::{spawn_workers, HealthRegistry, Pipeline};
use alphaflow::settlement::{BillingGateway, HttpBillingGateway, LedgerOnlyBilling};
use alphaflow::venues::registry_from_config;
use alphaflow::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.log_format);
    let addr = format!("{}:{}", config.host, config.port);

    let metrics_handle = alphaflow::metrics::init_metrics()?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("Database connected, migrations applied");
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let notifier = match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat)) => {
            tracing::info!("Telegram notifications enabled");
            Some(Arc::new(Notifier::new(token.clone(), chat.clone())))
        }
        _ => None,
    };

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.venue_call_timeout_secs))
        .build()?;
    let venues = registry_from_config(&config, http.clone());
    tracing::info!(venues = ?venues.venues(), dry_run = config.dry_run, "Venue registry ready");

    let billing: Arc<dyn BillingGateway> = match &config.billing_service_url {
        Some(url) => Arc::new(HttpBillingGateway::new(
            http,
            url.clone(),
            Duration::from_secs(config.venue_call_timeout_secs),
        )),
        None => {
            tracing::warn!("BILLING_SERVICE_URL not set, charges are recorded in the ledger only");
            Arc::new(LedgerOnlyBilling)
        }
    };

    let pipeline = Pipeline::build(store.clone(), venues, billing, &config, notifier.clone());
    let health = HealthRegistry::new();
    let workers = spawn_workers(pipeline.clone(), &config, health.clone());

    let state = AppState {
        store,
        pipeline,
        config: Arc::new(config),
        metrics_handle,
        notifier,
        health,
    };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(workers = workers.len(), "Server listening on {addr}");
    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}
