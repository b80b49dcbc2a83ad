use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::require_auth;
use super::handlers::{candidates, deployments, health, intents, positions, signals, wallets};
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::render_metrics));

    let protected = Router::new()
        // Intake
        .route("/api/candidates", post(candidates::submit))
        // Signals + sources
        .route("/api/signals", get(signals::list_signals))
        .route("/api/signals/:id", get(signals::get_signal))
        .route("/api/alpha-sources", get(signals::list_alpha_sources))
        .route("/api/alpha-sources/:id/active", put(signals::set_alpha_source_active))
        .route("/api/integrity-rejections", get(signals::list_integrity_rejections))
        // Deployments
        .route("/api/deployments", get(deployments::list).post(deployments::upsert))
        .route("/api/deployments/:id", get(deployments::detail))
        .route("/api/deployments/:id/pnl", get(deployments::pnl_history))
        // Execution
        .route("/api/intents", get(intents::list))
        .route("/api/intents/:id", get(intents::detail))
        .route("/api/intents/:id/reconcile", post(intents::reconcile))
        .route("/api/positions", get(positions::list))
        .route("/api/positions/:id", get(positions::detail))
        .route("/api/positions/:id/close", post(positions::close))
        // Wallet pool
        .route("/api/wallets", get(wallets::for_user).post(wallets::add))
        .route("/api/wallets/claim", post(wallets::claim))
        .route("/api/wallets/:id/release", post(wallets::release))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
