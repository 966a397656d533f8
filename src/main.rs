//! PuzzleBounty settlement service.
//!
//! HTTP backend that settles competitive puzzle bounties: decides winners,
//! transitions bounties atomically, and records external escrow payments.

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use puzzlebounty_backend::{
    api::{routes, AppState},
    middleware::request_logging,
    models::Config,
    store::BountyStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!(db = %config.database_path, "starting puzzlebounty backend");

    let store = Arc::new(BountyStore::new(&config.database_path)?);
    let app_state = AppState { store };

    let api_routes = Router::new()
        .route("/api/bounties", post(routes::create_bounty))
        .route("/api/bounties/:id", get(routes::get_bounty))
        .route("/api/bounties/:id/activate", post(routes::activate_bounty))
        .route("/api/bounties/:id/cancel", post(routes::cancel_bounty))
        .route("/api/bounties/:id/expire", post(routes::expire_bounty))
        .route("/api/bounties/:id/join", post(routes::join_bounty))
        .route("/api/bounties/:id/leave", post(routes::leave_bounty))
        .route("/api/bounties/:id/finish", post(routes::finish_participant))
        .route(
            "/api/bounties/:id/participants",
            get(routes::list_participants),
        )
        .route("/api/bounties/:id/settle", post(routes::settle_bounty))
        .route("/api/bounties/:id/preview", get(routes::preview_winners))
        .route("/api/bounties/:id/winners", get(routes::list_winners))
        .route("/api/bounties/:id/payments", post(routes::record_payment))
        .route("/api/users/:id/stats", get(routes::get_user_stats))
        .with_state(app_state.clone());

    let public_routes = Router::new()
        .route("/health", get(routes::health_check))
        .with_state(app_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-filter support.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "puzzlebounty_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
