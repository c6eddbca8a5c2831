//! FindCo API Server
//!
//! Receives iyzico subscription webhooks and applies them to user records.

use std::sync::Arc;

use findco_api::{create_pool, create_router, AppState, Config};
use findco_billing::{BillingService, PgRecordStore, RecordStore};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,findco_api=debug,findco_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting FindCo API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../../migrations").run(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool));
    let billing = BillingService::new(config.billing.clone(), config.email.clone(), store);
    if !billing.email.is_enabled() {
        tracing::warn!("Subscription emails will only be logged");
    }

    let state = AppState::new(billing.webhooks.clone());
    let app = create_router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}
