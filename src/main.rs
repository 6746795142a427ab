//! Ecom Analytics API - natural-language questions over an e-commerce database
//!
//! A question goes through a fixed pipeline:
//! - Schema catalog: cached, versioned snapshot of the analytics tables
//! - SQL generation: the model writes one SELECT grounded in that snapshot
//! - Validation: the statement is parsed, scope-checked and row-capped
//! - Execution: read-only transaction with a statement timeout
//! - Answer: the model summarizes the rows, or the raw table is returned

mod config;
mod db;
mod error;
mod introspection;
mod llm;
mod models;
mod pipeline;
mod prompt;
mod routes;
mod snapshot;
mod state;

use crate::config::Settings;
use crate::routes::create_router;
use crate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting Ecom Analytics API...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    if settings.llm.api_key.is_none() {
        warn!("⚠️  LLM_API_KEY not set, calling {} without credentials", settings.llm.api_url);
    }

    let pool = db::create_pool(&settings.database)
        .map_err(|e| anyhow::anyhow!("Failed to create database pool: {}", e))?;
    verify_database(&pool, &settings).await;

    let state = Arc::new(
        AppState::new(pool, &settings)
            .map_err(|e| anyhow::anyhow!("Failed to build LLM client: {}", e))?,
    );

    // Warm the schema cache; requests retry the load if this fails
    match state.catalog.load().await {
        Ok(snapshot) => info!(
            "✅ Schema '{}' loaded: {} tables",
            snapshot.namespace,
            snapshot.tables.len()
        ),
        Err(e) => warn!("⚠️  Schema not loaded at startup: {}", e),
    }

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   POST /api/query            - Ask a question in plain language");
    info!("   GET  /api/schema           - Current schema snapshot");
    info!("   POST /api/schema/reload    - Re-read the schema and report drift");
    info!("   DELETE /api/schema/cache   - Drop the cached schema snapshot");
    info!("   GET  /health               - Liveness check");
    info!("");
    info!(
        "🛡️  Row cap {}, DB timeout {:?}, LLM timeout {:?}, model {}",
        settings.query.max_rows,
        settings.query.db_timeout,
        settings.llm.timeout,
        settings.llm.model
    );

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ecom_analytics_api=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Check connectivity once; the server still starts when the database is down
async fn verify_database(pool: &deadpool_postgres::Pool, settings: &Settings) {
    let check = async {
        let client = pool.get().await.map_err(|e| e.to_string())?;
        client
            .query_one("SELECT 1 as ok", &[])
            .await
            .map_err(|e| e.to_string())
    };

    match tokio::time::timeout(settings.query.db_timeout, check).await {
        Ok(Ok(_)) => info!(
            "✅ Database connection successful (TLS: {})",
            settings.database.require_tls
        ),
        Ok(Err(e)) => warn!("⚠️  Database not reachable at startup: {}", e),
        Err(_) => warn!(
            "⚠️  Database check timed out after {:?}",
            settings.query.db_timeout
        ),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
