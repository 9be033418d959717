use anyhow::Result;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pedagogical_radar::api::{create_router, AppState};
use pedagogical_radar::config::{Config, LoggingConfig};
use pedagogical_radar::database::Database;
use pedagogical_radar::grouping::GroupingEngine;
use pedagogical_radar::llm_gateway::ModelGateway;
use pedagogical_radar::result_cache::ResultCache;
use pedagogical_radar::transcription::TranscriptionEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let _guard = setup_logging(&config.logging)?;
    config.validate()?;

    info!("Starting Pedagogical Radar server...");

    // Initialize database
    let db = Database::new(&config.database.url).await?;
    info!("Database initialized successfully");

    // Initialize model-facing services
    let gateway = Arc::new(ModelGateway::new(&config.model));
    match gateway.provider_name() {
        Some(provider) => info!(provider, "Model gateway initialized"),
        None => info!("No model credentials configured - running with heuristic fallbacks"),
    }

    let cache = ResultCache::new(config.cache.grouping_ttl_secs);
    let grouping = Arc::new(GroupingEngine::new(gateway.clone(), cache));
    let transcription = Arc::new(TranscriptionEngine::new(&config.model));

    // Create application state
    let state = AppState {
        db,
        gateway,
        grouping,
        transcription,
    };

    // Build the application router with CORS middleware
    let app = create_router(state).layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn setup_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    use std::fs;
    use tracing_subscriber::fmt;

    // Configure log level from environment variable
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    // Configure console output
    let console_layer = config.console_enabled.then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true)
    });

    // Configure file output with daily rotation (no ANSI colors for files)
    let (file_layer, guard) = if config.file_enabled {
        fs::create_dir_all(&config.log_directory).unwrap_or_else(|e| {
            eprintln!("Warning: Could not create logs directory: {}", e);
        });
        let file_appender =
            tracing_appender::rolling::daily(&config.log_directory, "pedagogical-radar.log");
        let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(non_blocking_file);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    Ok(guard)
}
