// src/main.rs
use std::sync::Arc;

use axum::{Extension, Router};
use tower_http::cors::CorsLayer;

use tangent::config::Config;
use tangent::handlers;
use tangent::llm::GeminiClient;
use tangent::store::PgStore;
use tangent::AppState;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    let config = Config::from_env().expect("Invalid configuration");

    // Create the database-backed store; migrations run on connect
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .expect("Failed to connect to the database"),
    );

    let mut model = GeminiClient::new(config.gemini_api_key.clone());
    if let Some(name) = &config.gemini_model {
        model = model.with_model(name.clone());
    }

    if config.jwt_secret.is_none() {
        tracing::warn!("JWT_SECRET not set; API requests will not be authenticated");
    }

    let shared_state = Arc::new(AppState::new(config, store, Arc::new(model)));

    // Build our application with all routes and shared state
    let app = Router::new()
        .merge(handlers::chat::chat_routes())
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state.clone()));

    let listener = tokio::net::TcpListener::bind(&shared_state.config.bind_addr)
        .await
        .expect("Failed to bind listen address");
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.expect("server exited");
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,tangent=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,tangent=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    // JSON logging for production log aggregation, human-readable otherwise
    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("tangent starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Build mode: {}",
        if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        }
    );

    Ok(())
}
