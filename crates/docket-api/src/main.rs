//! docket-api server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_api::{parse_allowed_origins, router, AppState, StoreKind};
use docket_core::defaults::{SERVER_HOST, SERVER_PORT};
use docket_core::logging::SUBSYSTEM_DB;
use docket_db::{Database, MemoryStore, PoolConfig, TableNames};
use docket_pipeline::{
    AllowAllAuthorizer, ApiKeyAuthorizer, Authorizer, DisabledExecutor, HttpConversionParser,
    HttpSchemaExecutor, MarkdownFileParser, ParserRegistry, Pipeline, PipelineConfig,
    Repositories, SchemaExecutor,
};

/// Source types the markdown parser handles when a conversion service is
/// configured for everything else.
const TEXT_SOURCE_TYPES: &[&str] = &["md", "markdown", "txt"];

/// Postgres when `DATABASE_URL` is set, otherwise the in-memory store.
async fn open_store() -> anyhow::Result<(Repositories, Option<Arc<Database>>)> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let db = Database::connect_with_config(&url, PoolConfig::from_env(), TableNames::from_env()?)
                .await?;
            db.migrate().await?;
            info!(subsystem = SUBSYSTEM_DB, "Migrations applied");
            Ok((db.repositories(), Some(Arc::new(db))))
        }
        _ => {
            warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            Ok((MemoryStore::new().repositories(), None))
        }
    }
}

fn parser_registry() -> anyhow::Result<ParserRegistry> {
    let markdown = Arc::new(MarkdownFileParser::from_env());
    let registry = match HttpConversionParser::from_env()? {
        Some(http) => {
            info!(url = http.base_url(), "Conversion service configured");
            TEXT_SOURCE_TYPES
                .iter()
                .fold(ParserRegistry::new(), |registry, source_type| {
                    registry.with_parser(source_type, markdown.clone())
                })
                .with_fallback(Arc::new(http))
        }
        None => ParserRegistry::new().with_fallback(markdown),
    };
    Ok(registry)
}

fn schema_executor() -> anyhow::Result<Arc<dyn SchemaExecutor>> {
    Ok(match HttpSchemaExecutor::from_env()? {
        Some(executor) => Arc::new(executor),
        None => {
            warn!("SCHEMA_EXECUTOR_URL not set, runs will fail until an executor is configured");
            Arc::new(DisabledExecutor)
        }
    })
}

fn authorizer() -> anyhow::Result<Arc<dyn Authorizer>> {
    Ok(match ApiKeyAuthorizer::from_env()? {
        Some(auth) => {
            info!(keys = auth.key_count(), "API key authorization enabled");
            Arc::new(auth)
        }
        None => {
            warn!("DOCKET_API_KEYS not set, all callers are allowed");
            Arc::new(AllowAllAuthorizer)
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "docket_api=debug,docket_pipeline=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("docket-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let host = std::env::var("HOST").unwrap_or_else(|_| SERVER_HOST.to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(SERVER_PORT);

    let (repos, database) = open_store().await?;
    let pipeline = Pipeline::builder(repos)
        .with_parsers(parser_registry()?)
        .with_executor(schema_executor()?)
        .with_authorizer(authorizer()?)
        .with_config(PipelineConfig::from_env())
        .start()
        .await;
    let pipeline = Arc::new(pipeline);

    let allowed_origins = parse_allowed_origins(std::env::var("ALLOWED_ORIGINS").ok().as_deref());
    let state = match database {
        Some(db) => AppState::new(pipeline.clone(), StoreKind::Postgres).with_database(db),
        None => AppState::new(pipeline.clone(), StoreKind::Memory),
    };
    let store = state.store;
    let app = router(state, allowed_origins);

    // Start server
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(store = ?store, "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.shutdown().await?;
    info!("Server stopped");
    Ok(())
}
