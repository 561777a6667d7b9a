//! Procura - conversational procurement assistant
//!
//! A Rust backend that orchestrates tool-augmented chat turns over a
//! streaming model API, with an in-band email verification flow.

mod api;
mod catalog;
mod db;
mod email;
mod llm;
mod orchestrator;
mod tools;

use api::{create_router, AppState};
use catalog::HttpCatalog;
use db::Database;
use email::{CourierMailer, LogMailer, Mailer};
use llm::OpenAiClient;
use orchestrator::{DatabaseStorage, InMemoryPendingStore, TurnOrchestrator};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tools::{
    CreateShoppingRequestTool, GetUserRequestsTool, SearchKnowledgeTool, SqliteKnowledgeBase,
    ToolRegistry,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procura=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("PROCURA_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.procura/procura.db")
    });

    let port: u16 = std::env::var("PROCURA_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    seed_users(&db)?;
    index_documents(&db)?;

    // Model client
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("OPENAI_API_KEY not set; model calls will fail");
    }
    let base_url = std::env::var("OPENAI_BASE_URL").ok();
    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let llm = Arc::new(OpenAiClient::new(api_key, base_url.as_deref(), model));

    // Verification mail goes through Courier when configured, the log otherwise
    let mailer: Arc<dyn Mailer> = match (
        std::env::var("COURIER_API_KEY"),
        std::env::var("COURIER_OTP_TEMPLATE"),
    ) {
        (Ok(key), Ok(template)) if !key.is_empty() => Arc::new(CourierMailer::new(key, template)),
        _ => {
            tracing::warn!("Courier not configured; verification codes go to the log");
            Arc::new(LogMailer)
        }
    };

    // Tools
    let catalog_base =
        std::env::var("CATALOG_BASE_URL").unwrap_or_else(|_| "https://localhost".to_string());
    let catalog_token = std::env::var("CATALOG_AUTH_TOKEN").unwrap_or_default();
    let catalog = Arc::new(HttpCatalog::new(catalog_base, catalog_token));

    let knowledge: Arc<SqliteKnowledgeBase> = Arc::new(SqliteKnowledgeBase::new(db.clone()));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SearchKnowledgeTool::new(knowledge)));
    registry.register(Arc::new(CreateShoppingRequestTool::new(
        db.clone(),
        catalog,
    )));
    registry.register(Arc::new(GetUserRequestsTool::new(db.clone())));

    let orchestrator = Arc::new(TurnOrchestrator::new(
        DatabaseStorage::new(db.clone()),
        llm,
        Arc::new(registry),
        mailer,
    ));

    let pending = Arc::new(InMemoryPendingStore::default());
    pending.spawn_sweeper(Duration::from_secs(60));

    let state = AppState::new(db, pending, orchestrator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Procura server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Seed demo users on first run so verification has someone to verify
fn seed_users(db: &Database) -> Result<(), db::DbError> {
    if db.count_users()? > 0 {
        return Ok(());
    }
    db.ensure_user("Olvadis Torres", "olvadis.torres@example.com", "IT")?;
    db.ensure_user("Monica Herrera", "monica.herrera@example.com", "Marketing")?;
    tracing::info!("Seeded demo users");
    Ok(())
}

/// Index the knowledge base from PROCURA_DATA_DIR on first run
fn index_documents(db: &Database) -> Result<(), Box<dyn std::error::Error>> {
    if db.count_documents()? > 0 {
        return Ok(());
    }
    let Ok(dir) = std::env::var("PROCURA_DATA_DIR") else {
        return Ok(());
    };
    let kb = SqliteKnowledgeBase::new(db.clone());
    match kb.index_directory(PathBuf::from(&dir).as_path()) {
        Ok(indexed) => tracing::info!(indexed, dir = %dir, "Indexed knowledge base"),
        Err(e) => tracing::warn!(dir = %dir, error = %e, "Knowledge base indexing failed"),
    }
    Ok(())
}
