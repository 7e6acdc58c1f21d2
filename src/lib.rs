pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

use std::sync::Arc;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use adapters::{
    DocumentAdapter, GraphAdapter, GraphLoader, QueryAdapter, QueryDocument, QueryExecutor, StaticQueryExecutor,
    StoreQueryExecutor,
};
pub use error::*;
pub use logic::{reconcile, Differ, FlagController, RelationalResolver, SyncJob};

// Export all model types
pub use model::*;

// Export store types
pub use store::{register_schema, MemoryStore, PostgresStore, RecordStore};

use crate::api::handlers::AppState;
use crate::config::AppConfig;

/// Validates the schema and flag configuration, then connects to
/// PostgreSQL and prepares one table per entity type.
pub async fn connect(config: &AppConfig) -> anyhow::Result<AppState<PostgresStore>> {
    let schema = Arc::new(config.sync.load_schema()?);
    // Bad flags are a startup error, not a per-request one
    SyncJob::new(schema.clone(), &config.sync)?;

    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url, config.max_connections()).await?;
    store.migrate().await?;
    register_schema(&store, &schema).await?;

    Ok(AppState::new(Arc::new(store), schema, config.sync.clone()))
}

// Function for integration testing
pub async fn run_server() -> anyhow::Result<()> {
    use axum::serve;
    use tokio::net::TcpListener;

    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();

    let config = AppConfig::load()?;
    let state = connect(&config).await?;
    let app = routes::create_router().with_state(state);

    let listener = TcpListener::bind(&config.server_address()).await?;
    serve(listener, app).await?;

    Ok(())
}
