use axum::serve;
use inventory_ssot::api::routes::create_router;
use inventory_ssot::config::AppConfig;
use log::info;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    info!("inventory-ssot: network inventory synchronizer");

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: server={}:{}, dry_run={}",
        config.server.host, config.server.port, config.sync.dry_run
    );

    info!("Connecting to PostgreSQL...");
    let state = inventory_ssot::connect(&config).await?;
    info!("Store ready with {} entity types", state.schema.len());

    run_server(create_router().with_state(state), &config).await?;

    Ok(())
}

async fn run_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Sync API listening on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}
