use clap::Parser;
use roomlog::{AppState, Config, MessageStore, StoreOptions};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .init();

    let store = MessageStore::open(&config.database_url, StoreOptions::from(&config)).await?;
    let app = roomlog::app(AppState::new(store.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(bind = %config.bind, database_url = %config.database_url, "roomlog listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
