//! Conveyor CI server.

use conveyor_api::runtime::ProcessRuntime;
use conveyor_api::{AppState, Config, routes};
use conveyor_store::Store;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!(path = %config.database_path.display(), "opening store");
    let store = Store::open(&config.database_path).await?;

    let runtime = Arc::new(ProcessRuntime::from_env());
    let listen_addr = config.listen_addr;
    let state = AppState::new(store, runtime, config);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(addr = %listen_addr, "starting server");
    let listener = TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
