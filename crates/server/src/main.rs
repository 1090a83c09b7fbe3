//! Lumina server entry point.

use std::net::SocketAddr;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use lumina_config::{load_settings, Settings};
use lumina_server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Priority: env vars > config file > built-in defaults.
    let config_path = std::env::var("LUMINA_CONFIG").ok();
    let settings = match load_settings(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing is not up yet.
            eprintln!("warning: failed to load config: {e}; using defaults");
            Settings::default()
        }
    };

    init_tracing(&settings);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = config_path.as_deref().unwrap_or("defaults"),
        "starting lumina server"
    );

    let state = AppState::new(settings.clone());

    // Evict idle sessions in the background.
    let _cleanup = state
        .sessions
        .start_cleanup_task(Duration::from_secs(300));

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.observability.log_level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
