use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;

use hostpulse_agent::{ws, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env();
    let state = AppState::new(&cfg)?;
    let _watchdog = state.scheduler.spawn_watchdog();

    // Local clients only.
    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("hostpulse agent listening at ws://{addr}/ws");
    ws::serve(listener, state).await
}
