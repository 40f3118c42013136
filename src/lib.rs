pub mod completion;
pub mod config;
pub mod error;
pub mod http;
pub mod relay;
pub mod server;
pub mod types;
pub mod wechat;

#[cfg(test)]
mod testing;

use log::{debug, info, warn};
use tokio::net::TcpListener;

use config::Config;
use error::Result;
use server::AppState;

/// Run the webhook server until Ctrl-C.
pub async fn run() -> Result<()> {
    info!("Initializing relay");
    let config = Config::from_env()?;

    debug!("Building relay state");
    let state = AppState::from_config(&config)?;
    let app = server::router(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Listening for WeChat callbacks on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received, abandoning in-flight relays"),
                Err(e) => {
                    warn!("Cannot listen for shutdown signal: {e}");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    Ok(())
}
