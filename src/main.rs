//! draftly-ws — the collaboration server binary.

use draftly_collab::{server, Config, Context};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    let port = config.ws_port;

    let ctx = match Context::connect(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind port {port}: {e}");
            std::process::exit(1);
        }
    };

    log::info!("server running on port :{port}");
    if let Err(e) = axum::serve(listener, server::router(ctx)).await {
        log::error!("server error: {e}");
        std::process::exit(1);
    }
}
