use std::str::FromStr;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

fn init_tracing() {
    let env = std::env::var("CRISSCROSS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let port = std::env::var("PORT").ok().filter(|p| !p.is_empty()).unwrap_or_else(|| nop_paaf::DEFAULT_PORT.to_string());
    let addr = format!("0.0.0.0:{}", port);

    info!(addr = %addr, "nop-paaf: starting server");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "nop-paaf: cannot listen");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "nop-paaf: listening");

    if let Err(e) = axum::serve(listener, nop_paaf::router()).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "nop-paaf: server failed");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("nop-paaf: shutting down");
    }
}
