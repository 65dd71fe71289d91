use anyhow::Result;
use clap::Parser;
use fabric_server::Config;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();

    fabric_server::install_metrics_server(&cfg).await?;
    let router = fabric_server::build(&cfg).await?;

    let addr = fabric_server::control_addr(&cfg);
    info!(%addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        r = axum::serve(listener, router) => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown");
        }
    }

    Ok(())
}
