use anyhow::{Result, bail};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mps_router::config::Settings;
use mps_router::db;
use mps_router::proxy::Server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Probe the routing store and exit instead of serving
    #[arg(long)]
    health: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::from_env()?;
    let store = db::connect(&settings.connection_string, settings.max_db_connections)?;

    if args.health {
        if store.health().await {
            info!("routing store is healthy");
            return Ok(());
        }
        bail!("routing store health check failed");
    }

    let server = Arc::new(Server::new(store, settings.listen_addr, settings.target));
    info!("proxying from {} to {}", server.addr(), server.target());
    server.listen_and_serve().await
}
