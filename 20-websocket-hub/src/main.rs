use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use websocket_hub::{cli::Cli, server::Server};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let listener = TcpListener::bind(cli.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", cli.listen_addr()))?;
    let server = Server::new(listener, cli.hub_config());
    let addr = server.local_addr()?;
    info!("hub listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("hub exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
