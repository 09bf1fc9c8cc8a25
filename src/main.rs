use std::net::SocketAddr;

use clap::Parser;
use tokio::signal;
use tracing::info;
use vx0net_daemon::IKEDaemon;

/// Standalone IKEv2/EAP daemon: binds a UDP listener and services inbound
/// IKE Session/Child Session exchanges until interrupted.
#[derive(Parser, Debug)]
#[command(name = "vx0-ike", about = "IKEv2/EAP authentication daemon")]
struct Cli {
    /// Address to bind the IKE listener on.
    #[arg(long, default_value = "0.0.0.0:500")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut daemon = IKEDaemon::new(cli.listen);
    daemon.start().await?;
    info!(addr = %cli.listen, "IKE daemon started");

    signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
