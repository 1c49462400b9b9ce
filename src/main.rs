use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadproto::{Endpoint, Node, ProtocolConfig, Status};

#[derive(Parser, Debug)]
#[command(name = "kadproto")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:4000")]
    bind: SocketAddr,

    /// Host other peers should use to reach this node.
    #[arg(short, long)]
    advertise: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "HOST:PORT")]
    bootstrap: Option<Endpoint>,

    #[arg(long, default_value = "3000")]
    ping_timeout_ms: u64,

    #[arg(long, default_value = "4000")]
    settle_ms: u64,

    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ProtocolConfig::default()
        .with_ping_timeout(Duration::from_millis(args.ping_timeout_ms))
        .with_bootstrap_settle(Duration::from_millis(args.settle_ms));
    if config.bootstrap_settle <= config.ping_timeout {
        warn!("settle period should exceed ping timeout, bootstrap failures may go undetected");
    }

    let node = Node::bind(&args.bind.to_string(), args.advertise.as_deref(), config).await?;
    info!("Node identity: {}", node.identity());

    if let Some(bootstrap) = &args.bootstrap {
        info!("Bootstrapping from {}", bootstrap);
    }
    if node.join_network(args.bootstrap.clone()).await == Status::Failure {
        node.shutdown().await;
        anyhow::bail!("failed to join network");
    }
    info!("Joined network");

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, leaving network");
                break;
            }
            _ = interval.tick() => {
                let peers = node.known_peers().await;
                info!(
                    peers = peers.len(),
                    outstanding_pings = node.engine().outstanding_pings(),
                    "routing table status"
                );
            }
        }
    }

    if node.leave_network().await == Status::Failure {
        warn!("some peers could not be notified of our departure");
    }
    node.shutdown().await;

    Ok(())
}
