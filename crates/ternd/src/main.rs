#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use ternd::config::Config;
use ternd::server;
use tokio::net::TcpListener;
use tracing::info;

/// CLI arguments for the node.
#[derive(Parser, Debug)]
#[command(name = "ternd")]
#[command(about = "BinkP store-and-forward mailer node")]
#[command(version)]
struct Args {
    /// Configuration file.
    #[arg(short = 'c', default_value = "/etc/tern/ternd.conf")]
    config: PathBuf,
    /// Poll the given peer (host[:port]) instead of listening.
    #[arg(short = 'p')]
    poll: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::parse_file(&args.config)
        .with_context(|| format!("cannot read config file {}", args.config.display()))?;
    for link in config.links() {
        link.in_spool
            .create_dirs()
            .with_context(|| format!("cannot provision inbound spool for {}", link.address))?;
        link.out_spool
            .create_dirs()
            .with_context(|| format!("cannot provision outbound spool for {}", link.address))?;
    }
    let config = Arc::new(config);

    if let Some(host) = args.poll {
        return server::poll(config, &host)
            .await
            .with_context(|| format!("poll of {host} failed"));
    }

    let listener = TcpListener::bind(("0.0.0.0", server::BINKP_PORT))
        .await
        .context("cannot listen")?;
    tokio::select! {
        result = server::run(listener, config) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }
    Ok(())
}
