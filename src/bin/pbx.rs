use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use crossbar_pbx::{Config, Server, DEFAULT_PORT, MIN_PORT};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Parser)]
#[command(name = "pbx", about = "Simulated private branch exchange")]
struct Args {
    /// Listen port
    #[arg(short = 'p', long = "port",
          value_parser = clap::value_parser!(u16).range(MIN_PORT as i64..))]
    port: Option<u16>,

    /// Config file
    #[arg(short = 'c', long = "config",
          default_value = "/etc/crossbar/crossbar.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config).await?;
    crossbar_log::init(config.log.as_deref());

    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    if port < MIN_PORT {
        bail!("port {port} is reserved; use {MIN_PORT} or above");
    }

    let server = Server::bind(port).await?;
    let shutdown = server.shutdown_token();
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = hangup.recv() => info!("SIGHUP received"),
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        }
        shutdown.cancel();
    });

    server.run().await
}
