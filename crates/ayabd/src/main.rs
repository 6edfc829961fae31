//! ayabd
//!
//! Knits the pattern queue on an AYAB equipped machine and serves the JSON
//! control API for the web front end.

use std::path::PathBuf;

use anyhow::Context;
use ayabd_core::api;
use ayabd_core::config::ServiceConfig;
use ayabd_core::protocol::list_ports;
use ayabd_core::service::KnitService;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("AYABD_BUILD_ID"), ")");

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// `simulation`, a serial device, or host[:port] of a serial proxy
    #[arg(short, long)]
    connection: Option<String>,

    /// Directory holding the queue state file
    #[arg(short, long)]
    state_dir: Option<PathBuf>,

    /// JSON config file; command line options take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control API port
    #[arg(short = 'p', long)]
    api_port: Option<u16>,

    /// Accept control API connections from other hosts
    #[arg(long)]
    api_non_local: bool,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Args {
    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(connection) = &self.connection {
            config.connection = connection.clone();
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(port) = self.api_port {
            config.api_port = port;
        }
        config.api_non_local |= self.api_non_local;
        Ok(config)
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted, shutting down"),
        Err(e) => {
            error!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.list_ports {
        for port in list_ports() {
            println!("{}", serde_json::to_string(&port)?);
        }
        return Ok(());
    }

    let config = args.service_config()?;
    info!("ayabd {} starting, connection {}", VERSION, config.connection);

    let addr = api::listen_addr(config.api_port, config.api_non_local);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot listen on {}", addr))?;

    let (service, handle) = KnitService::new(config).context("Invalid connection")?;
    tokio::spawn(async move {
        if let Err(e) = api::serve(listener, handle).await {
            error!("Control API stopped: {}", e);
        }
    });

    service.run_until(shutdown_signal()).await;
    Ok(())
}
