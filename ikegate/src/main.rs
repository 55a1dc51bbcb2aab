//! # ikegate
//!
//! A user-space IKE/ESP VPN gateway

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use clap::Parser;
use ikegate::config::Config;
use ikegate::Gateway;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

mod cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config {
        passwd: cli.passwd,
        dns: cli.dns,
        nocache: cli.nocache,
        rserver: cli.rserver,
        urserver: cli.urserver,
    };
    let gateway = match Gateway::bind(config).await {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("Could not start: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = gateway.run().await {
        error!("Gateway stopped: {err}");
        std::process::exit(1);
    }
}
