//! apphost: command-line client for the local astral daemon.

mod cli;
mod cmd;
mod ui;

use crate::cli::{Cli, Commands};
use apphost_types::config::load_config;
use apphost_wire::Network;
use clap::Parser;
use std::time::Duration;

fn env_filter(fallback: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback))
}

fn init_tracing_stderr(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level))
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    // Config decides the log level, so loading it logs through a temporary
    // subscriber.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .finish();
    let config = tracing::subscriber::with_default(bootstrap, || {
        load_config(cli.config.as_deref())
    });
    init_tracing_stderr(&config.log_level);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to create Tokio runtime: {e}"));
            std::process::exit(1);
        }
    };

    let default_timeout = config.query_timeout();
    let network = Network::new(config);
    let result = rt.block_on(async {
        match cli.command {
            Commands::Identity => cmd::cmd_identity(&network).await,
            Commands::Resolve { name } => cmd::cmd_resolve(&network, &name).await,
            Commands::Query {
                port,
                identity,
                timeout,
            } => {
                let timeout = timeout.map(Duration::from_secs).or(default_timeout);
                let target = cmd::Target::parse(identity.as_deref());
                cmd::cmd_query(&network, &port, target, timeout).await
            }
            Commands::Echo { port } => cmd::cmd_echo(&network, &port).await,
        }
    });

    if let Err(e) = result {
        ui::error(&e.to_string());
        std::process::exit(1);
    }
}
