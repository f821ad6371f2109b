//! Clap CLI definitions for apphost.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  apphost identity                    Print this node's identity
  apphost resolve alice               Look up a node by name
  echo hi | apphost query echo        Send stdin to the local echo port
  apphost query echo --identity alice Query the echo port on node alice
  apphost echo echo                   Serve an echo port until Ctrl+C";

/// Talk to the local astral daemon.
#[derive(Parser)]
#[command(name = "apphost", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the local node identity.
    Identity,
    /// Resolve a node name to its identity.
    Resolve {
        /// Node name.
        name: String,
    },
    /// Copy stdin to a port and the reply to stdout.
    Query {
        /// Port to query.
        port: String,
        /// Target node: hex identity or a name to resolve. Defaults to this node.
        #[arg(long)]
        identity: Option<String>,
        /// Give up after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Register a port and echo every stream back until interrupted.
    Echo {
        /// Port to register.
        port: String,
    },
}
