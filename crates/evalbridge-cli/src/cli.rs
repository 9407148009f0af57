//! Clap CLI definitions for evalbridge.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  evalbridge eval '(+ 1 2 3)'             Evaluate on the configured protocol peer
  evalbridge describe                     List the peer's supported operations
  evalbridge serve                        Run a bridge node
  evalbridge serve --connect host:7889    Run a node linked to another bridge
  evalbridge call shell 'echo hi'         Run a command on a bridge node
  evalbridge call file-write a.txt hello  Write a file through a bridge node
  evalbridge id new --count 3             Generate correlation ids
  evalbridge config show                  Print the effective configuration";

/// evalbridge: remote evaluation across runtimes.
#[derive(Parser)]
#[command(
    name = "evalbridge",
    version,
    about = "Remote evaluation bridge over a bencode wire protocol",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate code on a protocol peer.
    Eval {
        /// Source text to evaluate.
        code: String,
        /// Peer host (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// Peer port (overrides config).
        #[arg(long)]
        port: Option<u16>,
        /// Overall timeout in milliseconds (overrides config).
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Evaluate in this namespace.
        #[arg(long)]
        ns: Option<String>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Ask a protocol peer which operations it supports.
    Describe {
        /// Peer host (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// Peer port (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a bridge node until interrupted.
    Serve {
        /// Address to accept peer links on (overrides config).
        #[arg(long)]
        listen: Option<String>,
        /// Peer bridge to link with (overrides config).
        #[arg(long)]
        connect: Option<String>,
    },
    /// Send one request to a bridge node and print the response.
    Call {
        /// Operation: eval, file-read, file-write or shell.
        op: String,
        /// Operation arguments. A single argument is sent as text.
        #[arg(required = true)]
        args: Vec<String>,
        /// Bridge node to send to (defaults to the configured listen address).
        #[arg(long)]
        bridge: Option<String>,
        /// Execute in this process instead of on a bridge node.
        #[arg(long, conflicts_with = "bridge")]
        local: bool,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Generate and inspect correlation ids [*].
    #[command(subcommand)]
    Id(IdCommands),
    /// Show configuration [*].
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum IdCommands {
    /// Generate new ids.
    New {
        /// How many ids to generate.
        #[arg(long, short = 'n', default_value_t = 1)]
        count: usize,
        /// Suffix appended as `<id>-<tag>`.
        #[arg(long)]
        tag: Option<String>,
    },
    /// Validate an id and show its timestamp.
    Inspect {
        /// Id to inspect (a `-tag` suffix is allowed).
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the default config file path.
    Path,
}
