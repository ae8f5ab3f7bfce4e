//! Clap CLI definitions for agentmesh.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  agentmesh server --port 7417          Relay frames between bridge clients
  agentmesh server --timeout 600        Exit after ten idle minutes
  agentmesh endpoint FED1_console       Join a bridge directly and type '<dest> <message>'
  agentmesh demo --workers 3            Run a boss/worker federation in-process";

/// agentmesh — named-channel messaging for agent federations.
#[derive(Parser)]
#[command(name = "agentmesh", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.agentmesh/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter, e.g. `debug` or `agentmesh_bridge=trace`. RUST_LOG wins if set.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a bridge server. Type `help` or `quit` on stdin.
    Server {
        /// Interface to listen on.
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on. 0 picks a free port.
        #[arg(long)]
        port: Option<u16>,
        /// Exit after this many seconds without activity. 0 never exits.
        #[arg(long)]
        timeout: Option<u64>,
        /// Read at most this many bytes from a client at once.
        #[arg(long)]
        block_size: Option<usize>,
    },
    /// Connect to a bridge server as a named participant.
    Endpoint {
        /// Full address to announce, e.g. `FED1_console`.
        name: String,
        /// Bridge server host.
        #[arg(long)]
        host: Option<String>,
        /// Bridge server port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a boss and workers in one process until the boss quits the federation.
    Demo {
        /// Number of workers.
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Rounds of ready/GO before the boss quits.
        #[arg(long, default_value_t = 3)]
        rounds: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_server_flags() {
        let cli = Cli::parse_from([
            "agentmesh",
            "--log-level",
            "debug",
            "server",
            "--port",
            "0",
            "--timeout",
            "30",
            "--block-size",
            "16",
        ]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Server {
                host,
                port,
                timeout,
                block_size,
            } => {
                assert_eq!(host, None);
                assert_eq!(port, Some(0));
                assert_eq!(timeout, Some(30));
                assert_eq!(block_size, Some(16));
            }
            _ => panic!("Expected server subcommand"),
        }
    }

    #[test]
    fn test_parse_endpoint() {
        let cli = Cli::parse_from(["agentmesh", "endpoint", "FED1_console", "--port", "9000"]);
        match cli.command {
            Commands::Endpoint { name, port, .. } => {
                assert_eq!(name, "FED1_console");
                assert_eq!(port, Some(9000));
            }
            _ => panic!("Expected endpoint subcommand"),
        }
    }
}
