//! agentmesh CLI — bridge server, direct bridge endpoint and an in-process demo.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands};
use agentmesh_types::load_config;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Log to stderr. `RUST_LOG` wins over `--log-level`, which wins over the config file.
fn init_tracing_stderr(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    // The config decides the log level, so its own warnings go through a
    // temporary warn-level subscriber.
    let bootstrap = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .finish();
    let config = tracing::subscriber::with_default(bootstrap, || load_config(cli.config.as_deref()));

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    init_tracing_stderr(&level);

    match cli.command {
        Commands::Server {
            host,
            port,
            timeout,
            block_size,
        } => cmd::server::cmd_server(config, host, port, timeout, block_size),
        Commands::Endpoint { name, host, port } => {
            cmd::endpoint::cmd_endpoint(config, &name, host, port)
        }
        Commands::Demo { workers, rounds } => cmd::demo::cmd_demo(config, workers, rounds),
    }
}
