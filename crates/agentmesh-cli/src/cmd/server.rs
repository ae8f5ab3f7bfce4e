use super::{runtime, shutdown_on_ctrl_c};
use agentmesh_bridge::{stdin_lines, BridgeServer};
use agentmesh_types::MeshConfig;
use anyhow::Context;

pub fn cmd_server(
    mut config: MeshConfig,
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<u64>,
    block_size: Option<usize>,
) {
    if let Some(host) = host {
        config.bridge.host = host;
    }
    if let Some(port) = port {
        config.bridge.port = port;
    }
    if let Some(timeout) = timeout {
        config.bridge.idle_timeout_secs = timeout;
    }
    if let Some(block_size) = block_size {
        if block_size == 0 {
            eprintln!("--block-size must be greater than zero");
            std::process::exit(2);
        }
        config.bridge.read_block_size = block_size;
    }

    let rt = runtime();
    if let Err(e) = rt.block_on(serve(config)) {
        eprintln!("Bridge server failed: {e:#}");
        std::process::exit(1);
    }
}

async fn serve(config: MeshConfig) -> anyhow::Result<()> {
    let server = BridgeServer::bind(&config.bridge)
        .await
        .with_context(|| format!("binding {}", config.bridge.address()))?;
    println!("Bridge server listening on {}", server.local_addr()?);
    let reason = server.run(Some(stdin_lines()), shutdown_on_ctrl_c()).await?;
    println!("Bridge server stopped ({reason:?})");
    Ok(())
}
