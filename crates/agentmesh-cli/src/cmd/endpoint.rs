use super::{runtime, shutdown_on_ctrl_c};
use agentmesh_bridge::{stdin_lines, BridgeEndpoint, ConsoleCommand};
use agentmesh_types::MeshConfig;
use agentmesh_wire::BridgeFrame;
use anyhow::Context;
use serde_json::Value;

const ENDPOINT_HELP: &str = "Type '<dest> <message>' to shout on channel <dest>. \
Messages that parse as JSON are sent as JSON, anything else as a string. \
Type 'quit' to disconnect.";

pub fn cmd_endpoint(mut config: MeshConfig, name: &str, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.bridge.host = host;
    }
    if let Some(port) = port {
        config.bridge.port = port;
    }

    let rt = runtime();
    if let Err(e) = rt.block_on(interact(config, name)) {
        eprintln!("Bridge endpoint failed: {e:#}");
        std::process::exit(1);
    }
}

/// Split `<dest> <message>`; the message is JSON if it parses, otherwise a string.
fn parse_outgoing(line: &str) -> Option<(&str, Value)> {
    let (dest, text) = line.trim().split_once(char::is_whitespace)?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let payload = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
    Some((dest, payload))
}

async fn interact(config: MeshConfig, name: &str) -> anyhow::Result<()> {
    let addr = config.bridge.address();
    let mut endpoint = BridgeEndpoint::connect(&addr, name)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    println!("Connected to {addr} as {name}. Type 'help' for usage.");

    let mut console = stdin_lines();
    let mut shutdown = shutdown_on_ctrl_c();
    loop {
        tokio::select! {
            frame = endpoint.recv() => match frame? {
                BridgeFrame::Shout { sender, channel, payload } => {
                    println!("{sender} -> {channel}: {payload}");
                }
                BridgeFrame::Join { channel } => println!("+ {channel}"),
                BridgeFrame::Leave { channel } => println!("- {channel}"),
            },
            line = console.recv() => {
                let Some(line) = line else { break };
                match ConsoleCommand::parse(&line) {
                    ConsoleCommand::Quit => break,
                    ConsoleCommand::Help => println!("{ENDPOINT_HELP}"),
                    ConsoleCommand::Unrecognized(_) => match parse_outgoing(&line) {
                        Some((dest, payload)) => endpoint.shout(dest, payload).await?,
                        None => println!("Expected '<dest> <message>'"),
                    },
                }
            }
            Ok(()) = shutdown.changed() => break,
        }
    }
    endpoint.close().await?;
    Ok(())
}
