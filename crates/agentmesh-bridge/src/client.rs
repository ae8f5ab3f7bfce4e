//! Bridge client — relays one overlay segment to a bridge server.
//!
//! The client holds a *monitor* peer on the local overlay. Every local
//! JOIN/LEAVE is reference counted per channel: the first JOIN sends a
//! `JOIN` frame and the last LEAVE sends a `LEAVE` frame. Local SHOUTs on
//! channels the monitor has joined are forwarded as `SHOUT` frames.
//!
//! For each `JOIN` frame from the server the client creates a *proxy*
//! [`Transport`] named after the remote channel. A relayed `SHOUT` is
//! re-shouted locally through the proxy of its original sender, so local
//! subscribers see the remote sender's address. Events caused by proxies
//! are never relayed back.

use crate::console::{next_line, ConsoleCommand};
use crate::error::{BridgeError, BridgeResult};
use crate::stream::spawn_frame_reader;
use crate::ShutdownReason;
use agentmesh_wire::frame::write_frame;
use agentmesh_wire::{
    BridgeFrame, Overlay, OverlayError, OverlayEvent, OverlayNetwork, Transport, TransportConfig,
    GLOBAL_CHANNEL, SHUTDOWN_SENTINEL,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const CLIENT_HELP: &str =
    "You can quit the bridge client (but not the federation) by typing \"quit\".";

/// A bridge client connected to a server, not yet relaying.
pub struct BridgeClient {
    state: ClientState,
    frames: mpsc::Receiver<BridgeFrame>,
    reader: JoinHandle<()>,
    poll_interval: Duration,
}

/// Everything the event loop mutates, owned in one place.
struct ClientState {
    network: Arc<dyn OverlayNetwork>,
    transport: TransportConfig,
    monitor: Arc<dyn Overlay>,
    writer: OwnedWriteHalf,
    global_channel: String,
    channel_counts: HashMap<String, usize>,
    proxies: HashMap<String, Transport>,
    proxy_uuids: HashSet<Uuid>,
}

impl BridgeClient {
    /// Connect to the server at `server` and announce a monitor peer on `network`.
    pub async fn connect(
        network: Arc<dyn OverlayNetwork>,
        server: &str,
        transport: TransportConfig,
    ) -> BridgeResult<Self> {
        let stream = TcpStream::connect(server)
            .await
            .map_err(|source| BridgeError::Connect {
                addr: server.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        let state = ClientState::new(network, transport, writer)?;
        let (frames, reader) = spawn_frame_reader(read_half);
        info!(%server, monitor = %state.monitor.uuid(), "Bridge client connected");

        Ok(Self {
            poll_interval: state.transport.poll_interval,
            state,
            frames,
            reader,
        })
    }

    /// UUID of the monitor peer on the local overlay.
    pub fn monitor_uuid(&self) -> Uuid {
        self.state.monitor.uuid()
    }

    /// Relay until told to stop.
    ///
    /// On return the server socket is shut down, the monitor peer has left
    /// the overlay and every proxy is closed. Proxies are closed locally;
    /// the rest of the federation is not told to quit.
    pub async fn run(
        self,
        mut console: Option<mpsc::Receiver<String>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BridgeResult<ShutdownReason> {
        let Self {
            mut state,
            mut frames,
            reader,
            poll_interval,
        } = self;
        let (events_tx, mut events) = mpsc::channel(256);
        let pump = spawn_overlay_pump(Arc::clone(&state.monitor), poll_interval, events_tx);
        let mut watching_signal = true;

        let outcome = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => match state.on_local_event(event).await {
                        Ok(Some(reason)) => break Ok(reason),
                        Ok(None) => {}
                        Err(e) if e.is_connection_loss() => {
                            warn!(error = %e, "Lost connection to bridge server");
                            break Ok(ShutdownReason::ServerClosed);
                        }
                        Err(e) => break Err(e),
                    },
                    None => break Err(BridgeError::Overlay(OverlayError::Stopped)),
                },
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = state.on_server_frame(frame) {
                            break Err(e);
                        }
                    }
                    None => {
                        info!("Bridge server closed the connection");
                        break Ok(ShutdownReason::ServerClosed);
                    }
                },
                line = next_line(&mut console) => match line {
                    Some(line) => match ConsoleCommand::parse(&line) {
                        ConsoleCommand::Quit => break Ok(ShutdownReason::Console),
                        ConsoleCommand::Help => println!("{CLIENT_HELP}"),
                        ConsoleCommand::Unrecognized(cmd) => println!("Unrecognized command {cmd}"),
                    },
                    None => console = None,
                },
                changed = shutdown.changed(), if watching_signal => match changed {
                    Ok(()) if *shutdown.borrow() => break Ok(ShutdownReason::Signal),
                    Ok(()) => {}
                    Err(_) => watching_signal = false,
                },
            }
        };

        reader.abort();
        drop(events);
        state.close().await;
        let _ = pump.await;
        if let Ok(reason) = &outcome {
            info!(?reason, "Bridge client stopped");
        }
        outcome
    }
}

impl ClientState {
    /// Start the monitor peer on `network`, listening on the federation's global channel.
    fn new(
        network: Arc<dyn OverlayNetwork>,
        transport: TransportConfig,
        writer: OwnedWriteHalf,
    ) -> BridgeResult<Self> {
        let global_channel = format!("{}{}", transport.prefix, GLOBAL_CHANNEL);
        let monitor = network.create_peer(&format!("{}bridge", transport.prefix))?;
        monitor.join(&global_channel)?;
        monitor.start()?;
        Ok(Self {
            network,
            transport,
            monitor,
            writer,
            global_channel,
            channel_counts: HashMap::new(),
            proxies: HashMap::new(),
            proxy_uuids: HashSet::new(),
        })
    }

    /// Handle one event seen by the monitor on the local overlay.
    async fn on_local_event(&mut self, event: OverlayEvent) -> BridgeResult<Option<ShutdownReason>> {
        if self.proxy_uuids.contains(&event.peer()) {
            trace!(tag = event.tag(), peer = %event.peer(), "Ignoring proxy event");
            return Ok(None);
        }

        match event {
            OverlayEvent::Join { group, .. } => {
                let count = self.channel_counts.entry(group.clone()).or_default();
                *count += 1;
                if *count == 1 {
                    self.monitor.join(&group)?;
                    debug!(channel = %group, "Bridging local channel");
                    write_frame(&mut self.writer, &BridgeFrame::Join { channel: group }).await?;
                }
            }
            OverlayEvent::Leave { group, .. } => match self.channel_counts.get_mut(&group) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        // Remote peers may still be listening through a proxy on this channel.
                        if group != self.global_channel && !self.proxies.contains_key(&group) {
                            self.monitor.leave(&group)?;
                        }
                        debug!(channel = %group, "Unbridging local channel");
                        write_frame(&mut self.writer, &BridgeFrame::Leave { channel: group })
                            .await?;
                    }
                }
                _ => warn!(channel = %group, "LEAVE for a channel with no local members"),
            },
            OverlayEvent::Shout {
                name,
                group,
                payload,
                ..
            } => {
                if group == self.global_channel && payload == SHUTDOWN_SENTINEL.as_bytes() {
                    warn!(from = %name, "Federation shutdown seen locally; stopping bridge client");
                    return Ok(Some(ShutdownReason::FederationQuit));
                }
                let payload: Value = match serde_json::from_slice(&payload) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(from = %name, channel = %group, error = %e, "Not relaying non-JSON payload");
                        return Ok(None);
                    }
                };
                trace!(from = %name, channel = %group, "Relaying shout");
                let frame = BridgeFrame::Shout {
                    sender: name,
                    channel: group,
                    payload,
                };
                write_frame(&mut self.writer, &frame).await?;
            }
            _ => {}
        }
        Ok(None)
    }

    /// Handle one frame relayed by the server.
    fn on_server_frame(&mut self, frame: BridgeFrame) -> BridgeResult<()> {
        match frame {
            BridgeFrame::Join { channel } => {
                if self.proxies.contains_key(&channel) {
                    return Ok(());
                }
                let proxy = match Transport::with_address(
                    self.network.as_ref(),
                    &channel,
                    self.transport.clone(),
                ) {
                    Ok(proxy) => proxy,
                    Err(e) => {
                        warn!(%channel, error = %e, "Failed to create bridge proxy");
                        return Ok(());
                    }
                };
                self.monitor.join(&channel)?;
                self.proxy_uuids.insert(proxy.uuid());
                self.proxies.insert(channel.clone(), proxy);
                info!(%channel, "Created bridge proxy");
            }
            BridgeFrame::Leave { channel } => {
                // Other remote segments may still have members; proxies are kept.
                debug!(%channel, "Ignoring remote LEAVE");
            }
            BridgeFrame::Shout {
                sender,
                channel,
                payload,
            } => {
                if self.channel_counts.get(&channel).copied().unwrap_or(0) == 0 {
                    trace!(%channel, "No local members; dropping relayed shout");
                    return Ok(());
                }
                match self.proxies.get(&sender) {
                    Some(proxy) => {
                        if let Err(e) = proxy.send_to_address(&channel, &payload) {
                            warn!(%sender, %channel, error = %e, "Proxy send failed");
                        }
                    }
                    None => warn!(%sender, %channel, "Relayed shout from a sender with no proxy"),
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
        self.monitor.stop();
        let proxies: Vec<(String, Transport)> = self.proxies.drain().collect();
        self.proxy_uuids.clear();
        let closed = tokio::task::spawn_blocking(move || {
            for (channel, proxy) in proxies {
                if let Err(e) = proxy.close() {
                    debug!(%channel, error = %e, "Proxy stopped with error");
                }
            }
        })
        .await;
        if closed.is_err() {
            warn!("Closing bridge proxies panicked");
        }
    }
}

/// Forward monitor events into the async event loop from a blocking thread.
fn spawn_overlay_pump(
    monitor: Arc<dyn Overlay>,
    poll_interval: Duration,
    events: mpsc::Sender<OverlayEvent>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || loop {
        match monitor.recv_timeout(poll_interval) {
            Ok(Some(event)) => {
                if events.blocking_send(event).is_err() {
                    break;
                }
            }
            Ok(None) if events.is_closed() => break,
            Ok(None) => {}
            Err(_) => break,
        }
    })
}
