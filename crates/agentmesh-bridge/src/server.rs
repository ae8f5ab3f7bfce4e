//! Bridge server — relays frames between connected bridge clients.
//!
//! The server never decodes frame bodies. Each client's byte stream is cut
//! at frame boundaries by a [`FrameSplitter`] and every complete frame is
//! copied verbatim to all *other* clients. Cutting at boundaries keeps two
//! senders' frames from interleaving on a receiver's socket. Scanning the
//! length header does impose the frame limits of [`agentmesh_wire::frame`]:
//! a client whose header is not a decimal length in `1..=MAX_FRAME_SIZE` is
//! disconnected.
//!
//! Every client has its own writer task behind a bounded queue. The relay
//! loop only ever `try_send`s into those queues, so a client that stops
//! reading fills its own queue and is dropped while everyone else keeps
//! receiving.

use crate::console::{next_line, ConsoleCommand};
use crate::error::BridgeResult;
use crate::ShutdownReason;
use agentmesh_types::BridgeConfig;
use agentmesh_wire::FrameSplitter;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SERVER_HELP: &str = "Valid commands are quit and help.";

/// Capacity of the channel carrying frames from reader tasks to the relay loop.
const EVENT_QUEUE: usize = 1024;

type ClientId = u64;
type Frame = Arc<Vec<u8>>;

enum ClientEvent {
    Frame(ClientId, Frame),
    Closed(ClientId),
}

struct Client {
    peer: SocketAddr,
    queue: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// A listening bridge server.
pub struct BridgeServer {
    listener: TcpListener,
    idle_timeout: Option<Duration>,
    block_size: usize,
    queue_frames: usize,
}

impl BridgeServer {
    /// Bind to `config.host:config.port`. Port 0 picks a free port.
    pub async fn bind(config: &BridgeConfig) -> BridgeResult<Self> {
        let listener = TcpListener::bind(config.address()).await?;
        info!(addr = %listener.local_addr()?, "Bridge server listening");
        Ok(Self {
            listener,
            idle_timeout: config.idle_timeout(),
            block_size: config.read_block_size.max(1),
            queue_frames: config.send_queue_frames.max(1),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Relay until the console says `quit`, `shutdown` fires, or the idle timeout elapses.
    pub async fn run(
        self,
        mut console: Option<mpsc::Receiver<String>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BridgeResult<ShutdownReason> {
        let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE);
        let mut clients: HashMap<ClientId, Client> = HashMap::new();
        let mut next_id: ClientId = 0;
        let mut watching_signal = true;

        let reason = loop {
            let idle = async {
                match self.idle_timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            next_id += 1;
                            info!(client = next_id, %peer, "Client connected");
                            let client = self.spawn_client(next_id, stream, peer, events_tx.clone());
                            clients.insert(next_id, client);
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                Some(event) = events.recv() => match event {
                    ClientEvent::Frame(from, frame) => {
                        for id in relay(&clients, from, &frame) {
                            disconnect(&mut clients, id);
                        }
                    }
                    ClientEvent::Closed(id) => disconnect(&mut clients, id),
                },
                line = next_line(&mut console) => match line {
                    Some(line) => match ConsoleCommand::parse(&line) {
                        ConsoleCommand::Quit => break ShutdownReason::Console,
                        ConsoleCommand::Help => println!("\n{SERVER_HELP}\n"),
                        ConsoleCommand::Unrecognized(cmd) => {
                            warn!(command = %cmd, "Unknown command on console");
                        }
                    },
                    None => console = None,
                },
                changed = shutdown.changed(), if watching_signal => match changed {
                    Ok(()) if *shutdown.borrow() => break ShutdownReason::Signal,
                    Ok(()) => {}
                    Err(_) => watching_signal = false,
                },
                _ = idle => {
                    warn!("Server timed out");
                    break ShutdownReason::IdleTimeout;
                }
            }
        };

        for id in clients.keys().copied().collect::<Vec<_>>() {
            disconnect(&mut clients, id);
        }
        info!(?reason, "Server quitting");
        Ok(reason)
    }

    fn spawn_client(
        &self,
        id: ClientId,
        stream: TcpStream,
        peer: SocketAddr,
        events: mpsc::Sender<ClientEvent>,
    ) -> Client {
        let (read_half, write_half) = stream.into_split();
        let (queue, pending) = mpsc::channel(self.queue_frames);
        let reader = tokio::spawn(read_client(id, read_half, self.block_size, events.clone()));
        let writer = tokio::spawn(write_client(id, write_half, pending, events));
        Client {
            peer,
            queue,
            reader,
            writer,
        }
    }
}

/// Cut one client's stream into frames and hand them to the relay loop.
async fn read_client(
    id: ClientId,
    mut read_half: OwnedReadHalf,
    block_size: usize,
    events: mpsc::Sender<ClientEvent>,
) {
    let mut buf = vec![0u8; block_size];
    let mut splitter = FrameSplitter::new();
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(client = id, error = %e, "Read failed");
                break;
            }
        };
        splitter.push(&buf[..n]);
        loop {
            match splitter.next_frame() {
                Ok(Some(frame)) => {
                    if events.send(ClientEvent::Frame(id, Arc::new(frame))).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(client = id, error = %e, "Dropping client with corrupt stream");
                    let _ = events.send(ClientEvent::Closed(id)).await;
                    return;
                }
            }
        }
    }
    let _ = events.send(ClientEvent::Closed(id)).await;
}

/// Drain one client's queue onto its socket.
async fn write_client(
    id: ClientId,
    mut write_half: OwnedWriteHalf,
    mut pending: mpsc::Receiver<Frame>,
    events: mpsc::Sender<ClientEvent>,
) {
    while let Some(frame) = pending.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            debug!(client = id, error = %e, "Write failed");
            let _ = events.send(ClientEvent::Closed(id)).await;
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Queue `frame` for every client except `from`; returns the clients that must be dropped.
fn relay(clients: &HashMap<ClientId, Client>, from: ClientId, frame: &Frame) -> Vec<ClientId> {
    let mut failed = Vec::new();
    for (id, client) in clients {
        if *id == from {
            continue;
        }
        debug!(from, to = *id, bytes = frame.len(), "Forwarding frame");
        match client.queue.try_send(Arc::clone(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(client = *id, peer = %client.peer, "Client is not keeping up; dropping it");
                failed.push(*id);
            }
            Err(TrySendError::Closed(_)) => failed.push(*id),
        }
    }
    failed
}

/// Forget a client. Both of its tasks are aborted, which closes the socket.
fn disconnect(clients: &mut HashMap<ClientId, Client>, id: ClientId) {
    if let Some(client) = clients.remove(&id) {
        info!(client = id, peer = %client.peer, "Client disconnected");
        client.reader.abort();
        client.writer.abort();
    }
}
