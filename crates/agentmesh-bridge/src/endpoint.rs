//! Direct bridge participant.
//!
//! A [`BridgeEndpoint`] connects straight to a [`BridgeServer`](crate::BridgeServer)
//! and speaks the frame protocol itself. Bridge clients on the other side see
//! its initial `["JOIN", name]` and create a local proxy for it, so
//! overlay-side transports can address it by `name`.

use crate::error::{BridgeError, BridgeResult};
use crate::stream::spawn_frame_reader;
use agentmesh_wire::frame::{write_frame, write_raw};
use agentmesh_wire::{BridgeFrame, FrameError};
use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct BridgeEndpoint {
    name: String,
    writer: OwnedWriteHalf,
    frames: mpsc::Receiver<BridgeFrame>,
    reader: JoinHandle<()>,
}

impl BridgeEndpoint {
    /// Connect to the server at `addr` and announce `name` (a full address).
    pub async fn connect(addr: &str, name: &str) -> BridgeResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| BridgeError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();
        let (frames, reader) = spawn_frame_reader(read_half);
        let mut endpoint = Self {
            name: name.to_string(),
            writer,
            frames,
            reader,
        };
        endpoint
            .send_frame(&BridgeFrame::Join {
                channel: name.to_string(),
            })
            .await?;
        info!(%addr, name, "Bridge endpoint connected");
        Ok(endpoint)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send_frame(&mut self, frame: &BridgeFrame) -> BridgeResult<()> {
        write_frame(&mut self.writer, frame).await?;
        Ok(())
    }

    /// Send an already serialized JSON frame body.
    pub async fn send_raw(&mut self, json: &str) -> BridgeResult<()> {
        write_raw(&mut self.writer, json.as_bytes()).await?;
        Ok(())
    }

    /// Broadcast `payload` on `channel` as this endpoint.
    pub async fn shout(&mut self, channel: &str, payload: Value) -> BridgeResult<()> {
        let frame = BridgeFrame::Shout {
            sender: self.name.clone(),
            channel: channel.to_string(),
            payload,
        };
        self.send_frame(&frame).await
    }

    /// Wait for the next frame relayed by the server.
    pub async fn recv(&mut self) -> BridgeResult<BridgeFrame> {
        self.frames
            .recv()
            .await
            .ok_or(BridgeError::Frame(FrameError::ConnectionClosed))
    }

    /// Like [`recv`](Self::recv), but returns `Ok(None)` if nothing arrives within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> BridgeResult<Option<BridgeFrame>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(frame) => frame.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Shut the connection down.
    pub async fn close(mut self) -> BridgeResult<()> {
        self.reader.abort();
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for BridgeEndpoint {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
