use agentmesh_wire::frame::{decode_frame, read_frame_body};
use agentmesh_wire::{BridgeFrame, FrameError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read frames off `reader` on a background task.
///
/// Undecodable bodies are logged and skipped. The channel closes when the
/// peer disconnects or the length header is corrupt, since framing cannot
/// be recovered after that.
pub(crate) fn spawn_frame_reader(
    mut reader: OwnedReadHalf,
) -> (mpsc::Receiver<BridgeFrame>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        loop {
            let body = match read_frame_body(&mut reader).await {
                Ok(body) => body,
                Err(FrameError::ConnectionClosed) => {
                    debug!("Bridge connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Bridge stream failed");
                    break;
                }
            };
            match decode_frame(&body) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed frame"),
            }
        }
    });
    (rx, task)
}
