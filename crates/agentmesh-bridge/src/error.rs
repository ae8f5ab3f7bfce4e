use agentmesh_wire::{FrameError, OverlayError, TransportError};
use thiserror::Error;

/// Errors from bridge clients, servers and endpoints.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection to bridge server at {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Whether the error means the socket to the bridge server is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Frame(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_classification() {
        let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(BridgeError::Io(broken).is_connection_loss());
        assert!(BridgeError::Frame(FrameError::ConnectionClosed).is_connection_loss());
        assert!(!BridgeError::Overlay(OverlayError::Stopped).is_connection_loss());
    }
}
