//! Overlay contract — the peer-discovery and group-messaging primitive.
//!
//! A [`Transport`](crate::Transport) never talks to the network directly. It
//! holds one [`Overlay`] handle, joins groups on it, shouts JSON bytes into
//! groups, and reads [`OverlayEvent`]s describing what remote peers did.
//! [`OverlayNetwork`] mints new handles, which is how both transports and
//! bridge proxies obtain their peer identity.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by an overlay implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OverlayError {
    #[error("Overlay peer has been stopped")]
    Stopped,
    #[error("Overlay peer has not been started")]
    NotStarted,
    #[error("Unknown overlay peer: {0}")]
    UnknownPeer(Uuid),
    #[error("Overlay backend error: {0}")]
    Backend(String),
}

/// A notification about a remote peer, as delivered by the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// A peer appeared; `url` is its endpoint, e.g. `tcp://10.0.0.5:49152`.
    Enter { peer: Uuid, name: String, url: String },
    /// A peer joined a group.
    Join { peer: Uuid, name: String, group: String },
    /// A peer left a group.
    Leave { peer: Uuid, name: String, group: String },
    /// A peer broadcast `payload` to a group we are a member of.
    Shout {
        peer: Uuid,
        name: String,
        group: String,
        payload: Vec<u8>,
    },
    /// A peer sent `payload` directly to us.
    Whisper {
        peer: Uuid,
        name: String,
        payload: Vec<u8>,
    },
    /// A peer went away.
    Exit { peer: Uuid, name: String },
    /// Any event kind outside the set above.
    Unknown { tag: String, peer: Uuid, name: String },
}

impl OverlayEvent {
    /// The wire tag of this event (`ENTER`, `SHOUT`, ...).
    pub fn tag(&self) -> &str {
        match self {
            Self::Enter { .. } => "ENTER",
            Self::Join { .. } => "JOIN",
            Self::Leave { .. } => "LEAVE",
            Self::Shout { .. } => "SHOUT",
            Self::Whisper { .. } => "WHISPER",
            Self::Exit { .. } => "EXIT",
            Self::Unknown { tag, .. } => tag,
        }
    }

    /// UUID of the peer that caused the event.
    pub fn peer(&self) -> Uuid {
        match self {
            Self::Enter { peer, .. }
            | Self::Join { peer, .. }
            | Self::Leave { peer, .. }
            | Self::Shout { peer, .. }
            | Self::Whisper { peer, .. }
            | Self::Exit { peer, .. }
            | Self::Unknown { peer, .. } => *peer,
        }
    }

    /// Name the causing peer announced itself with.
    pub fn name(&self) -> &str {
        match self {
            Self::Enter { name, .. }
            | Self::Join { name, .. }
            | Self::Leave { name, .. }
            | Self::Shout { name, .. }
            | Self::Whisper { name, .. }
            | Self::Exit { name, .. }
            | Self::Unknown { name, .. } => name,
        }
    }
}

/// One peer identity on the overlay.
///
/// Groups may be joined before [`start`](Overlay::start); they are announced
/// to other peers once the handle starts. All methods take `&self` so a
/// handle can be shared between a sending thread and a dispatch thread.
pub trait Overlay: Send + Sync {
    /// This peer's UUID.
    fn uuid(&self) -> Uuid;

    /// This peer's announced name.
    fn name(&self) -> &str;

    /// Announce this peer to the overlay.
    fn start(&self) -> Result<(), OverlayError>;

    /// Leave the overlay. Idempotent.
    fn stop(&self);

    /// Whether the peer is announced and not yet stopped.
    fn is_started(&self) -> bool;

    /// Become a member of `group`. Joining twice is a no-op.
    fn join(&self, group: &str) -> Result<(), OverlayError>;

    /// Stop being a member of `group`. Leaving a group we are not in is a no-op.
    fn leave(&self, group: &str) -> Result<(), OverlayError>;

    /// Broadcast to every other member of `group`.
    fn shout(&self, group: &str, payload: &[u8]) -> Result<(), OverlayError>;

    /// Send directly to a single peer.
    fn whisper(&self, peer: Uuid, payload: &[u8]) -> Result<(), OverlayError>;

    /// Wait at most `timeout` for the next event.
    ///
    /// Returns `Ok(None)` on timeout and [`OverlayError::Stopped`] once the
    /// handle has been stopped.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<OverlayEvent>, OverlayError>;
}

/// Factory for overlay handles.
pub trait OverlayNetwork: Send + Sync {
    /// Create a new, not yet started peer announcing itself as `name`.
    fn create_peer(&self, name: &str) -> Result<Arc<dyn Overlay>, OverlayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let peer = Uuid::new_v4();
        let event = OverlayEvent::Shout {
            peer,
            name: "worker1".to_string(),
            group: "boss".to_string(),
            payload: b"\"ready\"".to_vec(),
        };
        assert_eq!(event.tag(), "SHOUT");
        assert_eq!(event.peer(), peer);
        assert_eq!(event.name(), "worker1");

        let unknown = OverlayEvent::Unknown {
            tag: "EVASIVE".to_string(),
            peer,
            name: "x".to_string(),
        };
        assert_eq!(unknown.tag(), "EVASIVE");
    }
}
