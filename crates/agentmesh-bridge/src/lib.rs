//! Bridge between overlay segments.
//!
//! Overlay discovery does not cross network boundaries, so two segments of
//! one federation are joined by a [`BridgeServer`] that every
//! [`BridgeClient`] connects to. Each client watches its local overlay and
//! relays JOIN/LEAVE/SHOUT as length-framed JSON; the server copies each
//! frame to every other client. A [`BridgeEndpoint`] speaks the same frame
//! protocol directly, without an overlay of its own.

pub mod client;
pub mod console;
pub mod endpoint;
pub mod error;
pub mod server;
mod stream;

pub use client::BridgeClient;
pub use console::{stdin_lines, ConsoleCommand};
pub use endpoint::BridgeEndpoint;
pub use error::{BridgeError, BridgeResult};
pub use server::BridgeServer;

/// Why a bridge event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `quit` typed on the console.
    Console,
    /// The shutdown watch was signalled (Ctrl+C in the CLI).
    Signal,
    /// The federation's shutdown sentinel was seen on the local overlay.
    FederationQuit,
    /// The bridge server closed the connection.
    ServerClosed,
    /// No activity within the configured idle timeout.
    IdleTimeout,
}
