//! agentmesh wire layer — federated pub/sub between agents.
//!
//! Agents discover each other through a peer-discovery overlay and exchange
//! JSON payloads on named channels. Bridges relay channel presence and
//! broadcast traffic between otherwise separate overlays.
//!
//! ## Architecture
//!
//! - **Overlay**: the group-messaging primitive a [`Transport`] sits on
//!   (join/leave/shout/whisper plus peer lifecycle events)
//! - **MemoryNetwork**: an in-process overlay implementation
//! - **Transport**: named-channel pub/sub with federation prefixes, a
//!   dispatch thread, synchronous `get`, and federation-wide shutdown
//! - **PeerRegistry**: peers admitted by a validated ENTER
//! - **BridgeFrame**: length-framed JSON records relayed between bridges

pub mod frame;
pub mod memory;
pub mod overlay;
pub mod registry;
pub mod transport;
pub mod trust;

pub use frame::{BridgeFrame, FrameError, FrameSplitter, MAX_FRAME_SIZE};
pub use memory::{MemoryNetwork, MemoryPeer};
pub use overlay::{Overlay, OverlayError, OverlayEvent, OverlayNetwork};
pub use registry::{PeerEntry, PeerRegistry};
pub use transport::{
    Envelope, ErrorPolicy, Transport, TransportConfig, TransportError, GLOBAL_CHANNEL,
    SHUTDOWN_SENTINEL,
};
pub use trust::{endpoint_ip, is_trusted_ip};
