//! Core types for the agentmesh messaging layer.
//!
//! This crate holds the data structures shared by the transport, the bridge,
//! and the CLI: the top-level error type and the TOML-backed configuration.
//! It contains no networking logic.

pub mod config;
pub mod error;

pub use config::{
    load_config, BridgeConfig, FederationConfig, MeshConfig, Subnet, TrustConfig,
};
pub use error::{MeshError, MeshResult};
