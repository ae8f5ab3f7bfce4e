//! Shared error types for agentmesh.

use thiserror::Error;

/// Top-level error type for agentmesh.
#[derive(Error, Debug)]
pub enum MeshError {
    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A subnet entry in the trust allow-list could not be parsed.
    #[error("Invalid subnet '{0}': expected <ip>/<prefix-len>")]
    InvalidSubnet(String),
}

/// Alias for Result with MeshError.
pub type MeshResult<T> = Result<T, MeshError>;
