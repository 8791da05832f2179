//! Structured error types for the coordination core.
//!
//! Failures never cross the agent boundary at runtime (the protocol prefers
//! liveness and logs instead); these types surface setup-time problems such
//! as a socket that cannot be bound.

use thiserror::Error;

use crate::codec::CodecError;
use crate::controller::ControllerError;
use crate::solver::SolverError;
use crate::types::PacketError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),

    #[error("failed to bind `{endpoint}`: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport already started")]
    AlreadyStarted,
}

/// Top-level error for embedders driving agents directly.
#[derive(Debug, Error)]
pub enum GridError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Solver(#[from] SolverError),
}
