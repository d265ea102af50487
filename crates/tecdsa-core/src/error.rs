//! Error types for threshold ECDSA sessions

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while wiring or running a session
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid group or protocol configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Identity is not a member of the session group
    #[error("Invalid member: {0}")]
    InvalidMember(String),

    /// Bridge or provider wiring failed before any protocol traffic
    #[error("Failed to initialize session: {0}")]
    Initialization(String),

    /// The engine rejected starting the protocol
    #[error("Failed to start protocol: {0}")]
    Start(String),

    /// A protocol message could not reach its recipients
    #[error("Failed to deliver message: {0}")]
    Delivery(String),

    /// The engine reported a computation failure
    #[error("Protocol failure: {0}")]
    Protocol(String),

    /// Timeout waiting for protocol messages
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// sign() was already called on this session
    #[error("Signing already executed")]
    AlreadySigned,

    /// The session was torn down before producing a result
    #[error("Session aborted")]
    Aborted,

    /// Share or commitment verification failed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Signature failed verification
    #[error("Invalid signature")]
    InvalidSignature,

    /// Chain handle rejected a call
    #[error("Chain error: {0}")]
    Chain(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
