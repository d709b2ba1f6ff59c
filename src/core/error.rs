//! Error types for regent.
//!
//! Every variant is a recoverable, caller-visible outcome. Byzantine detection
//! and tenure limits are reported as events, not through this type, except
//! where a caller explicitly asks for a round to be asserted consistent.

use crate::core::Hash256;
use thiserror::Error;

/// Result type alias for regent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in regent operations.
#[derive(Error, Debug)]
pub enum Error {
    // Approval workflow errors
    #[error("Request not found: {0}")]
    NotFound(String),

    #[error("Identity {0} is not an eligible approver")]
    Unauthorized(String),

    #[error("Approver {0} already recorded a decision")]
    AlreadyActed(String),

    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    #[error("Request {0} expired or already closed")]
    Expired(String),

    #[error("Request {0} already finalized")]
    TooLate(String),

    #[error("No policy for operation kind: {0}")]
    PolicyNotFound(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Availability window still open for request {0}")]
    WindowOpen(String),

    // Replica verification errors
    #[error("Quorum failed at index {index}: best agreement {best}/{required} of {queried} queried")]
    QuorumFailed {
        index: u64,
        best: usize,
        required: usize,
        queried: usize,
    },

    #[error("Timed out at index {index}: {responded}/{queried} replicas responded")]
    Timeout {
        index: u64,
        responded: usize,
        queried: usize,
    },

    #[error("Byzantine leader {leader} suspected at term {term}, index {index}")]
    ByzantineSuspected {
        leader: String,
        term: u64,
        index: u64,
        divergent: Vec<(String, Hash256)>,
    },

    // Cryptography errors
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code for RPC and CLI surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::AlreadyActed(_) => "already_acted",
            Error::InvalidProof(_) => "invalid_proof",
            Error::Expired(_) => "expired",
            Error::TooLate(_) => "too_late",
            Error::PolicyNotFound(_) => "policy_not_found",
            Error::InvalidPolicy(_) => "invalid_policy",
            Error::InvalidOperation(_) => "invalid_operation",
            Error::WindowOpen(_) => "window_open",
            Error::QuorumFailed { .. } => "quorum_failed",
            Error::Timeout { .. } => "timeout",
            Error::ByzantineSuspected { .. } => "byzantine_suspected",
            Error::SignatureVerificationFailed => "signature_verification_failed",
            Error::InvalidKeyFormat(_) => "invalid_key_format",
            Error::Config(_) => "config",
            Error::SerializationError(_) => "serialization",
            Error::DeserializationError(_) => "deserialization",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::DeserializationError(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::SignatureVerificationFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NotFound("r".into()).code(), "not_found");
        assert_eq!(Error::TooLate("r".into()).code(), "too_late");
        let err = Error::Timeout {
            index: 7,
            responded: 1,
            queried: 5,
        };
        assert_eq!(err.code(), "timeout");
        assert!(err.to_string().contains("1/5"));
    }

    #[test]
    fn test_from_json_error() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), "serialization");
    }
}
