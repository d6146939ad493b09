use ilguard_core::{OperatorId, SignatureSchemeKind};
use thiserror::Error;

/// Key handling and signing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(OperatorId),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("No signatures to aggregate")]
    Empty,

    #[error("Signature from {signer} does not match the aggregated message")]
    MessageMismatch { signer: OperatorId },

    #[error("Signature from {signer} uses {found:?}, expected {expected:?}")]
    SchemeMismatch {
        signer: OperatorId,
        expected: SignatureSchemeKind,
        found: SignatureSchemeKind,
    },

    #[error("Duplicate signature from {0}")]
    DuplicateSigner(OperatorId),

    #[error("Invalid threshold {0}: must be >= 1")]
    InvalidThreshold(usize),

    #[error("No valid signatures left to aggregate")]
    NoValidSignatures,

    #[error("Crypto error: {0}")]
    Crypto(String),
}
