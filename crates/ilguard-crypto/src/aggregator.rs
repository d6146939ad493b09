use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use ilguard_core::SignatureSchemeKind;

use crate::error::AggregationError;
use crate::signature::{AggregateVerification, AggregatedSignature, Signature};

/// Pluggable signature scheme used by the consensus coordinator.
///
/// Implementations are shared across tasks, so the threshold is interior
/// mutable and every method takes `&self`.
pub trait SignatureAggregator: Send + Sync {
    fn scheme(&self) -> SignatureSchemeKind;

    /// Check one signature over `message` against its claimed signer.
    /// Never panics; malformed input yields `false`.
    fn verify(&self, signature: &Signature, message: &[u8]) -> bool;

    /// Combine signatures over a single message. Fails if any input
    /// carries a different message or belongs to another scheme.
    fn aggregate(
        &self,
        signatures: &[Signature],
        message: &[u8],
    ) -> Result<AggregatedSignature, AggregationError>;

    fn verify_aggregated(&self, aggregated: &AggregatedSignature) -> AggregateVerification;

    fn threshold(&self) -> usize;

    fn update_threshold(&self, threshold: usize) -> Result<(), AggregationError>;
}

/// Consensus threshold shared by the aggregators.
#[derive(Debug)]
pub(crate) struct Threshold(AtomicUsize);

impl Threshold {
    pub(crate) fn new(threshold: usize) -> Result<Self, AggregationError> {
        if threshold < 1 {
            return Err(AggregationError::InvalidThreshold(threshold));
        }
        Ok(Threshold(AtomicUsize::new(threshold)))
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, threshold: usize) -> Result<(), AggregationError> {
        if threshold < 1 {
            return Err(AggregationError::InvalidThreshold(threshold));
        }
        self.0.store(threshold, Ordering::SeqCst);
        Ok(())
    }
}

/// Structural checks shared by both schemes, run before any cryptography.
pub(crate) fn check_inputs(
    signatures: &[Signature],
    message: &[u8],
    scheme: SignatureSchemeKind,
) -> Result<(), AggregationError> {
    if signatures.is_empty() {
        return Err(AggregationError::Empty);
    }

    let mut seen = HashSet::with_capacity(signatures.len());
    for signature in signatures {
        let signer = signature.signer();
        if signature.scheme() != scheme {
            return Err(AggregationError::SchemeMismatch {
                signer: signer.clone(),
                expected: scheme,
                found: signature.scheme(),
            });
        }
        if signature.message() != message {
            return Err(AggregationError::MessageMismatch {
                signer: signer.clone(),
            });
        }
        if !seen.insert(signer.clone()) {
            return Err(AggregationError::DuplicateSigner(signer.clone()));
        }
    }
    Ok(())
}

/// Verification of an aggregate produced by the other scheme.
pub(crate) fn foreign_aggregate(aggregated: &AggregatedSignature) -> AggregateVerification {
    AggregateVerification::rejected(aggregated.signers())
}
