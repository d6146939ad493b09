// Canonical attestation message.
//
// Every operator must derive byte-identical messages from the same request,
// otherwise honest signatures are rejected as mismatches. The layout is fixed:
//
//   domain tag || policy_id (u64 BE) || payout (u128 BE) || timestamp (u64 BE)
//             || proof length (u64 BE) || proof bytes

use sha3::{Digest, Keccak256};

use crate::types::AttestationRequest;

/// Domain separation tag prefixed to every attestation message.
pub const ATTESTATION_DOMAIN: &[u8] = b"ILGUARD:ATTESTATION:v1\0";

pub fn canonical_message(request: &AttestationRequest) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(ATTESTATION_DOMAIN.len() + 8 + 16 + 8 + 8 + request.proof.len());
    message.extend_from_slice(ATTESTATION_DOMAIN);
    message.extend_from_slice(&request.policy_id.0.to_be_bytes());
    message.extend_from_slice(&request.payout.to_be_bytes());
    message.extend_from_slice(&request.timestamp.to_be_bytes());
    message.extend_from_slice(&(request.proof.len() as u64).to_be_bytes());
    message.extend_from_slice(&request.proof);
    message
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}
