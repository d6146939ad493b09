use ilguard_core::{OperatorId, SignatureSchemeKind};
use serde::{Deserialize, Serialize};

/// Ethereum-style recoverable secp256k1 signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaSignature {
    /// Claimed signer address.
    pub signer: OperatorId,
    #[serde(with = "hex::serde")]
    pub r: [u8; 32],
    #[serde(with = "hex::serde")]
    pub s: [u8; 32],
    /// Recovery id, 27/28 (or raw 0/1).
    pub v: u8,
    /// Message the operator claims to have signed.
    #[serde(with = "hex::serde")]
    pub message: Vec<u8>,
}

/// BLS12-381 signature in G2 (96 bytes compressed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlsSignature {
    pub signer: OperatorId,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub message: Vec<u8>,
}

/// One operator's endorsement of a canonical attestation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum Signature {
    Ecdsa(EcdsaSignature),
    Bls(BlsSignature),
}

impl Signature {
    pub fn signer(&self) -> &OperatorId {
        match self {
            Signature::Ecdsa(sig) => &sig.signer,
            Signature::Bls(sig) => &sig.signer,
        }
    }

    pub fn message(&self) -> &[u8] {
        match self {
            Signature::Ecdsa(sig) => &sig.message,
            Signature::Bls(sig) => &sig.message,
        }
    }

    pub fn scheme(&self) -> SignatureSchemeKind {
        match self {
            Signature::Ecdsa(_) => SignatureSchemeKind::Ecdsa,
            Signature::Bls(_) => SignatureSchemeKind::Bls,
        }
    }
}

/// Canonical bundle of ECDSA signatures, sorted by signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcdsaAggregate {
    #[serde(with = "hex::serde")]
    pub message: Vec<u8>,
    /// Keccak-256 over the message hash, threshold and every sorted signature.
    #[serde(with = "hex::serde")]
    pub digest: [u8; 32],
    pub signatures: Vec<EcdsaSignature>,
    pub threshold: usize,
}

/// Point-aggregated BLS signature and public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlsAggregate {
    #[serde(with = "hex::serde")]
    pub message: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
    /// Operators whose signatures are inside the aggregate, ascending.
    pub signers: Vec<OperatorId>,
    /// Operators whose signatures failed verification and were left out.
    pub rejected: Vec<OperatorId>,
    pub threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AggregatedSignature {
    Ecdsa(EcdsaAggregate),
    Bls(BlsAggregate),
}

impl AggregatedSignature {
    pub fn scheme(&self) -> SignatureSchemeKind {
        match self {
            AggregatedSignature::Ecdsa(_) => SignatureSchemeKind::Ecdsa,
            AggregatedSignature::Bls(_) => SignatureSchemeKind::Bls,
        }
    }

    /// Operators represented in the aggregate, ascending.
    pub fn signers(&self) -> Vec<OperatorId> {
        match self {
            AggregatedSignature::Ecdsa(agg) => {
                agg.signatures.iter().map(|s| s.signer.clone()).collect()
            }
            AggregatedSignature::Bls(agg) => agg.signers.clone(),
        }
    }

    pub fn message(&self) -> &[u8] {
        match self {
            AggregatedSignature::Ecdsa(agg) => &agg.message,
            AggregatedSignature::Bls(agg) => &agg.message,
        }
    }

    pub fn threshold(&self) -> usize {
        match self {
            AggregatedSignature::Ecdsa(agg) => agg.threshold,
            AggregatedSignature::Bls(agg) => agg.threshold,
        }
    }
}

/// Outcome of checking an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateVerification {
    pub valid_count: usize,
    pub invalid_signers: Vec<OperatorId>,
    pub consensus_reached: bool,
}

impl AggregateVerification {
    pub fn rejected(invalid_signers: Vec<OperatorId>) -> Self {
        AggregateVerification {
            valid_count: 0,
            invalid_signers,
            consensus_reached: false,
        }
    }
}
