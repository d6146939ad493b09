// ECDSA over secp256k1 with Ethereum personal-message hashing.
//
// Operators sign keccak256("\x19Ethereum Signed Message:\n32" || keccak256(m))
// where m is the canonical attestation message. The signer is recovered from
// (r, s, v) and compared to the claimed address.

use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use tracing::{debug, warn};

use ilguard_core::{keccak256, AttestationRequest, OperatorId, SignatureSchemeKind};

use crate::aggregator::{check_inputs, foreign_aggregate, SignatureAggregator, Threshold};
use crate::error::{AggregationError, CryptoError};
use crate::signature::{
    AggregateVerification, AggregatedSignature, EcdsaAggregate, EcdsaSignature, Signature,
};

const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Digest actually signed for `message`.
pub fn signing_digest(message: &[u8]) -> [u8; 32] {
    let inner = keccak256(message);
    let mut prefixed = Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + inner.len());
    prefixed.extend_from_slice(PERSONAL_MESSAGE_PREFIX);
    prefixed.extend_from_slice(&inner);
    keccak256(&prefixed)
}

/// Ethereum address of a public key: last 20 bytes of keccak256 over the
/// uncompressed point without its 0x04 tag.
pub fn address_of(key: &VerifyingKey) -> OperatorId {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    OperatorId::new(format!("0x{}", hex::encode(&hash[12..])))
}

/// Recover the address that produced `signature` over `message`.
pub fn recover_signer(signature: &EcdsaSignature, message: &[u8]) -> Result<OperatorId, CryptoError> {
    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(&signature.r);
    rs[32..].copy_from_slice(&signature.s);
    let sig = K256Signature::from_slice(&rs)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    let v = match signature.v {
        0 | 1 => signature.v,
        27 | 28 => signature.v - 27,
        other => {
            return Err(CryptoError::InvalidSignature(format!(
                "unsupported recovery id {}",
                other
            )))
        }
    };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| CryptoError::InvalidSignature(format!("bad recovery id {}", v)))?;

    let digest = signing_digest(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    Ok(address_of(&key))
}

/// secp256k1 key held by an operator node.
pub struct EcdsaOperatorKey {
    signing_key: SigningKey,
    address: OperatorId,
}

impl EcdsaOperatorKey {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_slice(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of(signing_key.verifying_key());
        EcdsaOperatorKey {
            signing_key,
            address,
        }
    }

    pub fn operator_id(&self) -> &OperatorId {
        &self.address
    }

    pub fn sign_message(&self, message: &[u8]) -> Result<EcdsaSignature, CryptoError> {
        let digest = signing_digest(message);
        let (sig, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

        let bytes = sig.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);

        Ok(EcdsaSignature {
            signer: self.address.clone(),
            r,
            s,
            v: recovery_id.to_byte() + 27,
            message: message.to_vec(),
        })
    }

    /// Sign the canonical message of an attestation request.
    pub fn sign_request(&self, request: &AttestationRequest) -> Result<Signature, CryptoError> {
        self.sign_message(&request.canonical_message())
            .map(Signature::Ecdsa)
    }
}

impl std::fmt::Debug for EcdsaOperatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaOperatorKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Keccak-256 over the message hash and threshold, followed by each signer,
/// r, s and v in signer order.
fn bundle_digest(message: &[u8], threshold: usize, signatures: &[EcdsaSignature]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(40 + signatures.len() * 107);
    buf.extend_from_slice(&keccak256(message));
    buf.extend_from_slice(&(threshold as u64).to_be_bytes());
    for sig in signatures {
        buf.extend_from_slice(sig.signer.as_str().as_bytes());
        buf.extend_from_slice(&sig.r);
        buf.extend_from_slice(&sig.s);
        buf.push(sig.v);
    }
    keccak256(&buf)
}

/// ECDSA aggregation. secp256k1 signatures cannot be point-aggregated, so
/// the aggregate is a canonical bundle of the individual signatures.
#[derive(Debug)]
pub struct EcdsaAggregator {
    threshold: Threshold,
}

impl EcdsaAggregator {
    pub fn new(threshold: usize) -> Result<Self, AggregationError> {
        Ok(EcdsaAggregator {
            threshold: Threshold::new(threshold)?,
        })
    }

    fn verify_ecdsa(&self, signature: &EcdsaSignature, message: &[u8]) -> bool {
        if signature.message != message {
            return false;
        }
        match recover_signer(signature, message) {
            Ok(recovered) => signature.signer.matches(recovered.as_str()),
            Err(e) => {
                debug!(signer = %signature.signer, error = %e, "ECDSA recovery failed");
                false
            }
        }
    }
}

impl SignatureAggregator for EcdsaAggregator {
    fn scheme(&self) -> SignatureSchemeKind {
        SignatureSchemeKind::Ecdsa
    }

    fn verify(&self, signature: &Signature, message: &[u8]) -> bool {
        match signature {
            Signature::Ecdsa(sig) => self.verify_ecdsa(sig, message),
            Signature::Bls(_) => false,
        }
    }

    fn aggregate(
        &self,
        signatures: &[Signature],
        message: &[u8],
    ) -> Result<AggregatedSignature, AggregationError> {
        check_inputs(signatures, message, SignatureSchemeKind::Ecdsa)?;

        let mut bundle: Vec<EcdsaSignature> = signatures
            .iter()
            .filter_map(|sig| match sig {
                Signature::Ecdsa(sig) => Some(sig.clone()),
                Signature::Bls(_) => None,
            })
            .collect();
        bundle.sort_by(|a, b| a.signer.cmp(&b.signer));

        let threshold = self.threshold.get();
        let digest = bundle_digest(message, threshold, &bundle);
        debug!(signatures = bundle.len(), digest = %hex::encode(digest), "ECDSA bundle built");

        Ok(AggregatedSignature::Ecdsa(EcdsaAggregate {
            message: message.to_vec(),
            digest,
            signatures: bundle,
            threshold,
        }))
    }

    fn verify_aggregated(&self, aggregated: &AggregatedSignature) -> AggregateVerification {
        let agg = match aggregated {
            AggregatedSignature::Ecdsa(agg) => agg,
            other => return foreign_aggregate(other),
        };

        if agg.signatures.is_empty() {
            warn!("Empty ECDSA bundle");
            return AggregateVerification::rejected(Vec::new());
        }
        // Sorted by signer with no repeats.
        if agg
            .signatures
            .windows(2)
            .any(|pair| pair[0].signer >= pair[1].signer)
        {
            warn!("ECDSA bundle is not in canonical signer order");
            return AggregateVerification::rejected(aggregated.signers());
        }
        if bundle_digest(&agg.message, agg.threshold, &agg.signatures) != agg.digest {
            warn!("ECDSA bundle digest mismatch");
            return AggregateVerification::rejected(aggregated.signers());
        }

        let mut valid_count = 0;
        let mut invalid_signers = Vec::new();
        for sig in &agg.signatures {
            if self.verify_ecdsa(sig, &agg.message) {
                valid_count += 1;
            } else {
                invalid_signers.push(sig.signer.clone());
            }
        }

        let consensus_reached = invalid_signers.is_empty() && valid_count >= self.threshold.get();
        AggregateVerification {
            valid_count,
            invalid_signers,
            consensus_reached,
        }
    }

    fn threshold(&self) -> usize {
        self.threshold.get()
    }

    fn update_threshold(&self, threshold: usize) -> Result<(), AggregationError> {
        self.threshold.set(threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilguard_core::PolicyId;
    use proptest::prelude::*;

    fn request() -> AttestationRequest {
        AttestationRequest::new("req-1", PolicyId(7), vec![1, 2, 3], 1_000, 1_700_000_000)
    }

    #[test]
    fn test_sign_and_verify() {
        let key = EcdsaOperatorKey::generate();
        let aggregator = EcdsaAggregator::new(1).unwrap();
        let request = request();
        let sig = key.sign_request(&request).unwrap();

        assert!(aggregator.verify(&sig, &request.canonical_message()));
        assert!(!aggregator.verify(&sig, b"something else"));
    }

    #[test]
    fn test_address_format() {
        let key = EcdsaOperatorKey::generate();
        let address = key.operator_id().as_str();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert_eq!(address, address.to_lowercase());
    }

    #[test]
    fn test_known_key_address() {
        // Private key 1 maps to the well-known generator address.
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let key = EcdsaOperatorKey::from_bytes(&secret).unwrap();
        assert_eq!(
            key.operator_id().as_str(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_wrong_claimed_signer_fails() {
        let key = EcdsaOperatorKey::generate();
        let other = EcdsaOperatorKey::generate();
        let aggregator = EcdsaAggregator::new(1).unwrap();
        let message = request().canonical_message();

        let mut sig = key.sign_message(&message).unwrap();
        sig.signer = other.operator_id().clone();
        assert!(!aggregator.verify(&Signature::Ecdsa(sig), &message));
    }

    #[test]
    fn test_raw_recovery_id_accepted() {
        let key = EcdsaOperatorKey::generate();
        let message = request().canonical_message();
        let mut sig = key.sign_message(&message).unwrap();
        sig.v -= 27;
        assert_eq!(recover_signer(&sig, &message).unwrap(), *key.operator_id());
    }

    #[test]
    fn test_malformed_signature_is_false() {
        let aggregator = EcdsaAggregator::new(1).unwrap();
        let sig = Signature::Ecdsa(EcdsaSignature {
            signer: "0xabc".into(),
            r: [0u8; 32],
            s: [0u8; 32],
            v: 99,
            message: b"m".to_vec(),
        });
        assert!(!aggregator.verify(&sig, b"m"));
    }

    #[test]
    fn test_aggregate_and_verify() {
        let keys: Vec<_> = (0..3).map(|_| EcdsaOperatorKey::generate()).collect();
        let aggregator = EcdsaAggregator::new(2).unwrap();
        let request = request();
        let message = request.canonical_message();
        let sigs: Vec<_> = keys.iter().map(|k| k.sign_request(&request).unwrap()).collect();

        let aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        let signers = aggregated.signers();
        let mut sorted = signers.clone();
        sorted.sort();
        assert_eq!(signers, sorted);

        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 3);
        assert!(result.invalid_signers.is_empty());
        assert!(result.consensus_reached);
    }

    #[test]
    fn test_aggregate_attributes_invalid_signer() {
        let good = EcdsaOperatorKey::generate();
        let bad = EcdsaOperatorKey::generate();
        let aggregator = EcdsaAggregator::new(1).unwrap();
        let message = request().canonical_message();

        let mut forged = bad.sign_message(&message).unwrap();
        forged.s[0] ^= 0x01;
        let sigs = vec![
            Signature::Ecdsa(good.sign_message(&message).unwrap()),
            Signature::Ecdsa(forged),
        ];

        let aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 1);
        assert_eq!(result.invalid_signers, vec![bad.operator_id().clone()]);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_tampered_bundle_rejected() {
        let key = EcdsaOperatorKey::generate();
        let aggregator = EcdsaAggregator::new(1).unwrap();
        let message = request().canonical_message();
        let sigs = vec![Signature::Ecdsa(key.sign_message(&message).unwrap())];

        let mut aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        if let AggregatedSignature::Ecdsa(agg) = &mut aggregated {
            agg.digest[0] ^= 0xff;
        }
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 0);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_embedded_threshold_does_not_lower_consensus() {
        let key = EcdsaOperatorKey::generate();
        let aggregator = EcdsaAggregator::new(3).unwrap();
        let message = request().canonical_message();
        let sigs = vec![Signature::Ecdsa(key.sign_message(&message).unwrap())];

        let mut aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        assert!(!aggregator.verify_aggregated(&aggregated).consensus_reached);

        // Rewriting the threshold and re-deriving the digest still falls
        // short of the aggregator's own threshold.
        if let AggregatedSignature::Ecdsa(agg) = &mut aggregated {
            agg.threshold = 1;
            agg.digest = bundle_digest(&agg.message, 1, &agg.signatures);
        }
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 1);
        assert!(!result.consensus_reached);

        // Rewriting only the threshold breaks the digest.
        if let AggregatedSignature::Ecdsa(agg) = &mut aggregated {
            agg.threshold = 0;
        }
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 0);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_empty_bundle_rejected() {
        let aggregator = EcdsaAggregator::new(1).unwrap();
        let message = request().canonical_message();
        let aggregated = AggregatedSignature::Ecdsa(EcdsaAggregate {
            digest: bundle_digest(&message, 0, &[]),
            message,
            signatures: Vec::new(),
            threshold: 0,
        });
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 0);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_repeated_signer_rejected() {
        let key = EcdsaOperatorKey::generate();
        let aggregator = EcdsaAggregator::new(2).unwrap();
        let message = request().canonical_message();
        let sig = key.sign_message(&message).unwrap();
        let signatures = vec![sig.clone(), sig];
        let aggregated = AggregatedSignature::Ecdsa(EcdsaAggregate {
            digest: bundle_digest(&message, 2, &signatures),
            message,
            signatures,
            threshold: 2,
        });
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 0);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_aggregate_message_mismatch() {
        let key = EcdsaOperatorKey::generate();
        let aggregator = EcdsaAggregator::new(1).unwrap();
        let sigs = vec![Signature::Ecdsa(key.sign_message(b"first").unwrap())];
        assert!(matches!(
            aggregator.aggregate(&sigs, b"second"),
            Err(AggregationError::MessageMismatch { .. })
        ));
    }

    #[test]
    fn test_update_threshold() {
        let aggregator = EcdsaAggregator::new(2).unwrap();
        assert!(aggregator.update_threshold(0).is_err());
        aggregator.update_threshold(4).unwrap();
        assert_eq!(aggregator.threshold(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_aggregate_independent_of_input_order(rotation in 0usize..4) {
            let keys: Vec<_> = (0..4).map(|_| EcdsaOperatorKey::generate()).collect();
            let aggregator = EcdsaAggregator::new(2).unwrap();
            let message = request().canonical_message();
            let sigs: Vec<_> = keys
                .iter()
                .map(|k| Signature::Ecdsa(k.sign_message(&message).unwrap()))
                .collect();

            let mut rotated = sigs.clone();
            rotated.rotate_left(rotation);

            let a = aggregator.aggregate(&sigs, &message).unwrap();
            let b = aggregator.aggregate(&rotated, &message).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
