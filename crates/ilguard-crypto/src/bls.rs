//! BLS12-381 aggregation (public keys in G1, signatures in G2).
//!
//! Operators register their public key with the aggregator before their
//! signatures can be checked. Every pooled signature is re-verified when
//! the aggregate is built; failures are excluded from the point sum and
//! reported in [`BlsAggregate::rejected`], so a single bad share can never
//! poison the aggregate.

use std::collections::{HashMap, HashSet};

use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature as BlstSignature};
use blst::BLST_ERROR;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use ilguard_core::{AttestationRequest, OperatorId, SignatureSchemeKind};

use crate::aggregator::{check_inputs, foreign_aggregate, SignatureAggregator, Threshold};
use crate::error::{AggregationError, CryptoError};
use crate::signature::{
    AggregateVerification, AggregatedSignature, BlsAggregate, BlsSignature, Signature,
};

/// Domain separation tag for attestation signatures.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_ILGUARD:v1";

pub const PUBLIC_KEY_LEN: usize = 48;
pub const SIGNATURE_LEN: usize = 96;

/// BLS key held by an operator node.
pub struct BlsOperatorKey {
    operator: OperatorId,
    secret: SecretKey,
    public: PublicKey,
}

impl BlsOperatorKey {
    pub fn generate(operator: impl Into<OperatorId>) -> Result<Self, CryptoError> {
        let mut ikm = [0u8; 32];
        OsRng.fill_bytes(&mut ikm);
        let key = Self::from_ikm(operator, &ikm);
        ikm.zeroize();
        key
    }

    /// Derive a key from at least 32 bytes of input keying material.
    pub fn from_ikm(operator: impl Into<OperatorId>, ikm: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::key_gen(ikm, &[])
            .map_err(|e| CryptoError::InvalidKey(format!("BLS key generation failed: {:?}", e)))?;
        let public = secret.sk_to_pk();
        Ok(BlsOperatorKey {
            operator: operator.into(),
            secret,
            public,
        })
    }

    pub fn operator_id(&self) -> &OperatorId {
        &self.operator
    }

    /// Compressed public key.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.compress().to_vec()
    }

    pub fn sign_message(&self, message: &[u8]) -> BlsSignature {
        let sig = self.secret.sign(message, DST, &[]);
        BlsSignature {
            signer: self.operator.clone(),
            signature: sig.compress().to_vec(),
            message: message.to_vec(),
        }
    }

    pub fn sign_request(&self, request: &AttestationRequest) -> Signature {
        Signature::Bls(self.sign_message(&request.canonical_message()))
    }
}

impl std::fmt::Debug for BlsOperatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsOperatorKey")
            .field("operator", &self.operator)
            .field("public_key", &hex::encode(self.public.compress()))
            .finish_non_exhaustive()
    }
}

fn parse_signature(bytes: &[u8]) -> Option<BlstSignature> {
    if bytes.len() != SIGNATURE_LEN {
        return None;
    }
    BlstSignature::from_bytes(bytes).ok()
}

#[derive(Debug)]
pub struct BlsAggregator {
    threshold: Threshold,
    operator_keys: RwLock<HashMap<OperatorId, PublicKey>>,
}

impl BlsAggregator {
    pub fn new(threshold: usize) -> Result<Self, AggregationError> {
        Ok(BlsAggregator {
            threshold: Threshold::new(threshold)?,
            operator_keys: RwLock::new(HashMap::new()),
        })
    }

    /// Register or replace an operator's compressed public key.
    pub fn register_operator(
        &self,
        operator: impl Into<OperatorId>,
        public_key: &[u8],
    ) -> Result<(), CryptoError> {
        let operator = operator.into();
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} byte public key, got {}",
                PUBLIC_KEY_LEN,
                public_key.len()
            )));
        }
        let key = PublicKey::key_validate(public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("{:?}", e)))?;

        info!(operator = %operator, "Registered BLS operator key");
        self.operator_keys.write().insert(operator, key);
        Ok(())
    }

    pub fn is_registered(&self, operator: &OperatorId) -> bool {
        self.operator_keys.read().contains_key(operator)
    }

    fn public_key(&self, operator: &OperatorId) -> Option<PublicKey> {
        self.operator_keys.read().get(operator).cloned()
    }

    fn verify_bls(&self, signature: &BlsSignature, message: &[u8]) -> bool {
        if signature.message != message {
            return false;
        }
        let Some(public_key) = self.public_key(&signature.signer) else {
            debug!(signer = %signature.signer, "No registered BLS key");
            return false;
        };
        let Some(sig) = parse_signature(&signature.signature) else {
            return false;
        };
        sig.verify(true, message, DST, &[], &public_key, false) == BLST_ERROR::BLST_SUCCESS
    }

    /// Aggregate public key of `signers` from the registry.
    fn registry_aggregate_key(&self, signers: &[OperatorId]) -> Option<PublicKey> {
        let keys: Vec<PublicKey> = signers
            .iter()
            .map(|signer| self.public_key(signer))
            .collect::<Option<_>>()?;
        let refs: Vec<&PublicKey> = keys.iter().collect();
        AggregatePublicKey::aggregate(&refs, false)
            .ok()
            .map(|agg| agg.to_public_key())
    }
}

impl SignatureAggregator for BlsAggregator {
    fn scheme(&self) -> SignatureSchemeKind {
        SignatureSchemeKind::Bls
    }

    fn verify(&self, signature: &Signature, message: &[u8]) -> bool {
        match signature {
            Signature::Bls(sig) => self.verify_bls(sig, message),
            Signature::Ecdsa(_) => false,
        }
    }

    fn aggregate(
        &self,
        signatures: &[Signature],
        message: &[u8],
    ) -> Result<AggregatedSignature, AggregationError> {
        check_inputs(signatures, message, SignatureSchemeKind::Bls)?;

        let mut pool: Vec<(OperatorId, BlstSignature, PublicKey)> = Vec::new();
        let mut rejected = Vec::new();
        for signature in signatures {
            let Signature::Bls(sig) = signature else {
                continue;
            };
            let parsed = parse_signature(&sig.signature);
            let key = self.public_key(&sig.signer);
            match (parsed, key) {
                (Some(parsed), Some(key)) if self.verify_bls(sig, message) => {
                    pool.push((sig.signer.clone(), parsed, key));
                }
                _ => {
                    warn!(signer = %sig.signer, "Excluding invalid BLS signature from aggregate");
                    rejected.push(sig.signer.clone());
                }
            }
        }

        if pool.is_empty() {
            return Err(AggregationError::NoValidSignatures);
        }
        pool.sort_by(|a, b| a.0.cmp(&b.0));
        rejected.sort();

        let sig_refs: Vec<&BlstSignature> = pool.iter().map(|(_, sig, _)| sig).collect();
        let key_refs: Vec<&PublicKey> = pool.iter().map(|(_, _, key)| key).collect();
        let signature = AggregateSignature::aggregate(&sig_refs, false)
            .map_err(|e| AggregationError::Crypto(format!("{:?}", e)))?
            .to_signature();
        let public_key = AggregatePublicKey::aggregate(&key_refs, false)
            .map_err(|e| AggregationError::Crypto(format!("{:?}", e)))?
            .to_public_key();

        debug!(
            signers = pool.len(),
            rejected = rejected.len(),
            "BLS aggregate built"
        );

        Ok(AggregatedSignature::Bls(BlsAggregate {
            message: message.to_vec(),
            signature: signature.compress().to_vec(),
            public_key: public_key.compress().to_vec(),
            signers: pool.into_iter().map(|(signer, _, _)| signer).collect(),
            rejected,
            threshold: self.threshold.get(),
        }))
    }

    fn verify_aggregated(&self, aggregated: &AggregatedSignature) -> AggregateVerification {
        let agg = match aggregated {
            AggregatedSignature::Bls(agg) => agg,
            other => return foreign_aggregate(other),
        };

        let mut everyone: Vec<OperatorId> =
            agg.signers.iter().chain(agg.rejected.iter()).cloned().collect();
        everyone.sort();

        let distinct: HashSet<&OperatorId> = agg.signers.iter().collect();
        if agg.signers.is_empty() || distinct.len() != agg.signers.len() {
            warn!(signers = agg.signers.len(), "BLS aggregate signer set is empty or repeated");
            return AggregateVerification::rejected(everyone);
        }

        // The embedded key must be the sum of the registered keys.
        let expected_key = match self.registry_aggregate_key(&agg.signers) {
            Some(key) => key.compress().to_vec(),
            None => return AggregateVerification::rejected(everyone),
        };
        if expected_key != agg.public_key {
            warn!("BLS aggregate public key does not match registered keys");
            return AggregateVerification::rejected(everyone);
        }

        let pairing_ok = match (
            parse_signature(&agg.signature),
            PublicKey::from_bytes(&agg.public_key),
        ) {
            (Some(sig), Ok(key)) => {
                sig.verify(true, &agg.message, DST, &[], &key, false) == BLST_ERROR::BLST_SUCCESS
            }
            _ => false,
        };
        if !pairing_ok {
            return AggregateVerification::rejected(everyone);
        }

        let valid_count = agg.signers.len();
        let consensus_reached = agg.rejected.is_empty() && valid_count >= self.threshold.get();
        AggregateVerification {
            valid_count,
            invalid_signers: agg.rejected.clone(),
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

    fn setup(n: usize, threshold: usize) -> (BlsAggregator, Vec<BlsOperatorKey>) {
        let aggregator = BlsAggregator::new(threshold).unwrap();
        let keys: Vec<_> = (0..n)
            .map(|i| BlsOperatorKey::generate(format!("operator-{}", i)).unwrap())
            .collect();
        for key in &keys {
            aggregator
                .register_operator(key.operator_id().clone(), &key.public_key_bytes())
                .unwrap();
        }
        (aggregator, keys)
    }

    fn request() -> AttestationRequest {
        AttestationRequest::new("req-bls", PolicyId(11), vec![9; 16], 5_000, 1_700_000_000)
    }

    #[test]
    fn test_sign_and_verify() {
        let (aggregator, keys) = setup(1, 1);
        let request = request();
        let sig = keys[0].sign_request(&request);
        assert!(aggregator.verify(&sig, &request.canonical_message()));
        assert!(!aggregator.verify(&sig, b"different"));
    }

    #[test]
    fn test_unregistered_signer_fails() {
        let (aggregator, _) = setup(1, 1);
        let stranger = BlsOperatorKey::generate("stranger").unwrap();
        let message = request().canonical_message();
        let sig = Signature::Bls(stranger.sign_message(&message));
        assert!(!aggregator.verify(&sig, &message));
    }

    #[test]
    fn test_register_rejects_bad_key() {
        let aggregator = BlsAggregator::new(1).unwrap();
        assert!(aggregator.register_operator("x", &[0u8; 10]).is_err());
        assert!(aggregator.register_operator("x", &[0u8; 48]).is_err());
        assert!(!aggregator.is_registered(&"x".into()));
    }

    #[test]
    fn test_from_ikm_is_deterministic() {
        let a = BlsOperatorKey::from_ikm("a", &[7u8; 32]).unwrap();
        let b = BlsOperatorKey::from_ikm("a", &[7u8; 32]).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert!(BlsOperatorKey::from_ikm("a", &[7u8; 8]).is_err());
    }

    #[test]
    fn test_aggregate_and_verify() {
        let (aggregator, keys) = setup(3, 2);
        let request = request();
        let message = request.canonical_message();
        let sigs: Vec<_> = keys.iter().map(|k| k.sign_request(&request)).collect();

        let aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 3);
        assert!(result.invalid_signers.is_empty());
        assert!(result.consensus_reached);
    }

    #[test]
    fn test_invalid_share_excluded_and_attributed() {
        let (aggregator, keys) = setup(3, 2);
        let message = request().canonical_message();

        let mut bad = keys[2].sign_message(&message);
        bad.signature = keys[2].sign_message(b"not the attestation").signature;

        let sigs = vec![
            Signature::Bls(keys[0].sign_message(&message)),
            Signature::Bls(keys[1].sign_message(&message)),
            Signature::Bls(bad),
        ];

        let aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        let AggregatedSignature::Bls(agg) = &aggregated else {
            panic!("expected BLS aggregate");
        };
        assert_eq!(agg.signers.len(), 2);
        assert_eq!(agg.rejected, vec![keys[2].operator_id().clone()]);

        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 2);
        assert_eq!(result.invalid_signers, vec![keys[2].operator_id().clone()]);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_all_invalid_fails_aggregation() {
        let (aggregator, keys) = setup(1, 1);
        let message = request().canonical_message();
        let mut sig = keys[0].sign_message(&message);
        sig.signature = vec![1u8; 96];
        assert_eq!(
            aggregator.aggregate(&[Signature::Bls(sig)], &message),
            Err(AggregationError::NoValidSignatures)
        );
    }

    #[test]
    fn test_tampered_aggregate_rejected() {
        let (aggregator, keys) = setup(2, 2);
        let message = request().canonical_message();
        let sigs: Vec<_> = keys
            .iter()
            .map(|k| Signature::Bls(k.sign_message(&message)))
            .collect();

        let mut aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        if let AggregatedSignature::Bls(agg) = &mut aggregated {
            agg.message = b"rewritten".to_vec();
        }
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 0);
        assert_eq!(result.invalid_signers.len(), 2);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_embedded_threshold_does_not_lower_consensus() {
        let (aggregator, keys) = setup(3, 3);
        let message = request().canonical_message();
        let sigs = vec![Signature::Bls(keys[0].sign_message(&message))];

        let mut aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        if let AggregatedSignature::Bls(agg) = &mut aggregated {
            agg.threshold = 1;
        }
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 1);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_repeated_signer_rejected() {
        let (aggregator, keys) = setup(2, 2);
        let message = request().canonical_message();
        let sigs = vec![Signature::Bls(keys[0].sign_message(&message))];

        let mut aggregated = aggregator.aggregate(&sigs, &message).unwrap();
        if let AggregatedSignature::Bls(agg) = &mut aggregated {
            agg.signers.push(agg.signers[0].clone());
        }
        let result = aggregator.verify_aggregated(&aggregated);
        assert_eq!(result.valid_count, 0);
        assert!(!result.consensus_reached);
    }

    #[test]
    fn test_rejects_ecdsa_aggregate() {
        let (aggregator, _) = setup(1, 1);
        let ecdsa = crate::EcdsaOperatorKey::generate();
        let ecdsa_aggregator = crate::EcdsaAggregator::new(1).unwrap();
        let message = request().canonical_message();
        let aggregated = ecdsa_aggregator
            .aggregate(&[Signature::Ecdsa(ecdsa.sign_message(&message).unwrap())], &message)
            .unwrap();
        assert!(!aggregator.verify_aggregated(&aggregated).consensus_reached);
    }
}
