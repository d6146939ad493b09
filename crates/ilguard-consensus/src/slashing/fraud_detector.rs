// FRAUD DETECTOR
// Heuristic analysis of a consensus result and the signatures behind it.
//
// Findings are produced per participant:
// - signature missing or failing re-verification  -> InvalidSignature, High
// - conflicting digest for a policy already signed -> DoubleSigning, Critical
// - payout above the suspicious ceiling            -> MaliciousAttestation, Medium

use std::sync::Arc;

use ilguard_core::{keccak256, AttestationRequest, OperatorId};
use ilguard_crypto::{Signature, SignatureAggregator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::result::ConsensusResult;
use crate::slashing::challenge::{ChallengeEvidence, SlashingReason};
use crate::slashing::history::{SignatureHistory, SignedEntry};

pub const INVALID_SIGNATURE_CONFIDENCE: f64 = 0.95;
pub const DOUBLE_SIGNING_CONFIDENCE: f64 = 0.99;
pub const SUSPICIOUS_PAYOUT_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudDetectionResult {
    pub operator: OperatorId,
    pub reason: SlashingReason,
    pub severity: Severity,
    /// In [0, 1].
    pub confidence: f64,
    pub description: String,
    #[serde(with = "hex::serde")]
    pub evidence: Vec<u8>,
}

impl FraudDetectionResult {
    pub fn to_challenge_evidence(&self, request: &AttestationRequest) -> ChallengeEvidence {
        ChallengeEvidence {
            reason: self.reason,
            policy_id: request.policy_id,
            request_id: request.id.clone(),
            description: self.description.clone(),
            proof: self.evidence.clone(),
        }
    }
}

pub struct FraudDetector {
    aggregator: Arc<dyn SignatureAggregator>,
    suspicious_payout: u128,
}

impl FraudDetector {
    pub fn new(aggregator: Arc<dyn SignatureAggregator>, suspicious_payout: u128) -> Self {
        FraudDetector {
            aggregator,
            suspicious_payout,
        }
    }

    /// Every participant is checked; findings are returned in participant
    /// order. Valid signatures are recorded in `history`.
    pub fn analyze(
        &self,
        result: &ConsensusResult,
        request: &AttestationRequest,
        signatures: &[Signature],
        history: &mut SignatureHistory,
    ) -> Vec<FraudDetectionResult> {
        let message = request.canonical_message();
        let mut findings = Vec::new();

        for participant in &result.participants {
            let Some(signature) = signatures.iter().find(|s| s.signer() == participant) else {
                findings.push(FraudDetectionResult {
                    operator: participant.clone(),
                    reason: SlashingReason::InvalidSignature,
                    severity: Severity::High,
                    confidence: INVALID_SIGNATURE_CONFIDENCE,
                    description: "participant has no signature on record".to_string(),
                    evidence: evidence_bytes(json!({
                        "request_id": request.id,
                        "operator": participant,
                    })),
                });
                continue;
            };

            if !self.aggregator.verify(signature, &message) {
                findings.push(FraudDetectionResult {
                    operator: participant.clone(),
                    reason: SlashingReason::InvalidSignature,
                    severity: Severity::High,
                    confidence: INVALID_SIGNATURE_CONFIDENCE,
                    description: "signature failed re-verification".to_string(),
                    evidence: evidence_bytes(json!({
                        "request_id": request.id,
                        "signature": signature,
                    })),
                });
                continue;
            }

            let digest = keccak256(signature.message());
            let entry = SignedEntry {
                policy_id: request.policy_id,
                request_id: request.id.clone(),
                digest,
            };
            if let Some(previous) = history.record(participant, entry) {
                findings.push(FraudDetectionResult {
                    operator: participant.clone(),
                    reason: SlashingReason::DoubleSigning,
                    severity: Severity::Critical,
                    confidence: DOUBLE_SIGNING_CONFIDENCE,
                    description: format!(
                        "signed conflicting attestations for policy {} ({} and {})",
                        request.policy_id, previous.request_id, request.id
                    ),
                    evidence: evidence_bytes(json!({
                        "policy_id": request.policy_id,
                        "first": { "request_id": previous.request_id, "digest": hex::encode(previous.digest) },
                        "second": { "request_id": request.id, "digest": hex::encode(digest) },
                    })),
                });
            }
        }

        if request.payout > self.suspicious_payout {
            for participant in &result.participants {
                findings.push(FraudDetectionResult {
                    operator: participant.clone(),
                    reason: SlashingReason::MaliciousAttestation,
                    severity: Severity::Medium,
                    confidence: SUSPICIOUS_PAYOUT_CONFIDENCE,
                    description: format!(
                        "attested payout {} exceeds suspicious ceiling {}",
                        request.payout, self.suspicious_payout
                    ),
                    evidence: evidence_bytes(json!({
                        "request_id": request.id,
                        "payout": request.payout.to_string(),
                    })),
                });
            }
        }

        debug!(
            request_id = %request.id,
            findings = findings.len(),
            "Fraud analysis complete"
        );
        findings
    }

    /// Findings for operators whose signatures failed aggregate verification.
    pub fn invalid_signers(
        &self,
        request: &AttestationRequest,
        invalid_signers: &[OperatorId],
    ) -> Vec<FraudDetectionResult> {
        invalid_signers
            .iter()
            .map(|operator| FraudDetectionResult {
                operator: operator.clone(),
                reason: SlashingReason::InvalidSignature,
                severity: Severity::High,
                confidence: INVALID_SIGNATURE_CONFIDENCE,
                description: "signature rejected during consensus".to_string(),
                evidence: evidence_bytes(json!({
                    "request_id": request.id,
                    "operator": operator,
                })),
            })
            .collect()
    }
}

fn evidence_bytes(value: serde_json::Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilguard_core::{PolicyId, GWEI};
    use ilguard_crypto::{EcdsaAggregator, EcdsaOperatorKey};

    struct Fixture {
        detector: FraudDetector,
        aggregator: Arc<EcdsaAggregator>,
        keys: Vec<EcdsaOperatorKey>,
    }

    fn fixture(n: usize) -> Fixture {
        let aggregator = Arc::new(EcdsaAggregator::new(n).unwrap());
        Fixture {
            detector: FraudDetector::new(aggregator.clone(), 1_000 * GWEI),
            aggregator,
            keys: (0..n).map(|_| EcdsaOperatorKey::generate()).collect(),
        }
    }

    fn run(
        fx: &Fixture,
        request: &AttestationRequest,
        history: &mut SignatureHistory,
    ) -> Vec<FraudDetectionResult> {
        let sigs: Vec<_> = fx
            .keys
            .iter()
            .map(|k| k.sign_request(request).unwrap())
            .collect();
        let aggregated = fx
            .aggregator
            .aggregate(&sigs, &request.canonical_message())
            .unwrap();
        let result = ConsensusResult {
            request_id: request.id.clone(),
            policy_id: request.policy_id,
            approved: request.is_approved(),
            payout: request.payout,
            participants: aggregated.signers(),
            aggregated_signature: aggregated,
            threshold: fx.keys.len(),
        };
        fx.detector.analyze(&result, request, &sigs, history)
    }

    #[test]
    fn test_clean_result_has_no_findings() {
        let fx = fixture(2);
        let mut history = SignatureHistory::new(16);
        let request = AttestationRequest::new("r1", PolicyId(1), vec![1], 10, 1);
        assert!(run(&fx, &request, &mut history).is_empty());
        // Same request analyzed again is not double-signing.
        assert!(run(&fx, &request, &mut history).is_empty());
    }

    #[test]
    fn test_double_signing_detected() {
        let fx = fixture(2);
        let mut history = SignatureHistory::new(16);
        let first = AttestationRequest::new("r1", PolicyId(1), vec![1], 10, 1);
        let second = AttestationRequest::new("r2", PolicyId(1), vec![1], 20, 1);

        run(&fx, &first, &mut history);
        let findings = run(&fx, &second, &mut history);
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.reason == SlashingReason::DoubleSigning
            && f.severity == Severity::Critical
            && f.confidence == DOUBLE_SIGNING_CONFIDENCE));
    }

    #[test]
    fn test_suspicious_payout_flagged() {
        let fx = fixture(1);
        let mut history = SignatureHistory::new(16);
        let request = AttestationRequest::new("r1", PolicyId(2), vec![1], 2_000 * GWEI, 1);
        let findings = run(&fx, &request, &mut history);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reason, SlashingReason::MaliciousAttestation);
        assert_eq!(findings[0].severity, Severity::Medium);
    }

    #[test]
    fn test_missing_signature_flagged() {
        let fx = fixture(2);
        let mut history = SignatureHistory::new(16);
        let request = AttestationRequest::new("r1", PolicyId(3), vec![1], 10, 1);
        let sigs: Vec<_> = fx.keys.iter().map(|k| k.sign_request(&request).unwrap()).collect();
        let aggregated = fx
            .aggregator
            .aggregate(&sigs, &request.canonical_message())
            .unwrap();
        let result = ConsensusResult {
            request_id: request.id.clone(),
            policy_id: request.policy_id,
            approved: true,
            payout: request.payout,
            participants: aggregated.signers(),
            aggregated_signature: aggregated,
            threshold: 2,
        };

        let findings = fx.detector.analyze(&result, &request, &sigs[..1], &mut history);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reason, SlashingReason::InvalidSignature);
        assert_eq!(findings[0].operator, *fx.keys[1].operator_id());
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }
}
