use ilguard_core::{OperatorId, PenaltyTable, PolicyId, RequestId, GWEI};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Minimum evidence length for a response to dismiss a challenge.
pub const MIN_RESPONSE_EVIDENCE_LEN: usize = 64;

/// Slashable offense, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashingReason {
    DoubleSigning,
    MaliciousAttestation,
    ChallengeFailure,
    InvalidSignature,
    Unavailability,
}

impl SlashingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlashingReason::DoubleSigning => "DOUBLE_SIGNING",
            SlashingReason::MaliciousAttestation => "MALICIOUS_ATTESTATION",
            SlashingReason::ChallengeFailure => "CHALLENGE_FAILURE",
            SlashingReason::InvalidSignature => "INVALID_SIGNATURE",
            SlashingReason::Unavailability => "UNAVAILABILITY",
        }
    }

    /// Penalty in wei.
    pub fn penalty(&self, table: &PenaltyTable) -> u128 {
        let gwei = match self {
            SlashingReason::DoubleSigning => table.double_signing_gwei,
            SlashingReason::MaliciousAttestation => table.malicious_attestation_gwei,
            SlashingReason::ChallengeFailure => table.challenge_failure_gwei,
            SlashingReason::InvalidSignature => table.invalid_signature_gwei,
            SlashingReason::Unavailability => table.unavailability_gwei,
        };
        gwei as u128 * GWEI
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeEvidence {
    pub reason: SlashingReason,
    pub policy_id: PolicyId,
    pub request_id: RequestId,
    pub description: String,
    #[serde(with = "hex::serde")]
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Resolved,
    Expired,
    /// Closed without a resolution when the manager stopped.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeResolution {
    Upheld,
    Dismissed,
}

/// Answer submitted by a challenged operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub explanation: String,
    pub evidence: String,
}

impl ChallengeResponse {
    /// Parse a raw response. `None` if it is not the expected JSON shape.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// A response dismisses the challenge only when it explains itself and
    /// carries substantial evidence.
    pub fn is_sufficient(&self) -> bool {
        !self.explanation.trim().is_empty()
            && self.evidence.chars().count() >= MIN_RESPONSE_EVIDENCE_LEN
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub id: String,
    pub challenger: OperatorId,
    pub target: OperatorId,
    pub evidence: ChallengeEvidence,
    pub status: ChallengeStatus,
    /// Unix milliseconds.
    pub created_at_ms: i64,
    pub deadline: Instant,
    pub response: Option<String>,
    pub resolution: Option<ChallengeResolution>,
    /// Ledger transaction carrying the evidence, once submitted.
    pub ledger_tx: Option<String>,
}

impl Challenge {
    pub fn is_pending(&self) -> bool {
        self.status == ChallengeStatus::Pending
    }

    pub fn policy_id(&self) -> PolicyId {
        self.evidence.policy_id
    }
}
