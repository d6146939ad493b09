use ilguard_core::{OperatorId, PolicyId, RequestId};
use serde::{Deserialize, Serialize};

use crate::slashing::challenge::{ChallengeResolution, SlashingReason};
use crate::slashing::fraud_detector::FraudDetectionResult;
use crate::slashing::slashing_engine::SlashingEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlashingManagerEvent {
    FraudDetected {
        request_id: RequestId,
        finding: FraudDetectionResult,
    },
    ChallengeCreated {
        challenge_id: String,
        challenger: OperatorId,
        target: OperatorId,
        policy_id: PolicyId,
        reason: SlashingReason,
    },
    ChallengeResolved {
        challenge_id: String,
        target: OperatorId,
        resolution: ChallengeResolution,
        /// Resolved because the response window elapsed.
        expired: bool,
    },
    /// Closed without resolution; nothing is slashed.
    ChallengeCancelled {
        challenge_id: String,
        target: OperatorId,
        reason: String,
    },
    /// Every ledger submission attempt for the challenge failed.
    ChallengeSubmissionFailed {
        challenge_id: String,
        target: OperatorId,
        attempts: u32,
        error: String,
    },
    OperatorSlashed {
        event: SlashingEvent,
    },
    SlashingFailed {
        challenge_id: String,
        operator: OperatorId,
        reason: SlashingReason,
        error: String,
    },
}
