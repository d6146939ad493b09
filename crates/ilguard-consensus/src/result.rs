use ilguard_core::{OperatorId, PolicyId, RequestId};
use ilguard_crypto::AggregatedSignature;
use serde::{Deserialize, Serialize};

/// Output of a completed consensus session.
///
/// `participants` is sorted ascending and never shorter than `threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub request_id: RequestId,
    pub policy_id: PolicyId,
    /// Whether the claim should be paid out.
    pub approved: bool,
    /// Attested payout in wei.
    pub payout: u128,
    pub aggregated_signature: AggregatedSignature,
    pub participants: Vec<OperatorId>,
    pub threshold: usize,
}
