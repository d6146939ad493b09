use chrono::{DateTime, Utc};
use ilguard_consensus::ConsensusResult;
use ilguard_core::{PolicyId, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettlementKey {
    pub policy_id: PolicyId,
    pub request_id: RequestId,
}

impl SettlementKey {
    pub fn new(policy_id: PolicyId, request_id: RequestId) -> Self {
        SettlementKey {
            policy_id,
            request_id,
        }
    }

    pub fn of(result: &ConsensusResult) -> Self {
        SettlementKey::new(result.policy_id, result.request_id.clone())
    }
}

impl fmt::Display for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy_id, self.request_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// On-chain disposition of one consensus result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTransaction {
    pub key: SettlementKey,
    pub approved: bool,
    /// Wei.
    pub payout: u128,
    pub status: SettlementStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub tx_hash: Option<String>,
    /// Gas consumed by the latest reverted attempt.
    pub gas_used: Option<u64>,
    /// Wei per gas used on the latest attempt.
    pub gas_price: Option<u128>,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Enqueue order, used to pick batches oldest first.
    pub(crate) sequence: u64,
}

impl SettlementTransaction {
    pub(crate) fn new(result: &ConsensusResult, sequence: u64) -> Self {
        SettlementTransaction {
            key: SettlementKey::of(result),
            approved: result.approved,
            payout: result.payout,
            status: SettlementStatus::Pending,
            attempts: 0,
            last_error: None,
            tx_hash: None,
            gas_used: None,
            gas_price: None,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
            sequence,
        }
    }

    /// Pending and failed records are picked up by the next cycle.
    pub fn is_eligible(&self) -> bool {
        matches!(
            self.status,
            SettlementStatus::Pending | SettlementStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementStats {
    pub queued: usize,
    pub submitted: usize,
    pub confirmed: u64,
    pub permanently_failed: u64,
    pub cycles: u64,
}
