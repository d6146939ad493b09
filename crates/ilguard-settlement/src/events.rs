use ilguard_core::{PolicyId, RequestId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    SettlementInitiated {
        policy_id: PolicyId,
        request_id: RequestId,
        attempt: u32,
        approved: bool,
    },
    SettlementConfirmed {
        policy_id: PolicyId,
        request_id: RequestId,
        tx_hash: String,
        gas_used: u64,
        block_number: u64,
    },
    SettlementFailed {
        policy_id: PolicyId,
        request_id: RequestId,
        attempt: u32,
        error: String,
        /// No further attempts will be made.
        permanent: bool,
    },
    BatchProcessed {
        succeeded: usize,
        failed: usize,
    },
}
