use ilguard_core::{OperatorId, RequestId};
use serde::{Deserialize, Serialize};

use crate::result::ConsensusResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsensusEvent {
    SignatureReceived {
        request_id: RequestId,
        signer: OperatorId,
        signature_count: usize,
        threshold: usize,
    },
    ConsensusReached {
        result: ConsensusResult,
    },
    ConsensusFailed {
        request_id: RequestId,
        reason: String,
        invalid_signers: Vec<OperatorId>,
    },
    ConsensusTimeout {
        request_id: RequestId,
        signatures_collected: usize,
    },
}

impl ConsensusEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            ConsensusEvent::SignatureReceived { request_id, .. } => request_id,
            ConsensusEvent::ConsensusReached { result } => &result.request_id,
            ConsensusEvent::ConsensusFailed { request_id, .. } => request_id,
            ConsensusEvent::ConsensusTimeout { request_id, .. } => request_id,
        }
    }
}
