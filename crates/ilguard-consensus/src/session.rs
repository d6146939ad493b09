use std::collections::BTreeMap;
use std::time::Duration;

use ilguard_core::{AttestationRequest, OperatorId, PolicyId, RequestId};
use ilguard_crypto::Signature;
use ilguard_scheduler::TaskId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::result::ConsensusResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Pending)
    }
}

/// Mutable state of one consensus round. Owned by the coordinator.
#[derive(Debug)]
pub(crate) struct ConsensusSession {
    pub request: AttestationRequest,
    pub message: Vec<u8>,
    pub signatures: BTreeMap<OperatorId, Signature>,
    pub created_at: Instant,
    pub timeout: Duration,
    pub status: SessionStatus,
    pub failure_reason: Option<String>,
    pub invalid_signers: Vec<OperatorId>,
    pub result: Option<ConsensusResult>,
    pub timeout_task: Option<TaskId>,
}

impl ConsensusSession {
    pub fn new(request: AttestationRequest, timeout: Duration) -> Self {
        let message = request.canonical_message();
        ConsensusSession {
            request,
            message,
            signatures: BTreeMap::new(),
            created_at: Instant::now(),
            timeout,
            status: SessionStatus::Pending,
            failure_reason: None,
            invalid_signers: Vec::new(),
            result: None,
            timeout_task: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == SessionStatus::Pending
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            request_id: self.request.id.clone(),
            policy_id: self.request.policy_id,
            status: self.status,
            signers: self.signatures.keys().cloned().collect(),
            signatures: self.signatures.values().cloned().collect(),
            age: self.created_at.elapsed(),
            timeout: self.timeout,
            failure_reason: self.failure_reason.clone(),
            invalid_signers: self.invalid_signers.clone(),
            result: self.result.clone(),
        }
    }
}

/// Read-only copy of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub request_id: RequestId,
    pub policy_id: PolicyId,
    pub status: SessionStatus,
    /// Ascending.
    pub signers: Vec<OperatorId>,
    pub signatures: Vec<Signature>,
    pub age: Duration,
    pub timeout: Duration,
    pub failure_reason: Option<String>,
    pub invalid_signers: Vec<OperatorId>,
    pub result: Option<ConsensusResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}
