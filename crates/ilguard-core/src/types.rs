use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message;

/// Operator identity. Addresses compare case-insensitively, so the
/// identifier is normalized to lowercase on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct OperatorId(String);

impl OperatorId {
    pub fn new(id: impl AsRef<str>) -> Self {
        OperatorId(id.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a raw address string.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl From<String> for OperatorId {
    fn from(id: String) -> Self {
        OperatorId::new(id)
    }
}

impl From<&str> for OperatorId {
    fn from(id: &str) -> Self {
        OperatorId::new(id)
    }
}

impl From<OperatorId> for String {
    fn from(id: OperatorId) -> Self {
        id.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Insurance policy identifier as issued by the policy contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub u64);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one attestation round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        RequestId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input to a consensus round, produced by claim discovery and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub id: RequestId,
    pub policy_id: PolicyId,
    /// Encoded proof emitted by the confidential compute service.
    #[serde(with = "hex::serde")]
    pub proof: Vec<u8>,
    /// Payout in wei.
    pub payout: u128,
    /// Creation time, unix seconds.
    pub timestamp: u64,
}

impl AttestationRequest {
    pub fn new(
        id: impl Into<RequestId>,
        policy_id: PolicyId,
        proof: Vec<u8>,
        payout: u128,
        timestamp: u64,
    ) -> Self {
        AttestationRequest {
            id: id.into(),
            policy_id,
            proof,
            payout,
            timestamp,
        }
    }

    /// The message every operator signs for this request.
    pub fn canonical_message(&self) -> Vec<u8> {
        message::canonical_message(self)
    }

    /// A zero payout means the computation found no compensable loss.
    pub fn is_approved(&self) -> bool {
        self.payout > 0
    }
}
