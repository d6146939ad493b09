use std::collections::{HashMap, VecDeque};

use ilguard_core::{OperatorId, PolicyId, RequestId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEntry {
    pub policy_id: PolicyId,
    pub request_id: RequestId,
    pub digest: [u8; 32],
}

/// Bounded per-operator memory of analyzed signatures, used to spot an
/// operator endorsing two different messages for the same policy.
///
/// Only the most recent `depth` entries per operator are kept; conflicts
/// with older entries go unnoticed.
#[derive(Debug)]
pub struct SignatureHistory {
    depth: usize,
    entries: HashMap<OperatorId, VecDeque<SignedEntry>>,
}

impl SignatureHistory {
    pub fn new(depth: usize) -> Self {
        SignatureHistory {
            depth: depth.max(1),
            entries: HashMap::new(),
        }
    }

    /// Record `entry` for `operator` and return the earlier entry it
    /// conflicts with, if any. Re-recording an identical entry is a no-op.
    pub fn record(&mut self, operator: &OperatorId, entry: SignedEntry) -> Option<SignedEntry> {
        let ring = self.entries.entry(operator.clone()).or_default();

        if ring
            .iter()
            .any(|e| e.request_id == entry.request_id && e.digest == entry.digest)
        {
            return None;
        }

        let conflict = ring
            .iter()
            .find(|e| e.policy_id == entry.policy_id && e.digest != entry.digest)
            .cloned();

        if ring.len() == self.depth {
            ring.pop_front();
        }
        ring.push_back(entry);
        conflict
    }

    pub fn len(&self, operator: &OperatorId) -> usize {
        self.entries.get(operator).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
