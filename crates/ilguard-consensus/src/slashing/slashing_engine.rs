// SLASHING ENGINE
// Deterministic penalty calculation for upheld challenges.
//
// INVARIANTS:
// 1. Same reason + same penalty table -> same slash amount
// 2. A challenge is slashed at most once
// 3. Amounts below the configured minimum are never recorded
// 4. The history is append-only
// 5. No funds move here; events are reported for the ledger layer

use std::collections::HashSet;

use ilguard_core::{OperatorId, PenaltyTable, PolicyId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SlashingError;
use crate::slashing::challenge::SlashingReason;

/// Record of one executed slash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingEvent {
    pub operator: OperatorId,
    pub reason: SlashingReason,
    pub challenge_id: String,
    pub policy_id: PolicyId,
    /// Wei.
    pub amount: u128,
    /// Unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct SlashingEngine {
    penalties: PenaltyTable,
    min_amount: u128,
    history: Vec<SlashingEvent>,
    processed: HashSet<String>,
}

impl SlashingEngine {
    pub fn new(penalties: PenaltyTable, min_amount: u128) -> Self {
        SlashingEngine {
            penalties,
            min_amount,
            history: Vec::new(),
            processed: HashSet::new(),
        }
    }

    pub fn calculate_amount(&self, reason: SlashingReason) -> u128 {
        reason.penalty(&self.penalties)
    }

    /// Slash `operator` for the challenge `challenge_id`. Returns `Ok(None)`
    /// when that challenge was already slashed.
    pub fn execute(
        &mut self,
        operator: &OperatorId,
        reason: SlashingReason,
        challenge_id: &str,
        policy_id: PolicyId,
        timestamp: i64,
    ) -> Result<Option<SlashingEvent>, SlashingError> {
        if self.processed.contains(challenge_id) {
            return Ok(None);
        }

        let amount = self.calculate_amount(reason);
        if amount < self.min_amount {
            warn!(
                operator = %operator,
                reason = reason.as_str(),
                amount = %amount,
                minimum = %self.min_amount,
                "Slash amount below minimum, skipping"
            );
            return Err(SlashingError::BelowMinimum {
                amount,
                minimum: self.min_amount,
            });
        }

        let event = SlashingEvent {
            operator: operator.clone(),
            reason,
            challenge_id: challenge_id.to_string(),
            policy_id,
            amount,
            timestamp,
        };
        info!(
            operator = %operator,
            reason = reason.as_str(),
            amount = %amount,
            challenge_id,
            "Operator slashed"
        );
        self.processed.insert(challenge_id.to_string());
        self.history.push(event.clone());
        Ok(Some(event))
    }

    pub fn history(&self) -> &[SlashingEvent] {
        &self.history
    }

    pub fn history_for(&self, operator: &OperatorId) -> Vec<SlashingEvent> {
        self.history
            .iter()
            .filter(|e| &e.operator == operator)
            .cloned()
            .collect()
    }

    pub fn total_slashed(&self) -> u128 {
        self.history.iter().map(|e| e.amount).sum()
    }
}
