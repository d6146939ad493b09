//! Ledger contract and gas oracle collaborators.
//!
//! The coordinator never talks to a chain directly; it submits settlement,
//! rejection and challenge transactions through [`LedgerContract`] and reads
//! the network gas price through [`GasOracle`]. [`SimulatedLedger`] and
//! [`FixedGasOracle`] are in-process stand-ins for local runs and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::types::PolicyId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transaction submission failed: {0}")]
    Submission(String),

    #[error("Confirmation failed for {tx_hash}: {reason}")]
    Confirmation { tx_hash: String, reason: String },

    #[error("Unknown transaction {0}")]
    UnknownTransaction(String),

    #[error("Gas oracle unavailable: {0}")]
    GasOracle(String),
}

/// Handle returned by a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle {
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: String,
    pub status: TxStatus,
    pub gas_used: u64,
    pub block_number: u64,
}

impl TxReceipt {
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }
}

#[async_trait]
pub trait LedgerContract: Send + Sync {
    /// Pay out a policy claim.
    async fn settle(
        &self,
        policy_id: PolicyId,
        payout: u128,
        gas_price: u128,
    ) -> Result<TxHandle, LedgerError>;

    /// Record that a claim was rejected.
    async fn reject(
        &self,
        policy_id: PolicyId,
        reason: &str,
        gas_price: u128,
    ) -> Result<TxHandle, LedgerError>;

    /// Record challenge evidence against an operator.
    async fn challenge(&self, policy_id: PolicyId, evidence: &[u8])
        -> Result<TxHandle, LedgerError>;

    /// Wait until the transaction is mined.
    async fn wait_for_receipt(&self, tx: &TxHandle) -> Result<TxReceipt, LedgerError>;
}

#[async_trait]
pub trait GasOracle: Send + Sync {
    /// Current network gas price in wei.
    async fn gas_price(&self) -> Result<u128, LedgerError>;
}

/// Gas oracle returning a constant price.
#[derive(Debug, Clone, Copy)]
pub struct FixedGasOracle {
    price: u128,
}

impl FixedGasOracle {
    pub fn new(price: u128) -> Self {
        FixedGasOracle { price }
    }
}

#[async_trait]
impl GasOracle for FixedGasOracle {
    async fn gas_price(&self) -> Result<u128, LedgerError> {
        Ok(self.price)
    }
}

/// A call observed by [`SimulatedLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    Settle {
        policy_id: PolicyId,
        payout: u128,
        gas_price: u128,
    },
    Reject {
        policy_id: PolicyId,
        reason: String,
        gas_price: u128,
    },
    Challenge {
        policy_id: PolicyId,
        evidence: Vec<u8>,
    },
}

impl LedgerCall {
    fn gas_used(&self) -> u64 {
        match self {
            LedgerCall::Settle { .. } => 120_000,
            LedgerCall::Reject { .. } => 65_000,
            LedgerCall::Challenge { .. } => 90_000,
        }
    }
}

#[derive(Default)]
struct SimulatedState {
    nonce: u64,
    block_number: u64,
    calls: Vec<LedgerCall>,
    attempts: usize,
    failing_submissions: u32,
    fail_all: bool,
    reverting_receipts: u32,
    mined: HashMap<String, u64>,
}

/// In-memory ledger with scriptable failures.
#[derive(Default)]
pub struct SimulatedLedger {
    state: Mutex<SimulatedState>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` submissions fail.
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().failing_submissions = count;
    }

    pub fn fail_all_submissions(&self, enabled: bool) {
        self.state.lock().fail_all = enabled;
    }

    /// Make the next `count` receipts come back reverted.
    pub fn revert_next_receipts(&self, count: u32) {
        self.state.lock().reverting_receipts = count;
    }

    /// Successfully submitted calls, in order.
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state.lock().calls.clone()
    }

    /// Every submission attempt, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    fn submit(&self, call: LedgerCall) -> Result<TxHandle, LedgerError> {
        let mut state = self.state.lock();
        state.attempts += 1;

        if state.fail_all || state.failing_submissions > 0 {
            state.failing_submissions = state.failing_submissions.saturating_sub(1);
            return Err(LedgerError::Submission(
                "simulated submission failure".to_string(),
            ));
        }

        state.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(state.nonce.to_be_bytes());
        hasher.update(format!("{:?}", call).as_bytes());
        let hash = format!("0x{}", hex::encode(hasher.finalize()));

        debug!(tx_hash = %hash, ?call, "simulated ledger accepted transaction");
        state.mined.insert(hash.clone(), call.gas_used());
        state.calls.push(call);
        Ok(TxHandle { hash })
    }
}

#[async_trait]
impl LedgerContract for SimulatedLedger {
    async fn settle(
        &self,
        policy_id: PolicyId,
        payout: u128,
        gas_price: u128,
    ) -> Result<TxHandle, LedgerError> {
        self.submit(LedgerCall::Settle {
            policy_id,
            payout,
            gas_price,
        })
    }

    async fn reject(
        &self,
        policy_id: PolicyId,
        reason: &str,
        gas_price: u128,
    ) -> Result<TxHandle, LedgerError> {
        self.submit(LedgerCall::Reject {
            policy_id,
            reason: reason.to_string(),
            gas_price,
        })
    }

    async fn challenge(
        &self,
        policy_id: PolicyId,
        evidence: &[u8],
    ) -> Result<TxHandle, LedgerError> {
        self.submit(LedgerCall::Challenge {
            policy_id,
            evidence: evidence.to_vec(),
        })
    }

    async fn wait_for_receipt(&self, tx: &TxHandle) -> Result<TxReceipt, LedgerError> {
        let mut state = self.state.lock();
        let gas_used = *state
            .mined
            .get(&tx.hash)
            .ok_or_else(|| LedgerError::UnknownTransaction(tx.hash.clone()))?;

        state.block_number += 1;
        let status = if state.reverting_receipts > 0 {
            state.reverting_receipts -= 1;
            TxStatus::Reverted
        } else {
            TxStatus::Success
        };

        Ok(TxReceipt {
            hash: tx.hash.clone(),
            status,
            gas_used,
            block_number: state.block_number,
        })
    }
}
