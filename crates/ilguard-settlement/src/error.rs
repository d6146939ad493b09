use ilguard_core::{ConfigError, LedgerError};
use ilguard_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),
}
