use ilguard_core::{ConfigError, LedgerError, RequestId};
use ilguard_crypto::AggregationError;
use ilguard_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Consensus session already exists for request {0}")]
    SessionExists(RequestId),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("Scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Error)]
pub enum SlashingError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Slash amount {amount} below minimum {minimum}")]
    BelowMinimum { amount: u128, minimum: u128 },

    #[error("Evidence encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
