//! Core data model for the ILGuard attestation coordinator.
//!
//! Everything the coordinator, the settlement dispatcher and the slashing
//! subsystem exchange lives here: identifiers, the attestation request and
//! its canonical signing message, configuration, and the interfaces of the
//! external ledger and gas-oracle collaborators.

pub mod config;
pub mod ledger;
pub mod message;
pub mod types;

pub use config::{
    ConfigError, ConsensusConfig, PenaltyTable, ServiceConfig, SettlementConfig,
    SignatureSchemeKind, SlashingConfig, GWEI,
};
pub use ledger::{
    FixedGasOracle, GasOracle, LedgerCall, LedgerContract, LedgerError, SimulatedLedger, TxHandle,
    TxReceipt, TxStatus,
};
pub use message::{canonical_message, keccak256, ATTESTATION_DOMAIN};
pub use types::{AttestationRequest, OperatorId, PolicyId, RequestId};
