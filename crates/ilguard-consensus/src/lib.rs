//! Threshold consensus over operator attestations and the slashing
//! subsystem that polices it.
//!
//! [`ConsensusCoordinator`] owns one session per attestation request and
//! emits a [`ConsensusResult`] once enough valid signatures arrive.
//! [`SlashingManager`] consumes those results, looks for fraud, and runs
//! the challenge/response lifecycle that ends in slashing.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod result;
pub mod session;
pub mod slashing;

pub use coordinator::ConsensusCoordinator;
pub use error::{ConsensusError, SlashingError};
pub use events::ConsensusEvent;
pub use result::ConsensusResult;
pub use session::{CoordinatorStats, SessionSnapshot, SessionStatus};
pub use slashing::{
    Challenge, ChallengeEvidence, ChallengeResolution, ChallengeResponse, ChallengeStatus,
    FraudDetectionResult, FraudDetector, Severity, SignatureHistory, SlashingEngine,
    SlashingEvent, SlashingManager, SlashingManagerEvent, SlashingReason, SlashingStatistics,
};
