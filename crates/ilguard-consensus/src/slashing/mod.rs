//! Fraud detection, challenge lifecycle and slashing.

mod challenge;
mod events;
mod fraud_detector;
mod history;
mod manager;
mod slashing_engine;

pub use challenge::{
    Challenge, ChallengeEvidence, ChallengeResolution, ChallengeResponse, ChallengeStatus,
    SlashingReason, MIN_RESPONSE_EVIDENCE_LEN,
};
pub use events::SlashingManagerEvent;
pub use fraud_detector::{FraudDetectionResult, FraudDetector, Severity};
pub use history::{SignatureHistory, SignedEntry};
pub use manager::{SlashingManager, SlashingStatistics};
pub use slashing_engine::{SlashingEngine, SlashingEvent};
