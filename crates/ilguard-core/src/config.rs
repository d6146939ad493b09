// Runtime configuration for every component.
//
// Durations are carried as integer seconds/milliseconds and wei amounts as
// gwei so the structures load cleanly from TOML and environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 1 gwei in wei.
pub const GWEI: u128 = 1_000_000_000;

const ETH_IN_GWEI: u64 = 1_000_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid consensus threshold {0}: must be >= 1")]
    InvalidThreshold(usize),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be > 0".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureSchemeKind {
    #[default]
    Ecdsa,
    Bls,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Minimum number of valid signatures for consensus.
    pub threshold: usize,
    pub session_timeout_secs: u64,
    /// Terminal sessions older than this are swept.
    pub session_retention_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            threshold: 2,
            session_timeout_secs: 300,
            session_retention_secs: 3600,
            cleanup_interval_secs: 60,
        }
    }
}

impl ConsensusConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold < 1 {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        require_positive("consensus.session_timeout_secs", self.session_timeout_secs)?;
        require_positive("consensus.cleanup_interval_secs", self.cleanup_interval_secs)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Maximum transactions attempted per cycle.
    pub batch_size: usize,
    pub interval_ms: u64,
    /// Total attempts before a settlement is dropped.
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_gas_price_gwei: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        SettlementConfig {
            batch_size: 10,
            interval_ms: 15_000,
            retry_attempts: 3,
            retry_delay_ms: 30_000,
            max_gas_price_gwei: 200,
        }
    }
}

impl SettlementConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Gas price ceiling in wei.
    pub fn max_gas_price(&self) -> u128 {
        self.max_gas_price_gwei as u128 * GWEI
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("settlement.batch_size", self.batch_size as u64)?;
        require_positive("settlement.interval_ms", self.interval_ms)?;
        require_positive("settlement.retry_attempts", self.retry_attempts as u64)?;
        require_positive("settlement.max_gas_price_gwei", self.max_gas_price_gwei)?;
        Ok(())
    }
}

/// Penalty per slashing reason, in gwei.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyTable {
    pub double_signing_gwei: u64,
    pub malicious_attestation_gwei: u64,
    pub challenge_failure_gwei: u64,
    pub invalid_signature_gwei: u64,
    pub unavailability_gwei: u64,
}

impl Default for PenaltyTable {
    fn default() -> Self {
        PenaltyTable {
            double_signing_gwei: 10 * ETH_IN_GWEI,
            malicious_attestation_gwei: 5 * ETH_IN_GWEI,
            challenge_failure_gwei: 2 * ETH_IN_GWEI,
            invalid_signature_gwei: ETH_IN_GWEI,
            unavailability_gwei: ETH_IN_GWEI / 200,
        }
    }
}

impl PenaltyTable {
    /// Severity order must hold: double-signing > malicious attestation >
    /// challenge failure > invalid signature > unavailability.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = [
            self.double_signing_gwei,
            self.malicious_attestation_gwei,
            self.challenge_failure_gwei,
            self.invalid_signature_gwei,
            self.unavailability_gwei,
        ];
        if ordered.windows(2).any(|pair| pair[0] <= pair[1]) {
            return Err(ConfigError::InvalidValue {
                field: "slashing.penalties",
                reason: "penalties must strictly decrease with severity".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlashingConfig {
    /// Response window granted to a challenged operator.
    pub challenge_period_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub min_slashing_amount_gwei: u64,
    /// Findings below this confidence are logged but not acted on.
    pub fraud_confidence_threshold: f64,
    pub max_challenges_per_operator: u32,
    pub challenge_cooldown_secs: u64,
    /// Payouts above this are flagged as a malicious attestation.
    pub suspicious_payout_gwei: u64,
    /// Per-operator depth of the double-signing history.
    pub history_depth: usize,
    /// Challenge submissions attempted before the challenge is reported as
    /// unsubmittable.
    pub ledger_retry_attempts: u32,
    pub ledger_retry_delay_ms: u64,
    pub penalties: PenaltyTable,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        SlashingConfig {
            challenge_period_secs: 86_400,
            expiry_sweep_interval_secs: 60,
            min_slashing_amount_gwei: ETH_IN_GWEI / 100,
            fraud_confidence_threshold: 0.8,
            max_challenges_per_operator: 3,
            challenge_cooldown_secs: 3600,
            suspicious_payout_gwei: 1_000 * ETH_IN_GWEI,
            history_depth: 1024,
            ledger_retry_attempts: 3,
            ledger_retry_delay_ms: 30_000,
            penalties: PenaltyTable::default(),
        }
    }
}

impl SlashingConfig {
    pub fn challenge_period(&self) -> Duration {
        Duration::from_secs(self.challenge_period_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn challenge_cooldown(&self) -> Duration {
        Duration::from_secs(self.challenge_cooldown_secs)
    }

    pub fn ledger_retry_delay(&self) -> Duration {
        Duration::from_millis(self.ledger_retry_delay_ms)
    }

    pub fn min_slashing_amount(&self) -> u128 {
        self.min_slashing_amount_gwei as u128 * GWEI
    }

    pub fn suspicious_payout(&self) -> u128 {
        self.suspicious_payout_gwei as u128 * GWEI
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("slashing.challenge_period_secs", self.challenge_period_secs)?;
        require_positive(
            "slashing.expiry_sweep_interval_secs",
            self.expiry_sweep_interval_secs,
        )?;
        require_positive(
            "slashing.max_challenges_per_operator",
            self.max_challenges_per_operator as u64,
        )?;
        require_positive("slashing.history_depth", self.history_depth as u64)?;
        require_positive(
            "slashing.ledger_retry_attempts",
            self.ledger_retry_attempts as u64,
        )?;
        if !(0.0..=1.0).contains(&self.fraud_confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "slashing.fraud_confidence_threshold",
                reason: format!("{} is outside [0, 1]", self.fraud_confidence_threshold),
            });
        }
        self.penalties.validate()
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub scheme: SignatureSchemeKind,
    /// Identity this node uses when it opens challenges.
    pub operator_id: String,
    pub log_level: String,
    pub consensus: ConsensusConfig,
    pub settlement: SettlementConfig,
    pub slashing: SlashingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            scheme: SignatureSchemeKind::Ecdsa,
            operator_id: "0x0000000000000000000000000000000000000000".to_string(),
            log_level: "info".to_string(),
            consensus: ConsensusConfig::default(),
            settlement: SettlementConfig::default(),
            slashing: SlashingConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operator_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "operator_id",
                reason: "cannot be empty".to_string(),
            });
        }
        self.consensus.validate()?;
        self.settlement.validate()?;
        self.slashing.validate()
    }
}
