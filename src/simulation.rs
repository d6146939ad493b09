//! In-process end-to-end round against the simulated ledger.
//!
//! Generates operator keys, runs one attestation request through consensus,
//! then drives settlement cycles until the claim is confirmed or dropped.

use std::sync::Arc;
use std::time::Duration;

use ilguard_consensus::SessionStatus;
use ilguard_core::{
    AttestationRequest, FixedGasOracle, LedgerCall, OperatorId, PolicyId, ServiceConfig,
    SignatureSchemeKind, SimulatedLedger, GWEI,
};
use ilguard_crypto::{
    AggregationError, BlsAggregator, BlsOperatorKey, CryptoError, EcdsaAggregator,
    EcdsaOperatorKey, Signature, SignatureAggregator,
};
use ilguard_settlement::{SettlementEvent, SettlementKey};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::pipeline::{ClaimPipeline, PipelineError};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const SIMULATED_GAS_PRICE: u128 = 30 * GWEI;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("At least one operator is required")]
    NoOperators,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Aggregator setup failed: {0}")]
    Aggregator(String),

    #[error("Consensus round did not finish within {0:?}")]
    Stalled(Duration),
}

#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub operators: usize,
    pub threshold: usize,
    /// Wei.
    pub payout: u128,
    pub scheme: SignatureSchemeKind,
    /// Number of ledger submissions that fail before the ledger recovers.
    pub fail_submissions: u32,
    pub session_timeout: Duration,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            operators: 3,
            threshold: 2,
            payout: GWEI,
            scheme: SignatureSchemeKind::Ecdsa,
            fail_submissions: 0,
            session_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub request_id: String,
    pub scheme: SignatureSchemeKind,
    pub consensus: SessionStatus,
    pub participants: Vec<OperatorId>,
    pub approved: Option<bool>,
    pub settled: bool,
    pub settlement_attempts: usize,
    pub settlement_events: Vec<SettlementEvent>,
    pub ledger_calls: usize,
}

enum OperatorKey {
    Ecdsa(EcdsaOperatorKey),
    Bls(BlsOperatorKey),
}

impl OperatorKey {
    fn sign(&self, request: &AttestationRequest) -> Result<Signature, CryptoError> {
        match self {
            OperatorKey::Ecdsa(key) => key.sign_request(request),
            OperatorKey::Bls(key) => Ok(key.sign_request(request)),
        }
    }
}

fn operator_keys(
    params: &SimulationParams,
) -> Result<(Vec<OperatorKey>, Arc<dyn SignatureAggregator>), SimulationError> {
    let aggregator_error = |e: AggregationError| SimulationError::Aggregator(e.to_string());
    match params.scheme {
        SignatureSchemeKind::Ecdsa => {
            let keys = (0..params.operators)
                .map(|_| OperatorKey::Ecdsa(EcdsaOperatorKey::generate()))
                .collect();
            let aggregator = EcdsaAggregator::new(params.threshold).map_err(aggregator_error)?;
            Ok((keys, Arc::new(aggregator)))
        }
        SignatureSchemeKind::Bls => {
            let aggregator = BlsAggregator::new(params.threshold).map_err(aggregator_error)?;
            let mut keys = Vec::with_capacity(params.operators);
            for i in 0..params.operators {
                let key = BlsOperatorKey::generate(format!("bls-operator-{}", i))?;
                aggregator.register_operator(key.operator_id().clone(), &key.public_key_bytes())?;
                keys.push(OperatorKey::Bls(key));
            }
            Ok((keys, Arc::new(aggregator)))
        }
    }
}

/// Run one attestation request from signing to settlement.
pub async fn run(
    base: &ServiceConfig,
    params: SimulationParams,
) -> Result<SimulationReport, SimulationError> {
    if params.operators == 0 {
        return Err(SimulationError::NoOperators);
    }

    let mut config = base.clone();
    config.scheme = params.scheme;
    config.consensus.threshold = params.threshold;

    let (keys, aggregator) = operator_keys(&params)?;
    let ledger = Arc::new(SimulatedLedger::new());
    ledger.fail_next_submissions(params.fail_submissions);

    let pipeline = ClaimPipeline::new(
        &config,
        aggregator,
        ledger.clone(),
        Arc::new(FixedGasOracle::new(SIMULATED_GAS_PRICE)),
    )?;
    let mut settlement_rx = pipeline.dispatcher().subscribe();
    pipeline.start()?;

    let request = AttestationRequest::new(
        "sim-claim-1",
        PolicyId(1),
        b"simulated-tee-proof".to_vec(),
        params.payout,
        0,
    );
    pipeline.submit_request(request.clone(), Some(params.session_timeout))?;
    for key in &keys {
        pipeline.submit_signature(&request.id, key.sign(&request)?);
    }

    let wait = params.session_timeout + Duration::from_secs(1);
    let status = tokio::time::timeout(wait, async {
        loop {
            match pipeline.coordinator().session(&request.id) {
                Some(snapshot) if snapshot.status.is_terminal() => return snapshot,
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    })
    .await
    .map_err(|_| SimulationError::Stalled(wait))?;
    info!(request_id = %request.id, status = ?status.status, "Simulated consensus finished");

    let key = SettlementKey::new(request.policy_id, request.id.clone());
    if status.status == SessionStatus::Completed {
        // Let the forwarder hand the result to the dispatcher.
        tokio::time::timeout(wait, async {
            while pipeline.dispatcher().get(&key).is_none() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| SimulationError::Stalled(wait))?;

        while pipeline.dispatcher().get(&key).is_some() {
            if pipeline.dispatcher().process_batch().await.is_none() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    let mut settlement_events = Vec::new();
    while let Ok(event) = settlement_rx.try_recv() {
        settlement_events.push(event);
    }
    let settled = settlement_events
        .iter()
        .any(|e| matches!(e, SettlementEvent::SettlementConfirmed { .. }));
    let settlement_attempts = settlement_events
        .iter()
        .filter(|e| matches!(e, SettlementEvent::SettlementInitiated { .. }))
        .count();
    let ledger_calls = ledger
        .calls()
        .iter()
        .filter(|c| !matches!(c, LedgerCall::Challenge { .. }))
        .count();
    let participants = match &status.result {
        Some(result) => result.participants.clone(),
        None => status.signers.clone(),
    };

    pipeline.stop();

    Ok(SimulationReport {
        request_id: request.id.to_string(),
        scheme: params.scheme,
        consensus: status.status,
        participants,
        approved: status.result.as_ref().map(|r| r.approved),
        settled,
        settlement_attempts,
        settlement_events,
        ledger_calls,
    })
}
