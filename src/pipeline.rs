// CLAIM PIPELINE
//
// Wires the consensus coordinator to its two consumers. Every completed
// round is queued for settlement and analyzed for fraud; every failed
// round is checked for operators that submitted invalid signatures.
//
// INVARIANTS:
// 1. Each consensus outcome reaches the consumers at most once
// 2. A request is forgotten once its round reaches a terminal state

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ilguard_consensus::{
    ConsensusCoordinator, ConsensusError, ConsensusEvent, SlashingError, SlashingManager,
};
use ilguard_core::{
    AttestationRequest, GasOracle, LedgerContract, OperatorId, RequestId, ServiceConfig,
};
use ilguard_crypto::{Signature, SignatureAggregator};
use ilguard_settlement::{SettlementDispatcher, SettlementError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Slashing(#[from] SlashingError),
}

struct Consumers {
    coordinator: ConsensusCoordinator,
    dispatcher: SettlementDispatcher,
    slashing: SlashingManager,
    requests: Mutex<HashMap<RequestId, AttestationRequest>>,
}

pub struct ClaimPipeline {
    consumers: Arc<Consumers>,
    events: Mutex<Option<UnboundedReceiver<ConsensusEvent>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ClaimPipeline {
    pub fn new(
        config: &ServiceConfig,
        aggregator: Arc<dyn SignatureAggregator>,
        ledger: Arc<dyn LedgerContract>,
        gas_oracle: Arc<dyn GasOracle>,
    ) -> Result<Self, PipelineError> {
        let coordinator = ConsensusCoordinator::new(config.consensus.clone(), aggregator.clone())?;
        let dispatcher =
            SettlementDispatcher::new(config.settlement.clone(), ledger.clone(), gas_oracle)?;
        let slashing = SlashingManager::new(
            config.slashing.clone(),
            OperatorId::new(&config.operator_id),
            aggregator,
            ledger,
        )?;
        let events = coordinator.subscribe();

        Ok(ClaimPipeline {
            consumers: Arc::new(Consumers {
                coordinator,
                dispatcher,
                slashing,
                requests: Mutex::new(HashMap::new()),
            }),
            events: Mutex::new(Some(events)),
            forwarder: Mutex::new(None),
        })
    }

    pub fn coordinator(&self) -> &ConsensusCoordinator {
        &self.consumers.coordinator
    }

    pub fn dispatcher(&self) -> &SettlementDispatcher {
        &self.consumers.dispatcher
    }

    pub fn slashing(&self) -> &SlashingManager {
        &self.consumers.slashing
    }

    /// Start every component's background tasks and the event forwarder.
    /// Calling it again is a no-op.
    pub fn start(&self) -> Result<(), PipelineError> {
        let Some(mut events) = self.events.lock().take() else {
            return Ok(());
        };

        self.consumers.coordinator.start()?;
        self.consumers.dispatcher.start()?;
        self.consumers.slashing.start()?;

        let consumers = self.consumers.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                consumers.forward(event).await;
            }
            debug!("Consensus event stream closed");
        });
        *self.forwarder.lock() = Some(handle);
        info!("Claim pipeline started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
        self.consumers.coordinator.stop();
        self.consumers.dispatcher.stop();
        self.consumers.slashing.stop();
        self.consumers.requests.lock().clear();
        info!("Claim pipeline stopped");
    }

    /// Open a consensus round for `request`.
    pub fn submit_request(
        &self,
        request: AttestationRequest,
        timeout: Option<Duration>,
    ) -> Result<(), PipelineError> {
        self.consumers
            .coordinator
            .start_session(request.clone(), timeout)?;
        // No signature can complete the round before this insert.
        self.consumers
            .requests
            .lock()
            .insert(request.id.clone(), request);
        Ok(())
    }

    pub fn submit_signature(&self, request_id: &RequestId, signature: Signature) -> bool {
        self.consumers.coordinator.submit_signature(request_id, signature)
    }
}

impl Drop for ClaimPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

impl Consumers {
    async fn forward(&self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::SignatureReceived { .. } => {}
            ConsensusEvent::ConsensusReached { result } => {
                let Some(request) = self.requests.lock().remove(&result.request_id) else {
                    warn!(request_id = %result.request_id, "Result for unknown request");
                    return;
                };
                self.dispatcher.enqueue(&result);

                let signatures = self
                    .coordinator
                    .session(&result.request_id)
                    .map(|s| s.signatures)
                    .unwrap_or_default();
                self.slashing
                    .process_consensus_result(&result, &request, &signatures)
                    .await;
            }
            ConsensusEvent::ConsensusFailed {
                request_id,
                invalid_signers,
                ..
            } => {
                let Some(request) = self.requests.lock().remove(&request_id) else {
                    return;
                };
                if !invalid_signers.is_empty() {
                    self.slashing
                        .process_consensus_failure(&request, &invalid_signers)
                        .await;
                }
            }
            ConsensusEvent::ConsensusTimeout { request_id, .. } => {
                self.requests.lock().remove(&request_id);
            }
        }
    }
}
