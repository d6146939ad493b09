// CONSENSUS COORDINATOR
// Session-scoped threshold agreement over operator attestations.
//
// INVARIANTS:
// 1. At most one accepted signature per signer per session
// 2. Accepted signatures always carry the session's canonical message
// 3. A session leaves `Pending` exactly once; terminal states are absorbing
// 4. A ConsensusResult always has participants >= threshold
// 5. A timeout firing on a terminal session is a no-op

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use ilguard_core::{AttestationRequest, ConsensusConfig, OperatorId, RequestId, SignatureSchemeKind};
use ilguard_crypto::{AggregationError, Signature, SignatureAggregator};
use ilguard_scheduler::TaskScheduler;
use ilguard_telemetry::EventBus;

use crate::error::ConsensusError;
use crate::events::ConsensusEvent;
use crate::result::ConsensusResult;
use crate::session::{ConsensusSession, CoordinatorStats, SessionSnapshot, SessionStatus};

const STOP_REASON: &str = "coordinator stopped";

struct Inner {
    config: ConsensusConfig,
    aggregator: Arc<dyn SignatureAggregator>,
    sessions: Mutex<HashMap<RequestId, ConsensusSession>>,
    scheduler: TaskScheduler,
    events: EventBus<ConsensusEvent>,
    running: AtomicBool,
}

/// Collects operator signatures per attestation request and decides when
/// threshold consensus is reached.
///
/// Cloning is cheap and every clone shares the same sessions.
#[derive(Clone)]
pub struct ConsensusCoordinator {
    inner: Arc<Inner>,
}

impl ConsensusCoordinator {
    /// The aggregator's threshold is set from `config.threshold`.
    pub fn new(
        config: ConsensusConfig,
        aggregator: Arc<dyn SignatureAggregator>,
    ) -> Result<Self, ConsensusError> {
        config.validate()?;
        aggregator.update_threshold(config.threshold)?;

        Ok(ConsensusCoordinator {
            inner: Arc::new(Inner {
                config,
                aggregator,
                sessions: Mutex::new(HashMap::new()),
                scheduler: TaskScheduler::new("consensus"),
                events: EventBus::new("consensus"),
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ConsensusEvent> {
        self.inner.events.subscribe()
    }

    pub fn scheme(&self) -> SignatureSchemeKind {
        self.inner.aggregator.scheme()
    }

    pub fn aggregator(&self) -> Arc<dyn SignatureAggregator> {
        self.inner.aggregator.clone()
    }

    /// Begin the periodic sweep of terminal sessions.
    pub fn start(&self) -> Result<(), ConsensusError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let scheduled = self
            .inner
            .scheduler
            .schedule_periodic(self.inner.config.cleanup_interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.cleanup_expired_sessions();
                    }
                }
                .boxed()
            });

        if let Err(e) = scheduled {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        info!(
            threshold = self.threshold(),
            scheme = ?self.scheme(),
            "Consensus coordinator started"
        );
        Ok(())
    }

    /// Fail every pending session, cancel all timers, drop all state and
    /// release subscribers.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);

        {
            let mut sessions = inner.sessions.lock();
            for session in sessions.values_mut().filter(|s| s.is_pending()) {
                inner.fail(session, STOP_REASON.to_string(), Vec::new());
            }
            sessions.clear();
        }

        inner.scheduler.cancel_all();
        inner.events.close();
        info!("Consensus coordinator stopped");
    }

    /// Open a session for `request`. Fails if one already exists for the
    /// same request id.
    pub fn start_session(
        &self,
        request: AttestationRequest,
        timeout: Option<Duration>,
    ) -> Result<(), ConsensusError> {
        let inner = &self.inner;
        let timeout = timeout.unwrap_or_else(|| inner.config.session_timeout());
        let request_id = request.id.clone();

        let mut sessions = inner.sessions.lock();
        if sessions.contains_key(&request_id) {
            warn!(request_id = %request_id, "Consensus session already exists");
            return Err(ConsensusError::SessionExists(request_id));
        }

        let weak = Arc::downgrade(&self.inner);
        let timeout_id = request_id.clone();
        let task = inner.scheduler.schedule_once(timeout, async move {
            if let Some(inner) = weak.upgrade() {
                inner.handle_timeout(&timeout_id);
            }
        })?;

        let mut session = ConsensusSession::new(request, timeout);
        session.timeout_task = Some(task);
        info!(
            request_id = %request_id,
            policy_id = %session.request.policy_id,
            timeout_secs = timeout.as_secs(),
            "Consensus session started"
        );
        sessions.insert(request_id, session);
        Ok(())
    }

    /// Record one operator's signature. Returns `false`, leaving the
    /// session untouched, when the session is missing or terminal, the
    /// signer already submitted, or the signature is over another message
    /// or scheme.
    pub fn submit_signature(&self, request_id: &RequestId, signature: Signature) -> bool {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock();
        let signer = signature.signer().clone();

        let Some(session) = sessions.get_mut(request_id) else {
            warn!(request_id = %request_id, signer = %signer, "No consensus session for signature");
            return false;
        };
        if !session.is_pending() {
            warn!(
                request_id = %request_id,
                signer = %signer,
                status = ?session.status,
                "Signature for terminal session rejected"
            );
            return false;
        }
        if signature.scheme() != inner.aggregator.scheme() {
            warn!(request_id = %request_id, signer = %signer, "Signature scheme mismatch");
            return false;
        }
        if signature.message() != session.message.as_slice() {
            warn!(request_id = %request_id, signer = %signer, "Signature message mismatch");
            return false;
        }
        if session.signatures.contains_key(&signer) {
            warn!(request_id = %request_id, signer = %signer, "Duplicate signature rejected");
            return false;
        }

        session.signatures.insert(signer.clone(), signature);
        let threshold = inner.aggregator.threshold();
        debug!(
            request_id = %request_id,
            signer = %signer,
            count = session.signatures.len(),
            threshold,
            "Signature accepted"
        );
        inner.events.emit(ConsensusEvent::SignatureReceived {
            request_id: request_id.clone(),
            signer,
            signature_count: session.signatures.len(),
            threshold,
        });

        inner.evaluate(session);
        true
    }

    pub fn session(&self, request_id: &RequestId) -> Option<SessionSnapshot> {
        self.inner
            .sessions
            .lock()
            .get(request_id)
            .map(ConsensusSession::snapshot)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let sessions = self.inner.sessions.lock();
        let mut stats = CoordinatorStats {
            total: sessions.len(),
            ..Default::default()
        };
        for session in sessions.values() {
            match session.status {
                SessionStatus::Pending => stats.pending += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Timeout => stats.timed_out += 1,
            }
        }
        stats
    }

    pub fn threshold(&self) -> usize {
        self.inner.aggregator.threshold()
    }

    /// Values below 1 are rejected and the previous threshold kept.
    /// Pending sessions are re-evaluated against the new value, so a
    /// lowered threshold completes rounds that already meet it.
    pub fn update_threshold(&self, threshold: usize) -> Result<(), ConsensusError> {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock();
        let previous = inner.aggregator.threshold();
        inner.aggregator.update_threshold(threshold)?;
        info!(previous, threshold, "Consensus threshold updated");

        for session in sessions.values_mut().filter(|s| s.is_pending()) {
            inner.evaluate(session);
        }
        Ok(())
    }

    /// Remove terminal sessions older than the retention window.
    pub fn cleanup_expired_sessions(&self) -> usize {
        self.inner.cleanup_expired_sessions()
    }
}

impl Inner {
    fn evaluate(&self, session: &mut ConsensusSession) {
        let threshold = self.aggregator.threshold();
        if session.signatures.len() < threshold {
            return;
        }

        let signatures: Vec<Signature> = session.signatures.values().cloned().collect();
        let aggregated = match self.aggregator.aggregate(&signatures, &session.message) {
            Ok(aggregated) => aggregated,
            Err(AggregationError::NoValidSignatures) => {
                let everyone = session.signatures.keys().cloned().collect();
                self.fail(session, "no valid signatures".to_string(), everyone);
                return;
            }
            Err(e) => {
                self.fail(session, format!("aggregation failed: {}", e), Vec::new());
                return;
            }
        };

        let verification = self.aggregator.verify_aggregated(&aggregated);
        if !verification.invalid_signers.is_empty() {
            self.fail(
                session,
                "invalid signatures".to_string(),
                verification.invalid_signers,
            );
            return;
        }
        if !verification.consensus_reached {
            self.fail(
                session,
                format!(
                    "aggregate verification failed ({} valid, threshold {})",
                    verification.valid_count, threshold
                ),
                Vec::new(),
            );
            return;
        }

        let participants = aggregated.signers();
        let result = ConsensusResult {
            request_id: session.request.id.clone(),
            policy_id: session.request.policy_id,
            approved: session.request.is_approved(),
            payout: session.request.payout,
            aggregated_signature: aggregated,
            participants,
            threshold,
        };

        session.status = SessionStatus::Completed;
        session.result = Some(result.clone());
        self.cancel_timeout(session);
        info!(
            request_id = %result.request_id,
            policy_id = %result.policy_id,
            participants = result.participants.len(),
            approved = result.approved,
            "Consensus reached"
        );
        self.events.emit(ConsensusEvent::ConsensusReached { result });
    }

    fn fail(&self, session: &mut ConsensusSession, reason: String, invalid_signers: Vec<OperatorId>) {
        session.status = SessionStatus::Failed;
        session.failure_reason = Some(reason.clone());
        session.invalid_signers = invalid_signers.clone();
        self.cancel_timeout(session);
        warn!(
            request_id = %session.request.id,
            reason = %reason,
            invalid = invalid_signers.len(),
            "Consensus failed"
        );
        self.events.emit(ConsensusEvent::ConsensusFailed {
            request_id: session.request.id.clone(),
            reason,
            invalid_signers,
        });
    }

    fn cancel_timeout(&self, session: &mut ConsensusSession) {
        if let Some(task) = session.timeout_task.take() {
            self.scheduler.cancel(task);
        }
    }

    fn handle_timeout(&self, request_id: &RequestId) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(request_id) else {
            return;
        };
        session.timeout_task = None;
        if !session.is_pending() {
            return;
        }

        session.status = SessionStatus::Timeout;
        let collected = session.signatures.len();
        warn!(
            request_id = %request_id,
            signatures_collected = collected,
            "Consensus session timed out"
        );
        self.events.emit(ConsensusEvent::ConsensusTimeout {
            request_id: request_id.clone(),
            signatures_collected: collected,
        });
    }

    fn cleanup_expired_sessions(&self) -> usize {
        let retention = self.config.session_retention();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| {
            !(session.status.is_terminal() && session.created_at.elapsed() >= retention)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "Swept expired consensus sessions");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilguard_core::PolicyId;
    use ilguard_crypto::{EcdsaAggregator, EcdsaOperatorKey};

    fn coordinator(threshold: usize) -> ConsensusCoordinator {
        let config = ConsensusConfig {
            threshold,
            ..Default::default()
        };
        let aggregator = Arc::new(EcdsaAggregator::new(threshold).unwrap());
        ConsensusCoordinator::new(config, aggregator).unwrap()
    }

    fn request(id: &str) -> AttestationRequest {
        AttestationRequest::new(id, PolicyId(1), vec![0xaa; 8], 1_000, 1_700_000_000)
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let coordinator = coordinator(2);
        coordinator.start_session(request("r1"), None).unwrap();
        assert!(matches!(
            coordinator.start_session(request("r1"), None),
            Err(ConsensusError::SessionExists(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_without_session() {
        let coordinator = coordinator(1);
        let key = EcdsaOperatorKey::generate();
        let sig = key.sign_request(&request("r1")).unwrap();
        assert!(!coordinator.submit_signature(&"r1".into(), sig));
    }

    #[tokio::test]
    async fn test_duplicate_signer_rejected() {
        let coordinator = coordinator(3);
        let request = request("r1");
        coordinator.start_session(request.clone(), None).unwrap();

        let key = EcdsaOperatorKey::generate();
        let sig = key.sign_request(&request).unwrap();
        assert!(coordinator.submit_signature(&request.id, sig.clone()));
        assert!(!coordinator.submit_signature(&request.id, sig));
        assert_eq!(coordinator.session(&request.id).unwrap().signers.len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_reached_completes_session() {
        let coordinator = coordinator(2);
        let mut events = coordinator.subscribe();
        let request = request("r1");
        coordinator.start_session(request.clone(), None).unwrap();

        for _ in 0..2 {
            let key = EcdsaOperatorKey::generate();
            assert!(coordinator.submit_signature(&request.id, key.sign_request(&request).unwrap()));
        }

        let snapshot = coordinator.session(&request.id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Completed);
        let result = snapshot.result.unwrap();
        assert!(result.approved);
        assert_eq!(result.participants.len(), 2);

        let mut reached = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConsensusEvent::ConsensusReached { .. }) {
                reached += 1;
            }
        }
        assert_eq!(reached, 1);
    }

    #[tokio::test]
    async fn test_update_threshold_keeps_previous_on_error() {
        let coordinator = coordinator(2);
        assert!(coordinator.update_threshold(0).is_err());
        assert_eq!(coordinator.threshold(), 2);
        coordinator.update_threshold(3).unwrap();
        assert_eq!(coordinator.threshold(), 3);
    }

    #[tokio::test]
    async fn test_lowered_threshold_completes_pending_session() {
        let coordinator = coordinator(3);
        let mut events = coordinator.subscribe();
        let request = request("r1");
        coordinator.start_session(request.clone(), None).unwrap();
        for _ in 0..2 {
            let key = EcdsaOperatorKey::generate();
            assert!(coordinator.submit_signature(&request.id, key.sign_request(&request).unwrap()));
        }
        assert_eq!(coordinator.session(&request.id).unwrap().status, SessionStatus::Pending);

        coordinator.update_threshold(2).unwrap();

        let snapshot = coordinator.session(&request.id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(snapshot.result.unwrap().threshold, 2);

        let mut reached = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConsensusEvent::ConsensusReached { .. }) {
                reached += 1;
            }
        }
        assert_eq!(reached, 1);
    }

    #[tokio::test]
    async fn test_stop_fails_pending_sessions() {
        let coordinator = coordinator(2);
        let mut events = coordinator.subscribe();
        coordinator.start_session(request("r1"), None).unwrap();
        coordinator.stop();

        match events.recv().await {
            Some(ConsensusEvent::ConsensusFailed { reason, .. }) => {
                assert_eq!(reason, STOP_REASON)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events.recv().await, None);
        assert_eq!(coordinator.stats().total, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ConsensusConfig {
            threshold: 0,
            ..Default::default()
        };
        let aggregator = Arc::new(EcdsaAggregator::new(1).unwrap());
        assert!(matches!(
            ConsensusCoordinator::new(config, aggregator),
            Err(ConsensusError::Config(_))
        ));
    }
}
