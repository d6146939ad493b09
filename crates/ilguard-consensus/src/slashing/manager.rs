// SLASHING MANAGER
// Challenge lifecycle: creation, response, expiry, resolution, slashing.
//
// INVARIANTS:
// 1. A refused challenge has no side effects
// 2. An accepted challenge increments the target's counter exactly once
// 3. A pending challenge past its deadline is upheld
// 4. A late response counts as no response
// 5. Ledger results are applied only if the challenge still exists
// 6. Challenge ids are unique per manager
// 7. Stopping cancels every pending challenge without slashing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ilguard_core::{AttestationRequest, LedgerContract, OperatorId, SlashingConfig};
use ilguard_crypto::{Signature, SignatureAggregator};
use ilguard_scheduler::TaskScheduler;
use ilguard_telemetry::EventBus;

use crate::error::SlashingError;
use crate::result::ConsensusResult;
use crate::slashing::challenge::{
    Challenge, ChallengeEvidence, ChallengeResolution, ChallengeResponse, ChallengeStatus,
};
use crate::slashing::events::SlashingManagerEvent;
use crate::slashing::fraud_detector::{FraudDetectionResult, FraudDetector};
use crate::slashing::history::SignatureHistory;
use crate::slashing::slashing_engine::{SlashingEngine, SlashingEvent};

const STOP_REASON: &str = "slashing manager stopped";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingStatistics {
    pub total_challenges: usize,
    pub pending: usize,
    pub upheld: usize,
    pub dismissed: usize,
    pub expired: usize,
    pub cancelled: usize,
    /// Wei.
    pub total_slashed: u128,
    pub slashing_events: usize,
}

struct State {
    challenges: HashMap<String, Challenge>,
    /// Challenges ever accepted against each operator.
    challenge_counts: HashMap<OperatorId, u32>,
    last_challenge_at: HashMap<OperatorId, Instant>,
    engine: SlashingEngine,
    history: SignatureHistory,
    next_nonce: u64,
}

struct Inner {
    config: SlashingConfig,
    operator_id: OperatorId,
    ledger: Arc<dyn LedgerContract>,
    detector: FraudDetector,
    state: Mutex<State>,
    scheduler: TaskScheduler,
    events: EventBus<SlashingManagerEvent>,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct SlashingManager {
    inner: Arc<Inner>,
}

impl SlashingManager {
    /// `operator_id` is the local identity used as challenger for
    /// automatically opened challenges.
    pub fn new(
        config: SlashingConfig,
        operator_id: OperatorId,
        aggregator: Arc<dyn SignatureAggregator>,
        ledger: Arc<dyn LedgerContract>,
    ) -> Result<Self, SlashingError> {
        config.validate()?;

        let state = State {
            challenges: HashMap::new(),
            challenge_counts: HashMap::new(),
            last_challenge_at: HashMap::new(),
            engine: SlashingEngine::new(config.penalties.clone(), config.min_slashing_amount()),
            history: SignatureHistory::new(config.history_depth),
            next_nonce: 0,
        };
        let detector = FraudDetector::new(aggregator, config.suspicious_payout());

        Ok(SlashingManager {
            inner: Arc::new(Inner {
                config,
                operator_id,
                ledger,
                detector,
                state: Mutex::new(state),
                scheduler: TaskScheduler::new("slashing"),
                events: EventBus::new("slashing"),
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SlashingManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn operator_id(&self) -> &OperatorId {
        &self.inner.operator_id
    }

    /// Begin the periodic expiry sweep.
    pub fn start(&self) -> Result<(), SlashingError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let scheduled = self.inner.scheduler.schedule_periodic(
            self.inner.config.expiry_sweep_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire_overdue_challenges();
                    }
                }
                .boxed()
            },
        );
        if let Err(e) = scheduled {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        info!(operator = %self.inner.operator_id, "Slashing manager started");
        Ok(())
    }

    /// Cancel the sweep and pending ledger retries, close every pending
    /// challenge as cancelled, then release subscribers.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        inner.scheduler.cancel_all();

        let cancelled = {
            let mut state = inner.state.lock();
            let mut cancelled = 0;
            for challenge in state.challenges.values_mut().filter(|c| c.is_pending()) {
                challenge.status = ChallengeStatus::Cancelled;
                inner.events.emit(SlashingManagerEvent::ChallengeCancelled {
                    challenge_id: challenge.id.clone(),
                    target: challenge.target.clone(),
                    reason: STOP_REASON.to_string(),
                });
                cancelled += 1;
            }
            state.history.clear();
            cancelled
        };

        inner.events.close();
        info!(cancelled, "Slashing manager stopped");
    }

    /// Run fraud heuristics over a result without acting on them. Valid
    /// signatures are recorded in the double-signing history.
    pub fn analyze_fraud(
        &self,
        result: &ConsensusResult,
        request: &AttestationRequest,
        signatures: &[Signature],
    ) -> Vec<FraudDetectionResult> {
        let mut state = self.inner.state.lock();
        self.inner
            .detector
            .analyze(result, request, signatures, &mut state.history)
    }

    /// Analyze a completed round and challenge every operator implicated
    /// with sufficient confidence.
    pub async fn process_consensus_result(
        &self,
        result: &ConsensusResult,
        request: &AttestationRequest,
        signatures: &[Signature],
    ) -> Vec<FraudDetectionResult> {
        let findings = self.analyze_fraud(result, request, signatures);
        self.act_on_findings(request, &findings).await;
        findings
    }

    /// Challenge operators whose signatures were rejected by consensus.
    pub async fn process_consensus_failure(
        &self,
        request: &AttestationRequest,
        invalid_signers: &[OperatorId],
    ) -> Vec<FraudDetectionResult> {
        let findings = self.inner.detector.invalid_signers(request, invalid_signers);
        self.act_on_findings(request, &findings).await;
        findings
    }

    async fn act_on_findings(&self, request: &AttestationRequest, findings: &[FraudDetectionResult]) {
        let local = self.inner.operator_id.clone();
        for finding in findings {
            if finding.confidence < self.inner.config.fraud_confidence_threshold {
                debug!(
                    operator = %finding.operator,
                    reason = finding.reason.as_str(),
                    confidence = finding.confidence,
                    "Finding below confidence threshold"
                );
                continue;
            }

            warn!(
                request_id = %request.id,
                operator = %finding.operator,
                reason = finding.reason.as_str(),
                severity = ?finding.severity,
                confidence = finding.confidence,
                "Fraud detected"
            );
            self.inner.events.emit(SlashingManagerEvent::FraudDetected {
                request_id: request.id.clone(),
                finding: finding.clone(),
            });

            if finding.operator == local {
                continue;
            }
            self.create_challenge(&local, &finding.operator, finding.to_challenge_evidence(request))
                .await;
        }
    }

    /// Open a challenge against `target`. Refused with `None` and no side
    /// effects while the target is in cooldown or already at the cap of
    /// outstanding challenges.
    pub async fn create_challenge(
        &self,
        challenger: &OperatorId,
        target: &OperatorId,
        evidence: ChallengeEvidence,
    ) -> Option<Challenge> {
        let inner = &self.inner;
        let challenge = {
            let mut state = inner.state.lock();
            let now = Instant::now();

            if let Some(last) = state.last_challenge_at.get(target) {
                if now.duration_since(*last) < inner.config.challenge_cooldown() {
                    warn!(target = %target, "Challenge refused: operator in cooldown");
                    return None;
                }
            }

            let outstanding = state
                .challenges
                .values()
                .filter(|c| c.is_pending() && &c.target == target)
                .count();
            if outstanding >= inner.config.max_challenges_per_operator as usize {
                warn!(
                    target = %target,
                    outstanding,
                    "Challenge refused: too many outstanding challenges"
                );
                return None;
            }

            let created_at_ms = chrono::Utc::now().timestamp_millis();
            let nonce = state.next_nonce;
            state.next_nonce += 1;
            let id = challenge_id(challenger, target, &evidence, created_at_ms, nonce);

            let challenge = Challenge {
                id: id.clone(),
                challenger: challenger.clone(),
                target: target.clone(),
                evidence,
                status: ChallengeStatus::Pending,
                created_at_ms,
                deadline: now + inner.config.challenge_period(),
                response: None,
                resolution: None,
                ledger_tx: None,
            };

            state.challenges.insert(id.clone(), challenge.clone());
            *state.challenge_counts.entry(target.clone()).or_insert(0) += 1;
            state.last_challenge_at.insert(target.clone(), now);

            info!(
                challenge_id = %id,
                challenger = %challenger,
                target = %target,
                policy_id = %challenge.policy_id(),
                reason = challenge.evidence.reason.as_str(),
                "Challenge created"
            );
            inner.events.emit(SlashingManagerEvent::ChallengeCreated {
                challenge_id: id,
                challenger: challenger.clone(),
                target: target.clone(),
                policy_id: challenge.policy_id(),
                reason: challenge.evidence.reason,
            });
            challenge
        };

        Some(inner.submit_challenge(challenge, 1).await)
    }

    /// Submit the target's response. Returns `false` for unknown, settled or
    /// overdue challenges; an overdue one is upheld on the spot.
    pub fn respond_to_challenge(&self, challenge_id: &str, response: &str) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        let Some(challenge) = state.challenges.get(challenge_id) else {
            warn!(challenge_id, "Response to unknown challenge");
            return false;
        };
        if !challenge.is_pending() {
            warn!(challenge_id, status = ?challenge.status, "Response to settled challenge");
            return false;
        }
        if Instant::now() >= challenge.deadline {
            warn!(challenge_id, "Late challenge response treated as no response");
            inner.expire(&mut state, challenge_id);
            return false;
        }

        let resolution = match ChallengeResponse::parse(response) {
            Some(parsed) if parsed.is_sufficient() => ChallengeResolution::Dismissed,
            _ => ChallengeResolution::Upheld,
        };

        let Some(challenge) = state.challenges.get_mut(challenge_id) else {
            return false;
        };
        challenge.response = Some(response.to_string());
        challenge.status = ChallengeStatus::Resolved;
        challenge.resolution = Some(resolution);
        let resolved = challenge.clone();

        info!(
            challenge_id,
            target = %resolved.target,
            resolution = ?resolution,
            "Challenge resolved"
        );
        inner.events.emit(SlashingManagerEvent::ChallengeResolved {
            challenge_id: challenge_id.to_string(),
            target: resolved.target.clone(),
            resolution,
            expired: false,
        });

        if resolution == ChallengeResolution::Upheld {
            inner.slash(&mut state, &resolved);
        }
        true
    }

    /// Uphold and slash every pending challenge past its deadline.
    pub fn expire_overdue_challenges(&self) -> usize {
        self.inner.expire_overdue_challenges()
    }

    pub fn challenge(&self, challenge_id: &str) -> Option<Challenge> {
        self.inner.state.lock().challenges.get(challenge_id).cloned()
    }

    /// Challenges against `operator`, oldest first.
    pub fn challenges_for(&self, operator: &OperatorId) -> Vec<Challenge> {
        let state = self.inner.state.lock();
        let mut challenges: Vec<Challenge> = state
            .challenges
            .values()
            .filter(|c| &c.target == operator)
            .cloned()
            .collect();
        challenges.sort_by_key(|c| c.created_at_ms);
        challenges
    }

    pub fn challenge_count(&self, operator: &OperatorId) -> u32 {
        self.inner
            .state
            .lock()
            .challenge_counts
            .get(operator)
            .copied()
            .unwrap_or(0)
    }

    pub fn slashing_history(&self) -> Vec<SlashingEvent> {
        self.inner.state.lock().engine.history().to_vec()
    }

    pub fn slashing_history_for(&self, operator: &OperatorId) -> Vec<SlashingEvent> {
        self.inner.state.lock().engine.history_for(operator)
    }

    pub fn statistics(&self) -> SlashingStatistics {
        let state = self.inner.state.lock();
        let mut stats = SlashingStatistics {
            total_challenges: state.challenges.len(),
            total_slashed: state.engine.total_slashed(),
            slashing_events: state.engine.history().len(),
            ..Default::default()
        };
        for challenge in state.challenges.values() {
            match (challenge.status, challenge.resolution) {
                (ChallengeStatus::Pending, _) => stats.pending += 1,
                (ChallengeStatus::Expired, _) => stats.expired += 1,
                (ChallengeStatus::Cancelled, _) => stats.cancelled += 1,
                (ChallengeStatus::Resolved, Some(ChallengeResolution::Dismissed)) => {
                    stats.dismissed += 1
                }
                (ChallengeStatus::Resolved, _) => stats.upheld += 1,
            }
        }
        stats
    }
}

impl Inner {
    /// Submit the challenge evidence as ledger attempt `attempt`. A failed
    /// attempt is retried through the scheduler until the configured bound
    /// is spent.
    async fn submit_challenge(self: &Arc<Self>, mut challenge: Challenge, attempt: u32) -> Challenge {
        let err = match self.send_evidence(&challenge).await {
            Ok(tx_hash) => {
                let mut state = self.state.lock();
                if let Some(stored) = state.challenges.get_mut(&challenge.id) {
                    debug!(challenge_id = %challenge.id, tx_hash = %tx_hash, attempt, "Challenge submitted");
                    stored.ledger_tx = Some(tx_hash.clone());
                    challenge.ledger_tx = Some(tx_hash);
                }
                return challenge;
            }
            Err(e) => e,
        };

        let retryable = matches!(err, SlashingError::Ledger(_));
        if retryable && attempt < self.config.ledger_retry_attempts {
            warn!(
                challenge_id = %challenge.id,
                attempt,
                error = %err,
                "Challenge submission failed, will retry"
            );
            self.schedule_submission(challenge.id.clone(), attempt + 1);
            return challenge;
        }

        error!(
            challenge_id = %challenge.id,
            attempts = attempt,
            error = %err,
            "Challenge submission permanently failed"
        );
        if self.state.lock().challenges.contains_key(&challenge.id) {
            self.events.emit(SlashingManagerEvent::ChallengeSubmissionFailed {
                challenge_id: challenge.id.clone(),
                target: challenge.target.clone(),
                attempts: attempt,
                error: err.to_string(),
            });
        }
        challenge
    }

    async fn send_evidence(&self, challenge: &Challenge) -> Result<String, SlashingError> {
        let payload = serde_json::to_vec(&challenge.evidence)?;
        let tx = self.ledger.challenge(challenge.policy_id(), &payload).await?;
        Ok(tx.hash)
    }

    fn schedule_submission(self: &Arc<Self>, challenge_id: String, attempt: u32) {
        let weak = Arc::downgrade(self);
        let scheduled = self
            .scheduler
            .schedule_once(self.config.ledger_retry_delay(), async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let challenge = inner.state.lock().challenges.get(&challenge_id).cloned();
                match challenge {
                    Some(challenge) if challenge.ledger_tx.is_none() => {
                        inner.resubmit(challenge, attempt).await;
                    }
                    _ => debug!(challenge_id = %challenge_id, "Challenge retry no longer needed"),
                }
            });
        if let Err(e) = scheduled {
            warn!(error = %e, "Could not schedule challenge submission retry");
        }
    }

    fn resubmit(self: Arc<Self>, challenge: Challenge, attempt: u32) -> BoxFuture<'static, ()> {
        async move {
            self.submit_challenge(challenge, attempt).await;
        }
        .boxed()
    }

    fn expire_overdue_challenges(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let overdue: Vec<String> = state
            .challenges
            .values()
            .filter(|c| c.is_pending() && now >= c.deadline)
            .map(|c| c.id.clone())
            .collect();

        for id in &overdue {
            self.expire(&mut state, id);
        }
        if !overdue.is_empty() {
            debug!(expired = overdue.len(), "Swept overdue challenges");
        }
        overdue.len()
    }

    fn expire(&self, state: &mut State, challenge_id: &str) {
        let Some(challenge) = state.challenges.get_mut(challenge_id) else {
            return;
        };
        if !challenge.is_pending() {
            return;
        }
        challenge.status = ChallengeStatus::Expired;
        challenge.resolution = Some(ChallengeResolution::Upheld);
        let expired = challenge.clone();

        warn!(
            challenge_id,
            target = %expired.target,
            "Challenge expired without response, upheld"
        );
        self.events.emit(SlashingManagerEvent::ChallengeResolved {
            challenge_id: challenge_id.to_string(),
            target: expired.target.clone(),
            resolution: ChallengeResolution::Upheld,
            expired: true,
        });
        self.slash(state, &expired);
    }

    fn slash(&self, state: &mut State, challenge: &Challenge) {
        let reason = challenge.evidence.reason;
        let outcome = state.engine.execute(
            &challenge.target,
            reason,
            &challenge.id,
            challenge.policy_id(),
            chrono::Utc::now().timestamp_millis(),
        );

        match outcome {
            Ok(Some(event)) => {
                self.events
                    .emit(SlashingManagerEvent::OperatorSlashed { event });
            }
            Ok(None) => {}
            Err(e) => {
                self.events.emit(SlashingManagerEvent::SlashingFailed {
                    challenge_id: challenge.id.clone(),
                    operator: challenge.target.clone(),
                    reason,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// SHA-256 over challenger, target, evidence, creation time and the
/// manager's challenge nonce.
fn challenge_id(
    challenger: &OperatorId,
    target: &OperatorId,
    evidence: &ChallengeEvidence,
    created_at_ms: i64,
    nonce: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenger.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(target.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(evidence.policy_id.0.to_be_bytes());
    hasher.update(evidence.request_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(evidence.reason.as_str().as_bytes());
    hasher.update(created_at_ms.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    hex::encode(hasher.finalize())
}
