// SETTLEMENT DISPATCHER
//
// INVARIANTS:
// 1. At most one record per (policy id, request id)
// 2. At most one batch cycle in flight; overlapping calls are no-ops
// 3. A record is attempted at most `retry_attempts` times
// 4. Permanent failure is reported exactly once, then the record is gone
// 5. Ledger outcomes are applied only if the record still exists

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use ilguard_consensus::ConsensusResult;
use ilguard_core::{GasOracle, LedgerContract, SettlementConfig, TxReceipt};
use ilguard_scheduler::TaskScheduler;
use ilguard_telemetry::EventBus;

use crate::error::SettlementError;
use crate::events::SettlementEvent;
use crate::transaction::{SettlementKey, SettlementStats, SettlementStatus, SettlementTransaction};
use crate::REJECTION_REASON;

const STOP_REASON: &str = "dispatcher stopped";

/// Outcome of one batch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    sequence: AtomicU64,
    confirmed: AtomicU64,
    permanently_failed: AtomicU64,
    cycles: AtomicU64,
}

struct Inner {
    config: SettlementConfig,
    ledger: Arc<dyn LedgerContract>,
    gas_oracle: Arc<dyn GasOracle>,
    records: Mutex<HashMap<SettlementKey, SettlementTransaction>>,
    scheduler: TaskScheduler,
    events: EventBus<SettlementEvent>,
    in_flight: AtomicBool,
    running: AtomicBool,
    counters: Counters,
}

/// Clears the in-flight flag even if the cycle future is dropped.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SettlementDispatcher {
    inner: Arc<Inner>,
}

impl SettlementDispatcher {
    pub fn new(
        config: SettlementConfig,
        ledger: Arc<dyn LedgerContract>,
        gas_oracle: Arc<dyn GasOracle>,
    ) -> Result<Self, SettlementError> {
        config.validate()?;
        Ok(SettlementDispatcher {
            inner: Arc::new(Inner {
                config,
                ledger,
                gas_oracle,
                records: Mutex::new(HashMap::new()),
                scheduler: TaskScheduler::new("settlement"),
                events: EventBus::new("settlement"),
                in_flight: AtomicBool::new(false),
                running: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SettlementEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a result for settlement. Returns `false` if it is already
    /// queued.
    pub fn enqueue(&self, result: &ConsensusResult) -> bool {
        let key = SettlementKey::of(result);
        let mut records = self.inner.records.lock();
        if records.contains_key(&key) {
            debug!(key = %key, "Settlement already queued");
            return false;
        }

        let sequence = self.inner.counters.sequence.fetch_add(1, Ordering::SeqCst);
        records.insert(key.clone(), SettlementTransaction::new(result, sequence));
        info!(
            key = %key,
            approved = result.approved,
            payout = %result.payout,
            "Settlement queued"
        );
        true
    }

    /// Start the periodic batch cycle.
    pub fn start(&self) -> Result<(), SettlementError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let scheduled = self
            .inner
            .scheduler
            .schedule_periodic(self.inner.config.interval(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.process_batch().await;
                    }
                }
                .boxed()
            });
        if let Err(e) = scheduled {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        info!(
            interval_ms = self.inner.config.interval_ms,
            batch_size = self.inner.config.batch_size,
            "Settlement dispatcher started"
        );
        Ok(())
    }

    /// Cancel all timers and drop every queued record. Submissions already
    /// in flight finish, but their outcome is discarded.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        inner.scheduler.cancel_all();

        let dropped: Vec<SettlementTransaction> =
            inner.records.lock().drain().map(|(_, record)| record).collect();
        for record in dropped {
            warn!(key = %record.key, "Dropping queued settlement on shutdown");
            inner.events.emit(SettlementEvent::SettlementFailed {
                policy_id: record.key.policy_id,
                request_id: record.key.request_id,
                attempt: record.attempts,
                error: STOP_REASON.to_string(),
                permanent: true,
            });
        }
        inner.events.close();
        info!("Settlement dispatcher stopped");
    }

    /// Run one batch cycle now. Returns `None` if a cycle is already in
    /// flight.
    pub async fn process_batch(&self) -> Option<BatchReport> {
        self.inner.process_batch().await
    }

    /// Records not yet confirmed or dropped, oldest first.
    pub fn pending(&self) -> Vec<SettlementTransaction> {
        let mut records: Vec<_> = self.inner.records.lock().values().cloned().collect();
        records.sort_by_key(|r| r.sequence);
        records
    }

    pub fn get(&self, key: &SettlementKey) -> Option<SettlementTransaction> {
        self.inner.records.lock().get(key).cloned()
    }

    pub fn stats(&self) -> SettlementStats {
        let records = self.inner.records.lock();
        let counters = &self.inner.counters;
        SettlementStats {
            queued: records.len(),
            submitted: records
                .values()
                .filter(|r| r.status == SettlementStatus::Submitted)
                .count(),
            confirmed: counters.confirmed.load(Ordering::SeqCst),
            permanently_failed: counters.permanently_failed.load(Ordering::SeqCst),
            cycles: counters.cycles.load(Ordering::SeqCst),
        }
    }
}

impl Inner {
    async fn process_batch(self: &Arc<Self>) -> Option<BatchReport> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Settlement cycle already in flight, skipping");
            return None;
        }
        let _guard = CycleGuard(&self.in_flight);

        let batch: Vec<SettlementKey> = {
            let records = self.records.lock();
            let mut eligible: Vec<&SettlementTransaction> =
                records.values().filter(|r| r.is_eligible()).collect();
            eligible.sort_by_key(|r| r.sequence);
            eligible
                .into_iter()
                .take(self.config.batch_size)
                .map(|r| r.key.clone())
                .collect()
        };

        let mut report = BatchReport::default();
        for key in batch {
            if self.attempt(&key).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        self.counters.cycles.fetch_add(1, Ordering::SeqCst);
        if report.succeeded + report.failed > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                "Settlement batch processed"
            );
        }
        self.events.emit(SettlementEvent::BatchProcessed {
            succeeded: report.succeeded,
            failed: report.failed,
        });
        Some(report)
    }

    async fn attempt(self: &Arc<Self>, key: &SettlementKey) -> bool {
        let record = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(key) else {
                return false;
            };
            if !record.is_eligible() {
                return false;
            }
            record.attempts += 1;
            record.status = SettlementStatus::Submitted;
            record.last_attempt_at = Some(Utc::now());
            record.clone()
        };

        self.events.emit(SettlementEvent::SettlementInitiated {
            policy_id: key.policy_id,
            request_id: key.request_id.clone(),
            attempt: record.attempts,
            approved: record.approved,
        });

        let gas_price = self.capped_gas_price().await;
        match self.submit(&record, gas_price).await {
            Ok(receipt) => {
                self.confirm(key, receipt);
                true
            }
            Err(e) => {
                self.record_failure(key, e);
                false
            }
        }
    }

    async fn capped_gas_price(&self) -> u128 {
        let cap = self.config.max_gas_price();
        match self.gas_oracle.gas_price().await {
            Ok(price) => price.min(cap),
            Err(e) => {
                warn!(error = %e, "Gas oracle unavailable, using configured cap");
                cap
            }
        }
    }

    async fn submit(
        &self,
        record: &SettlementTransaction,
        gas_price: u128,
    ) -> Result<TxReceipt, SettlementError> {
        let policy_id = record.key.policy_id;
        let tx = if record.approved {
            self.ledger.settle(policy_id, record.payout, gas_price).await?
        } else {
            self.ledger
                .reject(policy_id, REJECTION_REASON, gas_price)
                .await?
        };

        if let Some(stored) = self.records.lock().get_mut(&record.key) {
            stored.tx_hash = Some(tx.hash.clone());
            stored.gas_price = Some(gas_price);
        }
        debug!(key = %record.key, tx_hash = %tx.hash, "Settlement transaction submitted");

        let receipt = self.ledger.wait_for_receipt(&tx).await?;
        if !receipt.is_success() {
            if let Some(stored) = self.records.lock().get_mut(&record.key) {
                stored.gas_used = Some(receipt.gas_used);
            }
            return Err(SettlementError::Reverted { tx_hash: tx.hash });
        }
        Ok(receipt)
    }

    fn confirm(&self, key: &SettlementKey, receipt: TxReceipt) {
        if self.records.lock().remove(key).is_none() {
            debug!(key = %key, "Settlement confirmed after record was dropped");
            return;
        }
        self.counters.confirmed.fetch_add(1, Ordering::SeqCst);
        info!(
            key = %key,
            tx_hash = %receipt.hash,
            gas_used = receipt.gas_used,
            "Settlement confirmed"
        );
        self.events.emit(SettlementEvent::SettlementConfirmed {
            policy_id: key.policy_id,
            request_id: key.request_id.clone(),
            tx_hash: receipt.hash,
            gas_used: receipt.gas_used,
            block_number: receipt.block_number,
        });
    }

    fn record_failure(self: &Arc<Self>, key: &SettlementKey, err: SettlementError) {
        let message = err.to_string();
        let attempt = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(key) else {
                return;
            };
            record.last_error = Some(message.clone());
            let attempt = record.attempts;
            if attempt >= self.config.retry_attempts {
                records.remove(key);
            } else {
                record.status = SettlementStatus::Failed;
            }
            attempt
        };

        if attempt >= self.config.retry_attempts {
            self.counters.permanently_failed.fetch_add(1, Ordering::SeqCst);
            error!(key = %key, attempts = attempt, error = %message, "Settlement permanently failed");
            self.events.emit(SettlementEvent::SettlementFailed {
                policy_id: key.policy_id,
                request_id: key.request_id.clone(),
                attempt,
                error: message,
                permanent: true,
            });
            return;
        }

        warn!(key = %key, attempt, error = %message, "Settlement attempt failed, will retry");
        self.events.emit(SettlementEvent::SettlementFailed {
            policy_id: key.policy_id,
            request_id: key.request_id.clone(),
            attempt,
            error: message,
            permanent: false,
        });
        self.schedule_retry(key.clone());
    }

    fn schedule_retry(self: &Arc<Self>, key: SettlementKey) {
        let weak = Arc::downgrade(self);
        let scheduled = self
            .scheduler
            .schedule_once(self.config.retry_delay(), async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Some(record) = inner.records.lock().get_mut(&key) {
                    if record.status == SettlementStatus::Failed {
                        record.status = SettlementStatus::Pending;
                        debug!(key = %key, "Settlement returned to pending");
                    }
                };
            });
        if let Err(e) = scheduled {
            warn!(error = %e, "Could not schedule settlement retry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilguard_core::{FixedGasOracle, LedgerCall, PolicyId, SimulatedLedger, GWEI};
    use ilguard_crypto::{AggregatedSignature, EcdsaAggregate};

    fn result(policy: u64, request: &str, payout: u128) -> ConsensusResult {
        ConsensusResult {
            request_id: request.into(),
            policy_id: PolicyId(policy),
            approved: payout > 0,
            payout,
            aggregated_signature: AggregatedSignature::Ecdsa(EcdsaAggregate {
                message: vec![],
                digest: [0u8; 32],
                signatures: vec![],
                threshold: 1,
            }),
            participants: vec![],
            threshold: 1,
        }
    }

    fn dispatcher(
        config: SettlementConfig,
        gas_price: u128,
    ) -> (SettlementDispatcher, Arc<SimulatedLedger>) {
        let ledger = Arc::new(SimulatedLedger::new());
        let dispatcher = SettlementDispatcher::new(
            config,
            ledger.clone(),
            Arc::new(FixedGasOracle::new(gas_price)),
        )
        .unwrap();
        (dispatcher, ledger)
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let (dispatcher, _) = dispatcher(SettlementConfig::default(), GWEI);
        assert!(dispatcher.enqueue(&result(1, "r1", 100)));
        assert!(!dispatcher.enqueue(&result(1, "r1", 100)));
        assert!(dispatcher.enqueue(&result(1, "r2", 100)));
        assert_eq!(dispatcher.stats().queued, 2);
    }

    #[tokio::test]
    async fn test_approved_settles_and_rejected_rejects() {
        let (dispatcher, ledger) = dispatcher(SettlementConfig::default(), GWEI);
        dispatcher.enqueue(&result(1, "r1", 500));
        dispatcher.enqueue(&result(2, "r2", 0));

        let report = dispatcher.process_batch().await.unwrap();
        assert_eq!(report, BatchReport { succeeded: 2, failed: 0 });
        assert!(dispatcher.pending().is_empty());
        assert_eq!(
            ledger.calls(),
            vec![
                LedgerCall::Settle {
                    policy_id: PolicyId(1),
                    payout: 500,
                    gas_price: GWEI,
                },
                LedgerCall::Reject {
                    policy_id: PolicyId(2),
                    reason: REJECTION_REASON.to_string(),
                    gas_price: GWEI,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_gas_price_capped() {
        let config = SettlementConfig {
            max_gas_price_gwei: 50,
            ..Default::default()
        };
        let (dispatcher, ledger) = dispatcher(config, 300 * GWEI);
        dispatcher.enqueue(&result(1, "r1", 500));
        dispatcher.process_batch().await;

        match &ledger.calls()[0] {
            LedgerCall::Settle { gas_price, .. } => assert_eq!(*gas_price, 50 * GWEI),
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_size_bounds_cycle() {
        let config = SettlementConfig {
            batch_size: 2,
            ..Default::default()
        };
        let (dispatcher, _) = dispatcher(config, GWEI);
        for i in 0..5 {
            dispatcher.enqueue(&result(i, &format!("r{}", i), 10));
        }
        let report = dispatcher.process_batch().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(dispatcher.stats().queued, 3);
        // Oldest first.
        assert_eq!(dispatcher.pending()[0].key.policy_id, PolicyId(2));
    }

    #[tokio::test]
    async fn test_reverted_receipt_counts_as_failure() {
        let (dispatcher, ledger) = dispatcher(SettlementConfig::default(), GWEI);
        ledger.revert_next_receipts(1);
        dispatcher.enqueue(&result(1, "r1", 500));

        let report = dispatcher.process_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        let record = dispatcher.get(&SettlementKey::new(PolicyId(1), "r1".into())).unwrap();
        assert_eq!(record.status, SettlementStatus::Failed);
        assert!(record.last_error.unwrap().contains("reverted"));
        assert!(record.tx_hash.is_some());
        assert_eq!(record.gas_used, Some(120_000));
    }

    #[tokio::test]
    async fn test_stop_drops_queue() {
        let (dispatcher, _) = dispatcher(SettlementConfig::default(), GWEI);
        let mut events = dispatcher.subscribe();
        dispatcher.enqueue(&result(1, "r1", 500));
        dispatcher.stop();

        match events.recv().await {
            Some(SettlementEvent::SettlementFailed { permanent, error, .. }) => {
                assert!(permanent);
                assert_eq!(error, STOP_REASON);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(dispatcher.pending().is_empty());
    }
}
