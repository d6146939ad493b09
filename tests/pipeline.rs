use std::sync::Arc;
use std::time::Duration;

use ilguard::ClaimPipeline;
use ilguard_consensus::{SessionStatus, SlashingReason};
use ilguard_core::{
    AttestationRequest, FixedGasOracle, LedgerCall, OperatorId, PolicyId, ServiceConfig,
    SimulatedLedger, GWEI,
};
use ilguard_crypto::{EcdsaAggregator, EcdsaOperatorKey, Signature};
use ilguard_settlement::{SettlementEvent, SettlementKey};

const LOCAL_OPERATOR: &str = "0x00000000000000000000000000000000000000aa";

fn config() -> ServiceConfig {
    let mut config = ServiceConfig {
        operator_id: LOCAL_OPERATOR.to_string(),
        ..Default::default()
    };
    config.settlement.interval_ms = 1_000;
    config.settlement.retry_delay_ms = 100;
    config
}

fn pipeline(config: &ServiceConfig) -> (ClaimPipeline, Arc<SimulatedLedger>) {
    let ledger = Arc::new(SimulatedLedger::new());
    let pipeline = ClaimPipeline::new(
        config,
        Arc::new(EcdsaAggregator::new(config.consensus.threshold).unwrap()),
        ledger.clone(),
        Arc::new(FixedGasOracle::new(20 * GWEI)),
    )
    .unwrap();
    (pipeline, ledger)
}

fn request(id: &str, payout: u128) -> AttestationRequest {
    AttestationRequest::new(id, PolicyId(42), b"tee-proof".to_vec(), payout, 1_700_000_000)
}

#[tokio::test(start_paused = true)]
async fn test_approved_claim_settles_on_chain() {
    let (pipeline, ledger) = pipeline(&config());
    pipeline.start().unwrap();

    let request = request("claim-1", 7_500);
    pipeline.submit_request(request.clone(), None).unwrap();
    for _ in 0..2 {
        let key = EcdsaOperatorKey::generate();
        assert!(pipeline.submit_signature(&request.id, key.sign_request(&request).unwrap()));
    }

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(
        pipeline.coordinator().session(&request.id).unwrap().status,
        SessionStatus::Completed
    );
    assert_eq!(
        ledger.calls(),
        vec![LedgerCall::Settle {
            policy_id: PolicyId(42),
            payout: 7_500,
            gas_price: 20 * GWEI,
        }]
    );
    assert_eq!(pipeline.dispatcher().stats().confirmed, 1);
    pipeline.stop();
}

#[tokio::test(start_paused = true)]
async fn test_zero_payout_claim_is_rejected_on_chain() {
    let (pipeline, ledger) = pipeline(&config());
    pipeline.start().unwrap();

    let request = request("claim-2", 0);
    pipeline.submit_request(request.clone(), None).unwrap();
    for _ in 0..2 {
        let key = EcdsaOperatorKey::generate();
        pipeline.submit_signature(&request.id, key.sign_request(&request).unwrap());
    }

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(matches!(
        ledger.calls().as_slice(),
        [LedgerCall::Reject { policy_id: PolicyId(42), .. }]
    ));
    pipeline.stop();
}

#[tokio::test(start_paused = true)]
async fn test_settlement_dropped_after_retry_budget() {
    let mut config = config();
    config.settlement.batch_size = 1;
    config.settlement.retry_attempts = 3;
    let (pipeline, ledger) = pipeline(&config);
    ledger.fail_all_submissions(true);
    let mut settlement_rx = pipeline.dispatcher().subscribe();
    pipeline.start().unwrap();

    let request = request("claim-3", 1_000);
    pipeline.submit_request(request.clone(), None).unwrap();
    for _ in 0..2 {
        let key = EcdsaOperatorKey::generate();
        pipeline.submit_signature(&request.id, key.sign_request(&request).unwrap());
    }

    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let key = SettlementKey::new(PolicyId(42), request.id.clone());
    assert!(pipeline.dispatcher().get(&key).is_none());

    let mut permanent = 0;
    while let Ok(event) = settlement_rx.try_recv() {
        if let SettlementEvent::SettlementFailed { permanent: true, .. } = event {
            permanent += 1;
        }
    }
    assert_eq!(permanent, 1);
    assert_eq!(ledger.attempts(), 3);
    pipeline.stop();
}

#[tokio::test(start_paused = true)]
async fn test_forged_signature_opens_challenge() {
    let (pipeline, ledger) = pipeline(&config());
    pipeline.start().unwrap();

    let request = request("claim-4", 1_000);
    pipeline.submit_request(request.clone(), None).unwrap();

    let honest = EcdsaOperatorKey::generate();
    let forger = EcdsaOperatorKey::generate();
    let victim = EcdsaOperatorKey::generate();

    // Forger's signature relabelled as the victim's.
    let forged = match forger.sign_request(&request).unwrap() {
        Signature::Ecdsa(mut sig) => {
            sig.signer = victim.operator_id().clone();
            Signature::Ecdsa(sig)
        }
        other => other,
    };
    pipeline.submit_signature(&request.id, honest.sign_request(&request).unwrap());
    pipeline.submit_signature(&request.id, forged);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let session = pipeline.coordinator().session(&request.id).unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.invalid_signers, vec![victim.operator_id().clone()]);

    let challenges = pipeline.slashing().challenges_for(victim.operator_id());
    assert_eq!(challenges.len(), 1);
    assert_eq!(challenges[0].challenger, OperatorId::new(LOCAL_OPERATOR));
    assert_eq!(challenges[0].evidence.reason, SlashingReason::InvalidSignature);
    assert!(ledger
        .calls()
        .iter()
        .any(|c| matches!(c, LedgerCall::Challenge { policy_id: PolicyId(42), .. })));
    assert!(pipeline.dispatcher().pending().is_empty());
    pipeline.stop();
}

#[tokio::test]
async fn test_duplicate_request_rejected() {
    let (pipeline, _) = pipeline(&config());
    let request = request("claim-5", 1);
    pipeline.submit_request(request.clone(), None).unwrap();
    assert!(pipeline.submit_request(request, None).is_err());
    pipeline.stop();
}
