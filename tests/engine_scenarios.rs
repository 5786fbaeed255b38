//! End-to-end scenarios over the full engine with in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;

use guaranty_engine::alert::{AlertKind, AlertSink, OperationalAlert};
use guaranty_engine::config::EngineConfig;
use guaranty_engine::engine::ProcessingEngine;
use guaranty_engine::guarantee::{GuaranteeStatus, GuaranteeStore, MemoryGuaranteeStore};
use guaranty_engine::message::{MessageKind, MessageStatus};
use guaranty_engine::refs::CounterReferenceGenerator;
use guaranty_engine::store::{MemoryMessageStore, MessageStore};

/// Alert sink that records everything it is handed.
#[derive(Default)]
struct CollectingAlertSink {
    alerts: Mutex<Vec<OperationalAlert>>,
}

#[async_trait::async_trait]
impl AlertSink for CollectingAlertSink {
    async fn alert(&self, alert: OperationalAlert) {
        self.alerts.lock().await.push(alert);
    }
}

struct Fixture {
    engine: Arc<ProcessingEngine>,
    store: Arc<MemoryMessageStore>,
    guarantees: Arc<MemoryGuaranteeStore>,
    alerts: Arc<CollectingAlertSink>,
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let store = Arc::new(MemoryMessageStore::new());
    let guarantees = Arc::new(MemoryGuaranteeStore::new());
    let alerts = Arc::new(CollectingAlertSink::default());
    let engine = ProcessingEngine::new(
        store.clone(),
        guarantees.clone(),
        Arc::new(CounterReferenceGenerator::new()),
        alerts.clone(),
        config,
    );
    Fixture {
        engine,
        store,
        guarantees,
        alerts,
    }
}

fn fixture() -> Fixture {
    fixture_with(EngineConfig::default())
}

const GUARANTEE_RAW: &str = "{1:BANKBEBB}{2:BANKUS33}\n\
    :20:GTEE-REF-001\n\
    :27:1/1\n\
    :32B:USD100000,00\n\
    :30:260601\n\
    :31E:270601\n\
    :50:ACME INDUSTRIES NV\n\
    :59:GLOBEX CORPORATION\n\
    :77C:PERFORMANCE GUARANTEE CONTRACT 4711\n";

fn amendment_raw(correlation: &str) -> String {
    format!(
        "{{1:BANKBEBB}}{{2:BANKUS33}}\n\
         :20:AMND-REF-001\n\
         :21:{correlation}\n\
         :32B:USD150000,00\n\
         :77C:AMOUNT INCREASED TO USD 150000\n"
    )
}

// ── Scenario 1: well-formed received guarantee ──────────────────────

#[tokio::test]
async fn scenario_1_received_guarantee_happy_path() {
    let f = fixture();
    let message = f
        .engine
        .receive(GUARANTEE_RAW, MessageKind::ReceivedGuarantee)
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Received);

    f.engine.process_message(message.id).await.unwrap();

    let done = f.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(done.status, MessageStatus::Responded);
    assert_eq!(done.sender.as_deref(), Some("BANKBEBB"));
    assert_eq!(done.receiver.as_deref(), Some("BANKUS33"));
    assert!(done.error.is_none());

    // A new guarantee aggregate of 100000.00 USD in `received` sub-status
    let guarantee = f
        .guarantees
        .get(done.guarantee_id.expect("guarantee link"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guarantee.currency, "USD");
    assert_eq!(guarantee.amount, dec!(100000.00));
    assert_eq!(guarantee.status, GuaranteeStatus::Received);
    assert_eq!(guarantee.beneficiary, "GLOBEX CORPORATION");
    assert_eq!(guarantee.counterparty_reference.as_deref(), Some("GTEE-REF-001"));

    // Exactly one generated acknowledgement referencing the original
    let response = f.store.response_of(message.id).await.unwrap().unwrap();
    assert_eq!(done.response_id, Some(response.id));
    assert_eq!(response.kind, MessageKind::Acknowledgement);
    assert_eq!(response.parent_id, Some(message.id));
    assert_eq!(response.transaction_reference.as_deref(), Some(done.reference.as_str()));
    // Parties swapped on the response
    assert_eq!(response.sender.as_deref(), Some("BANKUS33"));
    assert_eq!(response.receiver.as_deref(), Some("BANKBEBB"));

    assert!(f.alerts.alerts.lock().await.is_empty());
}

// ── Scenario 2: amendment without a target ──────────────────────────

#[tokio::test]
async fn scenario_2_amendment_without_target_schedules_retry() {
    let f = fixture();
    let before = Utc::now();
    let message = f
        .engine
        .receive(&amendment_raw("NO-SUCH-GUARANTEE"), MessageKind::Amendment)
        .await
        .unwrap();

    f.engine.process_message(message.id).await.unwrap();

    let failed = f.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::ProcessingError);
    assert!(
        failed.error.as_deref().unwrap().contains("not found"),
        "diagnostic: {:?}",
        failed.error
    );
    assert_eq!(failed.retry_count, 1);

    // next_retry_at ≈ now + 5 minutes
    let next = failed.next_retry_at.expect("retry scheduled");
    let delta = next - before;
    assert!(delta >= chrono::Duration::minutes(5));
    assert!(delta <= chrono::Duration::minutes(5) + chrono::Duration::seconds(30));

    // Tagged as a permanent business failure for monitoring
    let alerts = f.alerts.alerts.lock().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::PermanentFailure);
}

#[tokio::test]
async fn scenario_2b_amendment_succeeds_once_target_exists() {
    let f = fixture();

    // Guarantee arrives and processes first
    let guarantee_msg = f
        .engine
        .receive(GUARANTEE_RAW, MessageKind::ReceivedGuarantee)
        .await
        .unwrap();
    f.engine.process_message(guarantee_msg.id).await.unwrap();

    // Amendment correlates on the counterparty's reference
    let message = f
        .engine
        .receive(&amendment_raw("GTEE-REF-001"), MessageKind::Amendment)
        .await
        .unwrap();
    f.engine.process_message(message.id).await.unwrap();

    let done = f.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(done.status, MessageStatus::Responded);
    assert!(done.amendment_id.is_some());

    // Amendment applied to the aggregate
    let guarantee = f
        .guarantees
        .get(done.guarantee_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guarantee.status, GuaranteeStatus::Amended);
    assert_eq!(guarantee.amount, dec!(150000.00));

    // Amendment gets a processing confirmation, not a plain ack
    let response = f.store.response_of(message.id).await.unwrap().unwrap();
    assert_eq!(response.kind, MessageKind::AmendmentConfirmation);
}

// ── Scenario 3: malformed payload ───────────────────────────────────

#[tokio::test]
async fn scenario_3_malformed_guarantee_parse_error() {
    let f = fixture();
    // Missing the :32B: currency+amount composite
    let raw = "{1:BANKBEBB}{2:BANKUS33}\n\
        :20:GTEE-REF-002\n\
        :30:260601\n\
        :31E:270601\n\
        :50:ACME\n\
        :59:GLOBEX\n";
    let message = f
        .engine
        .receive(raw, MessageKind::ReceivedGuarantee)
        .await
        .unwrap();

    f.engine.process_message(message.id).await.unwrap();

    let failed = f.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::ParseError);
    assert!(failed.error.as_deref().unwrap().contains("32B"));
    // No partial field map retained
    assert!(failed.fields.is_none());

    // No aggregate created, no response generated
    assert!(
        f.guarantees
            .find_by_source_message(message.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(f.store.response_of(message.id).await.unwrap().is_none());
}

// ── Scenario 4: retry budget exhaustion ─────────────────────────────

#[tokio::test]
async fn scenario_4_budget_exhaustion_excludes_from_scan() {
    let f = fixture();
    let message = f
        .engine
        .receive(&amendment_raw("NO-SUCH-GUARANTEE"), MessageKind::Amendment)
        .await
        .unwrap();
    assert_eq!(message.max_retries, 3);

    // First failure
    f.engine.process_message(message.id).await.unwrap();

    // Two more failed retry rounds, driving the clock past the fixed delay
    for round in 2..=3 {
        let current = f.store.get(message.id).await.unwrap().unwrap();
        let due_at = current.next_retry_at.expect("retry scheduled")
            + chrono::Duration::seconds(1);
        f.engine.run_retry_scan(due_at).await;

        let resubmitted = f.store.get(message.id).await.unwrap().unwrap();
        assert_eq!(resubmitted.status, MessageStatus::Received);

        f.engine.process_message(message.id).await.unwrap();
        let failed = f.store.get(message.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::ProcessingError);
        assert_eq!(failed.retry_count, round);
    }

    // Budget exhausted: stays in its error state, no next retry
    let exhausted = f.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(exhausted.retry_count, 3);
    assert!(exhausted.next_retry_at.is_none());

    // Excluded from the scan arbitrarily far in the future
    let far_future = Utc::now() + chrono::Duration::days(30);
    assert!(
        f.engine
            .messages_for_processing(far_future)
            .await
            .unwrap()
            .is_empty()
    );
    f.engine.run_retry_scan(far_future).await;
    let still = f.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(still.status, MessageStatus::ProcessingError);

    // Exhaustion surfaced to monitoring
    let alerts = f.alerts.alerts.lock().await;
    assert!(alerts.iter().any(|a| a.kind == AlertKind::RetriesExhausted));

    // Manual retry remains the operator's escape hatch
    drop(alerts);
    let reset = f.engine.retry(message.id).await.unwrap();
    assert_eq!(reset.status, MessageStatus::Received);
    assert_eq!(reset.retry_count, 0);
}

// ── Properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn validation_failure_never_reaches_processed() {
    let f = fixture();
    // Parses fine, but expiry precedes issue
    let raw = "{1:BANKBEBB}{2:BANKUS33}\n\
        :20:GTEE-REF-003\n\
        :32B:USD100000,00\n\
        :30:270601\n\
        :31E:260601\n\
        :50:ACME\n\
        :59:GLOBEX\n";
    let message = f
        .engine
        .receive(raw, MessageKind::ReceivedGuarantee)
        .await
        .unwrap();

    f.engine.process_message(message.id).await.unwrap();

    let failed = f.store.get(message.id).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::ValidationError);
    assert!(failed.error.as_deref().unwrap().contains("strictly after"));
    assert_eq!(
        f.store
            .count_by_status(MessageStatus::Processed)
            .await
            .unwrap(),
        0
    );
    assert!(
        f.guarantees
            .find_by_source_message(message.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn response_generation_is_idempotent_across_reruns() {
    let f = fixture();
    let message = f
        .engine
        .receive(GUARANTEE_RAW, MessageKind::ReceivedGuarantee)
        .await
        .unwrap();

    f.engine.process_message(message.id).await.unwrap();
    f.engine.process_message(message.id).await.unwrap();

    // Exactly one linked response in the store
    let done = f.store.get(message.id).await.unwrap().unwrap();
    let response = f.store.response_of(message.id).await.unwrap().unwrap();
    assert_eq!(done.response_id, Some(response.id));
    assert_eq!(
        f.store
            .count_by_status(MessageStatus::Processed)
            .await
            .unwrap(),
        1, // the response itself sits at PROCESSED
    );
}

#[tokio::test]
async fn worker_pool_processes_ingested_messages() {
    let f = fixture();
    let _workers = f.engine.spawn_workers();

    let message = f
        .engine
        .receive(GUARANTEE_RAW, MessageKind::ReceivedGuarantee)
        .await
        .unwrap();

    // Poll until the pool finishes the pipeline
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = f.store.get(message.id).await.unwrap().unwrap().status;
        if status == MessageStatus::Responded {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message never reached RESPONDED, still {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn concurrent_amendments_to_one_guarantee_both_land() {
    let f = fixture();
    let guarantee_msg = f
        .engine
        .receive(GUARANTEE_RAW, MessageKind::ReceivedGuarantee)
        .await
        .unwrap();
    f.engine.process_message(guarantee_msg.id).await.unwrap();

    let first = f
        .engine
        .receive(&amendment_raw("GTEE-REF-001"), MessageKind::Amendment)
        .await
        .unwrap();
    let second_raw = "{1:BANKBEBB}{2:BANKUS33}\n\
        :20:AMND-REF-002\n\
        :21:GTEE-REF-001\n\
        :31E:280601\n\
        :77C:VALIDITY EXTENDED\n";
    let second = f
        .engine
        .receive(second_raw, MessageKind::Amendment)
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        f.engine.process_message(first.id),
        f.engine.process_message(second.id)
    );
    a.unwrap();
    b.unwrap();

    // With the in-process store both writes serialize; each message
    // either landed or failed transiently with a retry scheduled.
    let first_done = f.store.get(first.id).await.unwrap().unwrap();
    let second_done = f.store.get(second.id).await.unwrap().unwrap();
    let landed = [&first_done, &second_done]
        .iter()
        .filter(|m| m.status == MessageStatus::Responded)
        .count();
    assert!(landed >= 1);
    for message in [&first_done, &second_done] {
        if message.status == MessageStatus::ProcessingError {
            assert!(message.next_retry_at.is_some(), "transient failure must retry");
        }
    }

    let guarantee = f
        .guarantees
        .get(first_done.guarantee_id.or(second_done.guarantee_id).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guarantee.status, GuaranteeStatus::Amended);
    assert!(guarantee.version >= 2);
}
