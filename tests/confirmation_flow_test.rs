//! 确认流程测试
//!
//! 通过 ChainObserver 驱动完整的支付生命周期（推送和轮询两条路径）

mod common;

use chrono::{Duration, Utc};
use common::engine;
use ironpay::{
    domain::{ChainEvent, EventSource, Payment, PaymentState},
    service::{ApplyOutcome, IngestOutcome, NewPayment},
};

const TX_A: &str = "aa00000000000000000000000000000000000000000000000000000000000001";
const TX_B: &str = "bb00000000000000000000000000000000000000000000000000000000000002";

async fn create(engine: &common::Engine, amount: u64) -> Payment {
    engine
        .state
        .payments
        .create(NewPayment {
            expected_amount: amount,
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn ingest(engine: &common::Engine, event: ChainEvent) -> (Payment, ApplyOutcome) {
    match engine.state.observer.ingest(event).await.unwrap() {
        IngestOutcome::Processed { payment, outcome } => (*payment, outcome),
        IngestOutcome::Ignored => panic!("event for a known address was ignored"),
    }
}

async fn push(
    engine: &common::Engine,
    address: &str,
    tx: &str,
    amount: u64,
    confirmations: u32,
) -> (Payment, ApplyOutcome) {
    let event = ChainEvent::seen(address, tx, amount, confirmations, EventSource::Push);
    ingest(engine, event).await
}

/// 轮询得到的观测（确认数下降只认这一来源）
async fn polled(
    engine: &common::Engine,
    address: &str,
    tx: &str,
    amount: u64,
    confirmations: u32,
) -> (Payment, ApplyOutcome) {
    let event = ChainEvent::seen(address, tx, amount, confirmations, EventSource::Poll);
    ingest(engine, event).await
}

#[tokio::test]
async fn test_happy_path_reaches_confirmed() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let addr = p.address.address.clone();
    assert_eq!(p.state, PaymentState::Awaiting);

    let (p, outcome) = push(&engine, &addr, TX_A, 100_000, 0).await;
    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(p.state, PaymentState::Detected);

    let (p, _) = push(&engine, &addr, TX_A, 100_000, 1).await;
    assert_eq!(p.state, PaymentState::Confirming);
    assert_eq!(p.confirmations_seen, 1);

    let (p, _) = push(&engine, &addr, TX_A, 100_000, 3).await;
    assert_eq!(p.state, PaymentState::Confirmed);
    assert_eq!(p.observed_amount, 100_000);
    assert_eq!(engine.notifier.wait_for(1).await, vec![PaymentState::Confirmed]);

    // 账本中的记录与返回值一致
    let stored = engine.state.payments.get(p.id).await.unwrap();
    assert_eq!(stored.state, PaymentState::Confirmed);
    assert_eq!(stored.history.len(), 3);
}

#[tokio::test]
async fn test_confirmed_skips_intermediate_states_in_one_event() {
    let engine = engine();
    let p = create(&engine, 5_000).await;

    let (p, _) = push(&engine, &p.address.address, TX_A, 5_000, 6).await;
    assert_eq!(p.state, PaymentState::Confirmed);
    let visited: Vec<PaymentState> = p.history.iter().map(|t| t.to).collect();
    assert_eq!(
        visited,
        vec![
            PaymentState::Detected,
            PaymentState::Confirming,
            PaymentState::Confirmed
        ]
    );
}

#[tokio::test]
async fn test_duplicate_event_changes_nothing() {
    let engine = engine();
    let p = create(&engine, 10_000).await;
    let addr = p.address.address.clone();

    let (first, _) = push(&engine, &addr, TX_A, 10_000, 1).await;
    let (second, outcome) = push(&engine, &addr, TX_A, 10_000, 1).await;

    assert_eq!(outcome, ApplyOutcome::Duplicate);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_unknown_address_is_ignored() {
    let engine = engine();
    let event = ChainEvent::seen("tb1qnotours", TX_A, 1, 1, EventSource::Push);
    let outcome = engine.state.observer.ingest(event).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Ignored));
    assert_eq!(engine.store.len().await, 0);
}

#[tokio::test]
async fn test_underpayment_fails_at_expiry() {
    let engine = engine();
    let p = create(&engine, 100_000).await;

    let (p, _) = push(&engine, &p.address.address, TX_A, 40_000, 5).await;
    assert_eq!(p.state, PaymentState::Confirming);
    assert_eq!(p.observed_amount, 40_000);

    let finished = engine
        .state
        .ledger
        .expire_overdue(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, PaymentState::Failed);
}

#[tokio::test]
async fn test_paid_but_shallow_payment_keeps_tracking_after_expiry() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    push(&engine, &p.address.address, TX_A, 100_000, 1).await;

    // 已过有效期（15 分钟），仍在确认宽限期（再 10 分钟）内
    let finished = engine
        .state
        .ledger
        .expire_overdue(Utc::now() + Duration::minutes(20))
        .await
        .unwrap();
    assert!(finished.is_empty());

    let stored = engine.state.payments.get(p.id).await.unwrap();
    assert_eq!(stored.state, PaymentState::Confirming);
}

#[tokio::test]
async fn test_unconfirmed_payment_leaves_watch_list_after_grace() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let (p, _) = push(&engine, &p.address.address, TX_A, 100_000, 0).await;
    assert_eq!(p.state, PaymentState::Detected);
    assert_eq!(p.settle_by - p.expires_at, Duration::minutes(10));

    let finished = engine.state.ledger.expire_overdue(p.settle_by).await.unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, PaymentState::Failed);

    assert!(engine.state.ledger.list_awaiting().await.unwrap().is_empty());
    assert_eq!(engine.notifier.wait_for(1).await, vec![PaymentState::Failed]);
}

#[tokio::test]
async fn test_untouched_payment_expires() {
    let engine = engine();
    let p = create(&engine, 100_000).await;

    let finished = engine
        .state
        .ledger
        .expire_overdue(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].id, p.id);
    assert_eq!(finished[0].state, PaymentState::Expired);
}

#[tokio::test]
async fn test_overpayment_confirms_and_records_actual_amount() {
    let engine = engine();
    let p = create(&engine, 100_000).await;

    let (p, _) = push(&engine, &p.address.address, TX_A, 150_000, 3).await;
    assert_eq!(p.state, PaymentState::Confirmed);
    assert_eq!(p.observed_amount, 150_000);
    assert_eq!(p.expected_amount, 100_000);
}

#[tokio::test]
async fn test_two_transactions_accumulate() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let addr = p.address.address.clone();

    let (p1, _) = push(&engine, &addr, TX_A, 60_000, 3).await;
    assert_eq!(p1.state, PaymentState::Confirming);

    let (p2, _) = push(&engine, &addr, TX_B, 40_000, 1).await;
    assert_eq!(p2.observed_amount, 100_000);
    assert_eq!(p2.state, PaymentState::Confirming);
    assert_eq!(p2.confirmations_seen, 1);

    let (p3, _) = push(&engine, &addr, TX_B, 40_000, 3).await;
    assert_eq!(p3.state, PaymentState::Confirmed);
}

#[tokio::test]
async fn test_reorg_after_confirmation_needs_review() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let addr = p.address.address.clone();

    push(&engine, &addr, TX_A, 100_000, 3).await;
    let (p, outcome) = polled(&engine, &addr, TX_A, 100_000, 1).await;

    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(p.state, PaymentState::NeedsReview);
    assert!(p.review_reason.is_some());
    assert_eq!(
        engine.notifier.wait_for(2).await,
        vec![PaymentState::Confirmed, PaymentState::NeedsReview]
    );

    // 复核中的支付冻结
    let (frozen, outcome) = push(&engine, &addr, TX_A, 100_000, 10).await;
    assert_eq!(outcome, ApplyOutcome::Frozen);
    assert_eq!(frozen.state, PaymentState::NeedsReview);
}

#[tokio::test]
async fn test_dropped_transaction_after_confirmation_needs_review() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let addr = p.address.address.clone();

    push(&engine, &addr, TX_A, 100_000, 3).await;
    let event = ChainEvent::dropped(addr.as_str(), TX_A, EventSource::Push);
    let outcome = engine.state.observer.ingest(event).await.unwrap();

    let IngestOutcome::Processed { payment, .. } = outcome else {
        panic!("dropped event for a known address was ignored");
    };
    assert_eq!(payment.state, PaymentState::NeedsReview);
    assert_eq!(payment.observed_amount, 0);
}

#[tokio::test]
async fn test_rollback_before_confirmation() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let addr = p.address.address.clone();

    push(&engine, &addr, TX_A, 100_000, 2).await;
    let (p, _) = polled(&engine, &addr, TX_A, 100_000, 0).await;
    assert_eq!(p.state, PaymentState::Detected);
}

#[tokio::test]
async fn test_redelivered_push_after_confirmation_is_ignored() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let addr = p.address.address.clone();

    for confirmations in 0..=3 {
        push(&engine, &addr, TX_A, 100_000, confirmations).await;
    }
    let confirmed = engine.state.payments.get(p.id).await.unwrap();
    assert_eq!(confirmed.state, PaymentState::Confirmed);

    // 推送服务迟到的重投：确认数比已记录的低
    let (p, outcome) = push(&engine, &addr, TX_A, 100_000, 2).await;
    assert_eq!(outcome, ApplyOutcome::Duplicate);
    assert_eq!(p.state, PaymentState::Confirmed);
    assert!(p.review_reason.is_none());
    assert_eq!(engine.state.payments.get(p.id).await.unwrap(), confirmed);
    assert_eq!(engine.notifier.wait_for(1).await, vec![PaymentState::Confirmed]);
}

#[tokio::test]
async fn test_tx_hash_case_does_not_double_count() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    let addr = p.address.address.clone();

    let (p1, _) = push(&engine, &addr, &TX_A.to_uppercase(), 60_000, 1).await;
    assert_eq!(p1.transactions[0].tx_hash, TX_A);

    let (p2, outcome) = push(&engine, &addr, TX_A, 60_000, 1).await;
    assert_eq!(outcome, ApplyOutcome::Duplicate);
    assert_eq!(p2.observed_amount, 60_000);
    assert_eq!(p2.transactions.len(), 1);
    assert_eq!(p2.state, PaymentState::Confirming);
}

#[tokio::test]
async fn test_funds_after_expiry_are_recorded_as_late() {
    let engine = engine();
    let p = create(&engine, 100_000).await;
    engine
        .state
        .ledger
        .expire_overdue(Utc::now() + Duration::hours(2))
        .await
        .unwrap();

    let (p, outcome) = push(&engine, &p.address.address, TX_A, 100_000, 6).await;
    assert_eq!(outcome, ApplyOutcome::LateFunds);
    assert_eq!(p.state, PaymentState::Expired);
    assert_eq!(p.observed_amount, 100_000);
    assert_eq!(p.transactions.len(), 1);
}

#[tokio::test]
async fn test_polling_drives_payment_to_confirmed() {
    let engine = engine();
    let p = create(&engine, 25_000).await;
    let addr = p.address.address.clone();
    let observer = &engine.state.observer;

    engine.source.set(&addr, &[]);
    let summary = observer.poll_once().await.unwrap();
    assert_eq!(summary.watched, 1);
    assert_eq!(summary.events_applied, 0);
    assert_eq!(summary.query_failures, 0);

    engine.source.set(&addr, &[(TX_A, 25_000, 0)]);
    let summary = observer.poll_once().await.unwrap();
    assert_eq!(summary.events_applied, 1);
    assert_eq!(
        engine.state.payments.get(p.id).await.unwrap().state,
        PaymentState::Detected
    );

    engine.source.set(&addr, &[(TX_A, 25_000, 4)]);
    observer.poll_once().await.unwrap();
    assert_eq!(
        engine.state.payments.get(p.id).await.unwrap().state,
        PaymentState::Confirmed
    );

    // 终态支付不再被轮询
    let queries = engine.source.queries();
    let summary = observer.poll_once().await.unwrap();
    assert_eq!(summary.watched, 0);
    assert_eq!(engine.source.queries(), queries);
    assert_eq!(engine.notifier.wait_for(1).await, vec![PaymentState::Confirmed]);
}

#[tokio::test]
async fn test_polling_detects_disappearing_transaction() {
    let engine = engine();
    let p = create(&engine, 25_000).await;
    let addr = p.address.address.clone();

    engine.source.set(&addr, &[(TX_A, 25_000, 0)]);
    engine.state.observer.poll_once().await.unwrap();

    engine.source.set(&addr, &[]);
    let summary = engine.state.observer.poll_once().await.unwrap();
    assert_eq!(summary.events_applied, 1);

    let stored = engine.state.payments.get(p.id).await.unwrap();
    assert_eq!(stored.state, PaymentState::Awaiting);
    assert!(stored.transactions[0].dropped);
}

#[tokio::test]
async fn test_query_failure_leaves_state_unchanged() {
    let engine = engine();
    let p = create(&engine, 25_000).await;
    let addr = p.address.address.clone();

    engine.source.set(&addr, &[(TX_A, 25_000, 1)]);
    engine.state.observer.poll_once().await.unwrap();

    engine.source.clear(&addr);
    let summary = engine.state.observer.poll_once().await.unwrap();
    assert_eq!(summary.query_failures, 1);
    assert_eq!(summary.events_applied, 0);

    let stored = engine.state.payments.get(p.id).await.unwrap();
    assert_eq!(stored.state, PaymentState::Confirming);
    assert!(!stored.transactions[0].dropped);
}

#[tokio::test]
async fn test_push_and_poll_agree() {
    let engine = engine();
    let p = create(&engine, 25_000).await;
    let addr = p.address.address.clone();

    push(&engine, &addr, TX_A, 25_000, 1).await;

    // 轮询看到相同的数据时不产生新变化
    engine.source.set(&addr, &[(TX_A, 25_000, 1)]);
    let summary = engine.state.observer.poll_once().await.unwrap();
    assert_eq!(summary.events_applied, 0);
    assert_eq!(
        engine.state.payments.get(p.id).await.unwrap().state,
        PaymentState::Confirming
    );
}
