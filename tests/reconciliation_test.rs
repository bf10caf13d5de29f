mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{payment_request, payment_request_to, Harness};
use std::time::Duration;
use stk_lifecycle::database::transaction::TransactionState;
use stk_lifecycle::error::LifecycleError;
use stk_lifecycle::payments::providers::sandbox::INSUFFICIENT_FUNDS_NUMBER;
use stk_lifecycle::payments::providers::SandboxQueryMode;
use stk_lifecycle::payments::types::{ErrorCategory, ReceiptSource};
use stk_lifecycle::services::payment_lifecycle::NO_RESPONSE_RECEIVED;
use stk_lifecycle::workers::reconciliation::ReconciliationConfig;
use tokio::sync::watch;

#[tokio::test]
async fn unanswered_transaction_expires_after_deadline() {
    let h = Harness::new();
    let t0 = Utc::now();
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-d"), t0)
        .await
        .unwrap();

    let report = h
        .worker()
        .run_cycle_at(t0 + ChronoDuration::minutes(6))
        .await
        .unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(report.query.queried, 0);
    let stored = h.stored(initiation.transaction_id).await;
    assert_eq!(stored.state, TransactionState::Expired);
    assert_eq!(stored.status_reason.as_deref(), Some(NO_RESPONSE_RECEIVED));
    assert!(stored.receipt_number.is_none());
    assert_eq!(h.gateway.query_count(), 0);
}

#[tokio::test]
async fn expiry_does_not_depend_on_provider_availability() {
    let h = Harness::new();
    h.gateway.set_query_mode(SandboxQueryMode::Unavailable).await;
    let t0 = Utc::now();
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-down"), t0)
        .await
        .unwrap();

    let expired = h
        .worker()
        .run_expiry_pass(t0 + ChronoDuration::minutes(5))
        .await
        .unwrap();

    assert_eq!(expired, 1);
    assert_eq!(
        h.stored(initiation.transaction_id).await.state,
        TransactionState::Expired
    );
}

#[tokio::test]
async fn query_pass_waits_for_grace_period() {
    let h = Harness::new();
    let t0 = Utc::now();
    h.lifecycle
        .request_payment_at(payment_request("order-fresh"), t0)
        .await
        .unwrap();

    let report = h
        .worker()
        .run_query_pass(t0 + ChronoDuration::seconds(10))
        .await
        .unwrap();

    assert_eq!(report.queried, 0);
    assert_eq!(h.gateway.query_count(), 0);
}

#[tokio::test]
async fn query_pass_recovers_missed_success() {
    let h = Harness::new();
    let t0 = Utc::now();
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-missed"), t0)
        .await
        .unwrap();

    let now = t0 + ChronoDuration::seconds(60);
    let report = h.worker().run_query_pass(now).await.unwrap();

    assert_eq!(report.queried, 1);
    assert_eq!(report.completed, 1);
    let stored = h.stored(initiation.transaction_id).await;
    assert_eq!(stored.state, TransactionState::Completed);
    assert!(stored.recovered_via_query);
    assert!(stored.receipt_number.as_deref().is_some_and(|r| r.starts_with("SBX")));
    assert_eq!(stored.receipt_source, Some(ReceiptSource::Provider));
    assert_eq!(stored.query_count, 1);
    assert_eq!(stored.last_query_at, Some(now));
    assert!(stored.callback_received_at.is_none());
    assert_eq!(h.settlement.count().await, 1);
}

#[tokio::test]
async fn query_pass_applies_failures() {
    let h = Harness::new();
    let t0 = Utc::now();
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request_to("order-broke", INSUFFICIENT_FUNDS_NUMBER), t0)
        .await
        .unwrap();

    let report = h
        .worker()
        .run_query_pass(t0 + ChronoDuration::seconds(45))
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    let stored = h.stored(initiation.transaction_id).await;
    assert_eq!(stored.state, TransactionState::Failed);
    assert_eq!(stored.error_category, Some(ErrorCategory::InsufficientFunds));
    assert_eq!(stored.result_code, Some(1));
}

#[tokio::test]
async fn still_processing_only_updates_query_bookkeeping() {
    let h = Harness::new();
    h.gateway.set_query_mode(SandboxQueryMode::StillProcessing).await;
    let t0 = Utc::now();
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-wait"), t0)
        .await
        .unwrap();
    let worker = h.worker();

    worker
        .run_query_pass(t0 + ChronoDuration::seconds(40))
        .await
        .unwrap();
    let second = t0 + ChronoDuration::seconds(80);
    let report = worker.run_query_pass(second).await.unwrap();

    assert_eq!(report.still_processing, 1);
    let stored = h.stored(initiation.transaction_id).await;
    assert_eq!(stored.state, TransactionState::AwaitingConfirmation);
    assert_eq!(stored.query_count, 2);
    assert_eq!(stored.last_query_at, Some(second));
}

#[tokio::test]
async fn query_transport_failure_leaves_transaction_untouched() {
    let h = Harness::new();
    h.gateway.set_query_mode(SandboxQueryMode::Unavailable).await;
    let t0 = Utc::now();
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-flaky"), t0)
        .await
        .unwrap();
    let before = h.stored(initiation.transaction_id).await;

    let report = h
        .worker()
        .run_query_pass(t0 + ChronoDuration::seconds(60))
        .await
        .unwrap();

    assert_eq!(report.transport_errors, 1);
    assert_eq!(h.stored(initiation.transaction_id).await, before);

    // A forced query surfaces the same failure to the caller
    let err = h
        .lifecycle
        .query(initiation.transaction_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Transport { .. }));
    assert_eq!(h.stored(initiation.transaction_id).await, before);
}

#[tokio::test]
async fn query_pass_respects_batch_size() {
    let h = Harness::new();
    let t0 = Utc::now();
    for i in 0..5 {
        h.lifecycle
            .request_payment_at(payment_request(&format!("order-batch-{}", i)), t0)
            .await
            .unwrap();
    }

    let worker = h.worker_with(ReconciliationConfig {
        batch_size: 2,
        inter_item_delay: Duration::ZERO,
        ..ReconciliationConfig::default()
    });
    let report = worker
        .run_query_pass(t0 + ChronoDuration::seconds(60))
        .await
        .unwrap();

    assert_eq!(report.queried, 2);
    assert_eq!(h.gateway.query_count(), 2);
}

#[tokio::test]
async fn first_cycle_reports_statistics() {
    let h = Harness::new();
    let t0 = Utc::now() - ChronoDuration::hours(1);
    h.lifecycle
        .request_payment_at(payment_request("order-s1"), t0)
        .await
        .unwrap();
    let failed = h
        .lifecycle
        .request_payment_at(payment_request_to("order-s2", INSUFFICIENT_FUNDS_NUMBER), t0)
        .await
        .unwrap();
    let notification = h.provider_callback(failed.transaction_id).await;
    h.lifecycle.handle_callback_at(notification, t0).await;

    let mut worker = h.worker();
    let now = t0 + ChronoDuration::seconds(45);
    let report = worker.run_cycle_at(now).await.unwrap();
    let stats = report.stats.expect("stats are due on the first cycle");

    assert_eq!(stats.completed.count, 1);
    assert_eq!(stats.completed.amount, 500);
    assert_eq!(stats.failed.count, 1);
    assert_eq!(stats.recovered_via_query, 1);
    assert_eq!(stats.pending, 0);

    let next = worker
        .run_cycle_at(now + ChronoDuration::minutes(2))
        .await
        .unwrap();
    assert!(next.stats.is_none());
}

#[tokio::test]
async fn worker_loop_expires_and_stops_on_shutdown() {
    let h = Harness::new();
    let long_ago = Utc::now() - ChronoDuration::minutes(30);
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-loop"), long_ago)
        .await
        .unwrap();

    let worker = h.worker_with(ReconciliationConfig {
        poll_interval: Duration::from_millis(10),
        inter_item_delay: Duration::ZERO,
        ..ReconciliationConfig::default()
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker stops promptly")
        .unwrap();

    assert_eq!(
        h.stored(initiation.transaction_id).await.state,
        TransactionState::Expired
    );
}

#[tokio::test]
async fn still_processing_query_keeps_an_extended_deadline() {
    let h = Harness::new();
    h.gateway.set_query_mode(SandboxQueryMode::StillProcessing).await;
    let t0 = Utc::now();
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-extended"), t0)
        .await
        .unwrap();
    let listed = h.stored(initiation.transaction_id).await;

    let extended_to = t0 + ChronoDuration::minutes(30);
    h.lifecycle
        .extend_expiry_at(initiation.transaction_id, extended_to, t0 + ChronoDuration::seconds(10))
        .await
        .unwrap();

    // The worker still holds the record as listed before the extension
    let queried_at = t0 + ChronoDuration::seconds(40);
    let saved = h
        .lifecycle
        .reconcile_with_query(listed, queried_at)
        .await
        .unwrap();

    assert_eq!(saved.expires_at, extended_to);
    assert_eq!(saved.query_count, 1);
    assert_eq!(saved.last_query_at, Some(queried_at));
    assert_eq!(h.stored(initiation.transaction_id).await, saved);

    let expired = h
        .worker()
        .run_expiry_pass(t0 + ChronoDuration::minutes(6))
        .await
        .unwrap();
    assert_eq!(expired, 0);
    assert_eq!(
        h.stored(initiation.transaction_id).await.state,
        TransactionState::AwaitingConfirmation
    );
}

#[tokio::test]
async fn overdue_records_do_not_crowd_out_due_queries() {
    let h = Harness::new();
    let t0 = Utc::now() - ChronoDuration::minutes(10);
    let overdue = h
        .lifecycle
        .request_payment_at(payment_request("order-overdue"), t0)
        .await
        .unwrap();
    let due = h
        .lifecycle
        .request_payment_at(payment_request("order-due"), t0 + ChronoDuration::minutes(5))
        .await
        .unwrap();

    let worker = h.worker_with(ReconciliationConfig {
        batch_size: 1,
        inter_item_delay: Duration::ZERO,
        ..ReconciliationConfig::default()
    });
    let report = worker
        .run_query_pass(t0 + ChronoDuration::seconds(340))
        .await
        .unwrap();

    assert_eq!(report.queried, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(
        h.stored(due.transaction_id).await.state,
        TransactionState::Completed
    );
    assert_eq!(
        h.stored(overdue.transaction_id).await.state,
        TransactionState::AwaitingConfirmation
    );
}
