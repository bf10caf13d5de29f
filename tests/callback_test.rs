mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{callback, payment_request, payment_request_to, Harness};
use stk_lifecycle::database::transaction::TransactionState;
use stk_lifecycle::payments::providers::sandbox::USER_CANCELLED_NUMBER;
use stk_lifecycle::payments::providers::SandboxQueryMode;
use stk_lifecycle::payments::types::{CallbackAck, ErrorCategory, ReceiptSource};
use stk_lifecycle::services::notification::{PAYMENT_COMPLETED, PAYMENT_FAILED};

#[tokio::test]
async fn success_callback_completes_and_settles_once() {
    let h = Harness::new();
    let mut completed_events = h.notifier.subscribe(PAYMENT_COMPLETED).unwrap();
    let initiation = h
        .lifecycle
        .request_payment(payment_request("order-b"))
        .await
        .unwrap();
    let tx = h.stored(initiation.transaction_id).await;

    let ack = h.lifecycle.handle_callback(callback(&tx, 0, Some("ABC123"))).await;
    assert_eq!(ack, CallbackAck::accepted());

    let stored = h.stored(tx.id).await;
    assert_eq!(stored.state, TransactionState::Completed);
    assert_eq!(stored.receipt_number.as_deref(), Some("ABC123"));
    assert_eq!(stored.result_code, Some(0));
    assert_eq!(stored.paid_amount, Some(500));
    assert!(stored.completed_at.is_some());
    assert!(stored.callback_received_at.is_some());
    assert!(!stored.recovered_via_query);

    let settlements = h.settlement.records().await;
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].transaction_id, tx.id);
    assert_eq!(settlements[0].receipt, "ABC123");
    assert_eq!(settlements[0].amount, 500);
    assert_eq!(settlements[0].order_id, "order-b");
    assert_eq!(settlements[0].receipt_source, ReceiptSource::Provider);

    let event = completed_events.recv().await.unwrap();
    assert_eq!(event.transaction_id, tx.id);
    assert_eq!(event.details["receipt"], "ABC123");
}

#[tokio::test]
async fn duplicate_callback_is_acknowledged_without_side_effects() {
    let h = Harness::new();
    let initiation = h
        .lifecycle
        .request_payment(payment_request("order-c"))
        .await
        .unwrap();
    let tx = h.stored(initiation.transaction_id).await;
    let notification = callback(&tx, 0, Some("ABC123"));

    h.lifecycle.handle_callback(notification.clone()).await;
    let after_first = h.stored(tx.id).await;

    let ack = h.lifecycle.handle_callback(notification).await;
    assert_eq!(ack, CallbackAck::accepted());

    assert_eq!(h.stored(tx.id).await, after_first);
    assert_eq!(h.settlement.count().await, 1);
}

#[tokio::test]
async fn callback_for_unknown_checkout_is_acknowledged() {
    let h = Harness::new();
    let initiation = h
        .lifecycle
        .request_payment(payment_request("order-unknown"))
        .await
        .unwrap();
    let mut tx = h.stored(initiation.transaction_id).await;
    tx.checkout_request_id = Some("ws_CO_does_not_exist".to_string());

    let ack = h.lifecycle.handle_callback(callback(&tx, 0, Some("XYZ"))).await;

    assert_eq!(ack, CallbackAck::accepted());
    assert_eq!(
        h.stored(initiation.transaction_id).await.state,
        TransactionState::AwaitingConfirmation
    );
    assert_eq!(h.settlement.count().await, 0);
}

#[tokio::test]
async fn failure_callback_is_classified() {
    let h = Harness::new();
    let mut failed_events = h.notifier.subscribe(PAYMENT_FAILED).unwrap();
    let initiation = h
        .lifecycle
        .request_payment(payment_request_to("order-cancelled", USER_CANCELLED_NUMBER))
        .await
        .unwrap();
    let notification = h.provider_callback(initiation.transaction_id).await;
    assert_eq!(notification.result_code, 1032);

    h.lifecycle.handle_callback(notification).await;

    let stored = h.stored(initiation.transaction_id).await;
    assert_eq!(stored.state, TransactionState::Failed);
    assert_eq!(stored.result_code, Some(1032));
    assert_eq!(stored.error_category, Some(ErrorCategory::UserCancelled));
    assert!(stored.error_retryable);
    assert!(stored.receipt_number.is_none());
    assert_eq!(h.settlement.count().await, 0);

    let event = failed_events.recv().await.unwrap();
    assert_eq!(event.details["code"], 1032);
}

#[tokio::test]
async fn raw_payload_is_parsed_and_applied() {
    let h = Harness::new();
    let initiation = h
        .lifecycle
        .request_payment(payment_request("order-raw"))
        .await
        .unwrap();
    let tx = h.stored(initiation.transaction_id).await;

    let payload = serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": tx.merchant_request_id,
                "CheckoutRequestID": tx.checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": 500.00 },
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                        { "Name": "Balance" },
                        { "Name": "TransactionDate", "Value": 20191219102115u64 },
                        { "Name": "PhoneNumber", "Value": 254708374149u64 }
                    ]
                }
            }
        }
    });

    let ack = h
        .lifecycle
        .handle_callback_payload(payload.to_string().as_bytes())
        .await;
    assert_eq!(ack.result_code, 0);

    let stored = h.stored(tx.id).await;
    assert_eq!(stored.state, TransactionState::Completed);
    assert_eq!(stored.receipt_number.as_deref(), Some("NLJ7RT61SV"));
}

#[tokio::test]
async fn malformed_payload_is_still_acknowledged() {
    let h = Harness::new();
    let ack = h.lifecycle.handle_callback_payload(b"{not json").await;
    assert_eq!(ack, CallbackAck::accepted());

    let ack = h
        .lifecycle
        .handle_callback_payload(br#"{"Body": {"unexpected": true}}"#)
        .await;
    assert_eq!(ack, CallbackAck::accepted());
}

#[tokio::test]
async fn settlement_failure_does_not_revert_completion() {
    let h = Harness::new();
    h.settlement.fail_with_unavailable();
    let initiation = h
        .lifecycle
        .request_payment(payment_request("order-ledger"))
        .await
        .unwrap();
    let notification = h.provider_callback(initiation.transaction_id).await;

    let ack = h.lifecycle.handle_callback(notification).await;

    assert_eq!(ack, CallbackAck::accepted());
    assert_eq!(
        h.stored(initiation.transaction_id).await.state,
        TransactionState::Completed
    );
    assert_eq!(h.settlement.count().await, 1);
}

#[tokio::test]
async fn late_callback_after_expiry_is_ignored() {
    let h = Harness::new();
    let t0 = Utc::now() - ChronoDuration::minutes(10);
    let initiation = h
        .lifecycle
        .request_payment_at(payment_request("order-late"), t0)
        .await
        .unwrap();
    h.worker()
        .run_expiry_pass(t0 + ChronoDuration::minutes(6))
        .await
        .unwrap();

    let notification = h.provider_callback(initiation.transaction_id).await;
    let ack = h.lifecycle.handle_callback(notification).await;

    assert_eq!(ack, CallbackAck::accepted());
    assert_eq!(
        h.stored(initiation.transaction_id).await.state,
        TransactionState::Expired
    );
    assert_eq!(h.settlement.count().await, 0);
}

#[tokio::test]
async fn callback_racing_a_query_transitions_once() {
    let h = Harness::new();
    h.gateway.set_query_mode(SandboxQueryMode::Resolve).await;
    let initiation = h
        .lifecycle
        .request_payment(payment_request("order-race"))
        .await
        .unwrap();
    let notification = h.provider_callback(initiation.transaction_id).await;

    let (ack, queried) = tokio::join!(
        h.lifecycle.handle_callback(notification),
        h.lifecycle.query(initiation.transaction_id)
    );

    assert_eq!(ack, CallbackAck::accepted());
    assert_eq!(queried.unwrap().state, TransactionState::Completed);
    assert_eq!(
        h.stored(initiation.transaction_id).await.state,
        TransactionState::Completed
    );
    assert_eq!(h.settlement.count().await, 1);
}

#[tokio::test]
async fn success_without_receipt_settles_a_marked_stand_in() {
    let h = Harness::new();
    let initiation = h
        .lifecycle
        .request_payment(payment_request("order-no-receipt"))
        .await
        .unwrap();
    let tx = h.stored(initiation.transaction_id).await;
    let checkout = tx.checkout_request_id.clone().unwrap();

    h.lifecycle.handle_callback(callback(&tx, 0, None)).await;

    let stored = h.stored(tx.id).await;
    assert_eq!(stored.state, TransactionState::Completed);
    assert_eq!(stored.receipt_number.as_deref(), Some(checkout.as_str()));
    assert_eq!(stored.receipt_source, Some(ReceiptSource::CheckoutRequest));

    let settlements = h.settlement.records().await;
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].receipt, checkout);
    assert_eq!(settlements[0].receipt_source, ReceiptSource::CheckoutRequest);
}
