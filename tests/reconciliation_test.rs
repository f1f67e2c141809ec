use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stkpay_backend::database::{InMemoryTransactionStore, TransactionStore};
use stkpay_backend::payments::error::{PaymentError, PaymentResult};
use stkpay_backend::payments::request_builder::{BuilderLimits, PasswordSigner, StkPushBuilder};
use stkpay_backend::payments::types::{
    GatewayResult, PaymentRequest, PushAcknowledgement, ReconciliationSource, ResultCode,
    StatusQueryResult, TransactionStatus,
};
use stkpay_backend::payments::StkPushGateway;
use stkpay_backend::services::reconciliation::ReconciliationCoordinator;
use stkpay_backend::services::stk_push::{PaymentIntent, StkPushService};
use stkpay_backend::workers::reconciliation_sweep::{ReconciliationSweepWorker, SweepConfig};

/// Scripted gateway: hands out sequential checkout ids and answers status
/// queries with whatever the test configured.
struct StubGateway {
    accept: bool,
    query_answer: Mutex<PaymentResult<StatusQueryResult>>,
    pushes: Mutex<Vec<PaymentRequest>>,
}

impl StubGateway {
    fn accepting() -> Self {
        Self {
            accept: true,
            query_answer: Mutex::new(Err(PaymentError::GatewayRejected {
                code: Some("500.001.1001".to_string()),
                description: "The transaction is being processed".to_string(),
            })),
            pushes: Mutex::new(Vec::new()),
        }
    }

    fn rejecting() -> Self {
        Self {
            accept: false,
            ..Self::accepting()
        }
    }

    fn answer_queries_with(&self, code: &str, description: &str) {
        *self.query_answer.lock().unwrap() = Ok(StatusQueryResult {
            result_code: ResultCode::new(code),
            result_description: description.to_string(),
        });
    }
}

#[async_trait]
impl StkPushGateway for StubGateway {
    async fn initiate_push(&self, request: &PaymentRequest) -> PaymentResult<PushAcknowledgement> {
        let mut pushes = self.pushes.lock().unwrap();
        pushes.push(request.clone());
        let n = pushes.len();

        if !self.accept {
            return Ok(PushAcknowledgement {
                accepted: false,
                response_code: "1".to_string(),
                checkout_request_id: String::new(),
                merchant_request_id: String::new(),
                description: "Invalid Access Token".to_string(),
            });
        }

        Ok(PushAcknowledgement {
            accepted: true,
            response_code: "0".to_string(),
            checkout_request_id: format!("ws_CO_{:04}", n),
            merchant_request_id: format!("29115-{:04}", n),
            description: "Success. Request accepted for processing".to_string(),
        })
    }

    async fn query_status(&self, _checkout_request_id: &str) -> PaymentResult<StatusQueryResult> {
        self.query_answer.lock().unwrap().clone()
    }
}

struct Harness {
    store: Arc<InMemoryTransactionStore>,
    gateway: Arc<StubGateway>,
    service: StkPushService,
    coordinator: ReconciliationCoordinator,
}

fn harness(gateway: StubGateway) -> Harness {
    let store = Arc::new(InMemoryTransactionStore::new());
    let gateway = Arc::new(gateway);
    let builder = StkPushBuilder::new(
        PasswordSigner::new("174379", "passkey"),
        BuilderLimits::default(),
    );
    let service = StkPushService::new(builder, gateway.clone(), store.clone());
    let coordinator = ReconciliationCoordinator::new(store.clone(), gateway.clone());
    Harness {
        store,
        gateway,
        service,
        coordinator,
    }
}

fn intent(phone: &str, amount: &str, reference: Option<&str>) -> PaymentIntent {
    PaymentIntent {
        subscriber_address: phone.to_string(),
        amount_raw: amount.to_string(),
        reference: reference.map(str::to_string),
    }
}

fn success_callback(checkout_request_id: &str, amount: JsonValue) -> JsonValue {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-0001",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": amount },
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                        { "Name": "Balance" },
                        { "Name": "TransactionDate", "Value": 20191219102115u64 },
                        { "Name": "PhoneNumber", "Value": 254712345678u64 }
                    ]
                }
            }
        }
    })
}

fn failure_callback(checkout_request_id: &str) -> JsonValue {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-0001",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "MpesaReceiptNumber", "Value": "SHOULDNOTAPPEAR" }
                    ]
                }
            }
        }
    })
}

#[tokio::test]
async fn push_then_success_callback_completes_with_receipt() {
    let h = harness(StubGateway::accepting());

    let initiated = h
        .service
        .initiate(&intent("0712345678", "70000", Some("BuyGoods")))
        .await
        .unwrap();
    assert!(initiated.accepted);

    let pending = h
        .store
        .find_by_checkout_request_id(&initiated.checkout_request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(pending.subscriber_address, "254712345678");
    assert_eq!(pending.amount_minor_units, 70000);
    assert_eq!(pending.account_reference, "BuyGoods");

    let pushed = h.gateway.pushes.lock().unwrap()[0].clone();
    assert_eq!(pushed.subscriber_address, "254712345678");
    assert_eq!(pushed.account_reference, "BuyGoods");

    let ack = h
        .coordinator
        .handle_callback(&success_callback(&initiated.checkout_request_id, json!(70000.00)))
        .await
        .unwrap();
    assert_eq!(ack.status, TransactionStatus::Completed);
    assert_eq!(ack.transaction_id, initiated.transaction_id);

    let completed = h.service.find_by_id(initiated.transaction_id).await.unwrap();
    assert_eq!(completed.status, TransactionStatus::Completed);
    assert_eq!(completed.receipt_number.as_deref(), Some("NLJ7RT61SV"));
    assert_eq!(completed.result_code.as_deref(), Some("0"));
    assert_eq!(completed.amount_minor_units, 70000);
    assert!(completed.callback_received_at.is_some());
    assert!(completed.raw_callback_payload.is_some());
    assert_eq!(
        completed.transaction_timestamp.unwrap().to_rfc3339(),
        "2019-12-19T07:21:15+00:00"
    );
}

#[tokio::test]
async fn later_poll_success_keeps_callback_description() {
    let h = harness(StubGateway::accepting());
    let initiated = h
        .service
        .initiate(&intent("0712345678", "70000", Some("BuyGoods")))
        .await
        .unwrap();
    h.coordinator
        .handle_callback(&success_callback(&initiated.checkout_request_id, json!(70000)))
        .await
        .unwrap();

    h.gateway
        .answer_queries_with("0", "The service request has been accepted successsfully");
    let polled = h
        .coordinator
        .poll_status(&initiated.checkout_request_id)
        .await
        .unwrap();

    assert_eq!(polled.status, TransactionStatus::Completed);
    assert_eq!(
        polled.result_description.as_deref(),
        Some("The service request is processed successfully.")
    );
    assert_eq!(polled.receipt_number.as_deref(), Some("NLJ7RT61SV"));

    let stored = h.service.find_by_id(initiated.transaction_id).await.unwrap();
    assert!(stored.last_checked_at.is_some());
}

#[tokio::test]
async fn cancelled_callback_fails_without_metadata() {
    let h = harness(StubGateway::accepting());
    let initiated = h
        .service
        .initiate(&intent("0712345678", "100", None))
        .await
        .unwrap();

    let ack = h
        .coordinator
        .handle_callback(&failure_callback(&initiated.checkout_request_id))
        .await
        .unwrap();
    assert_eq!(ack.status, TransactionStatus::Failed);

    let failed = h.service.find_by_id(initiated.transaction_id).await.unwrap();
    assert_eq!(failed.status, TransactionStatus::Failed);
    assert_eq!(failed.result_code.as_deref(), Some("1032"));
    assert_eq!(failed.result_description.as_deref(), Some("Request cancelled by user"));
    assert!(failed.receipt_number.is_none());
    assert!(failed.transaction_timestamp.is_none());
    assert_eq!(failed.account_reference, "254712345678");
}

#[tokio::test]
async fn duplicate_callback_is_idempotent() {
    let h = harness(StubGateway::accepting());
    let initiated = h
        .service
        .initiate(&intent("0712345678", "250", Some("INV-1")))
        .await
        .unwrap();
    let payload = success_callback(&initiated.checkout_request_id, json!(250));

    h.coordinator.handle_callback(&payload).await.unwrap();
    let first = h.service.find_by_id(initiated.transaction_id).await.unwrap();

    let ack = h.coordinator.handle_callback(&payload).await.unwrap();
    assert_eq!(ack.status, TransactionStatus::Completed);
    let second = h.service.find_by_id(initiated.transaction_id).await.unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.receipt_number, second.receipt_number);
    assert_eq!(first.result_description, second.result_description);
    assert_eq!(first.callback_received_at, second.callback_received_at);

    // a late failure cannot undo the success
    h.coordinator
        .handle_callback(&failure_callback(&initiated.checkout_request_id))
        .await
        .unwrap();
    let third = h.service.find_by_id(initiated.transaction_id).await.unwrap();
    assert_eq!(third.status, TransactionStatus::Completed);
    assert_eq!(third.result_code.as_deref(), Some("0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_callback_and_poll_produce_one_outcome() {
    for _ in 0..25 {
        let h = harness(StubGateway::accepting());
        let initiated = h
            .service
            .initiate(&intent("0712345678", "500", None))
            .await
            .unwrap();
        let id = initiated.checkout_request_id.clone();

        let callback = {
            let coordinator = h.coordinator.clone();
            let payload = success_callback(&id, json!(500));
            tokio::spawn(async move {
                let result = stkpay_backend::payments::callback::StkCallback::from_payload(&payload)
                    .unwrap()
                    .into_result()
                    .1;
                coordinator
                    .apply_result(&id, result, ReconciliationSource::Callback, Some(payload))
                    .await
            })
        };
        let poll = {
            let coordinator = h.coordinator.clone();
            let id = initiated.checkout_request_id.clone();
            tokio::spawn(async move {
                coordinator
                    .apply_result(
                        &id,
                        GatewayResult {
                            result_code: ResultCode::new("1037"),
                            result_description: "DS timeout user cannot be reached".to_string(),
                            metadata: None,
                        },
                        ReconciliationSource::Poll,
                        None,
                    )
                    .await
            })
        };

        let callback = callback.await.unwrap().unwrap();
        let poll = poll.await.unwrap().unwrap();
        assert!(callback.applied ^ poll.applied, "exactly one path must win");

        let stored = h.service.find_by_id(initiated.transaction_id).await.unwrap();
        if callback.applied {
            assert_eq!(stored.status, TransactionStatus::Completed);
            assert_eq!(stored.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        } else {
            assert_eq!(stored.status, TransactionStatus::Failed);
            assert!(stored.receipt_number.is_none());
        }
        assert_eq!(callback.transaction.status, stored.status);
        assert_eq!(poll.transaction.status, stored.status);
    }
}

#[tokio::test]
async fn amount_persists_unless_metadata_overrides_it() {
    let h = harness(StubGateway::accepting());

    let rounded = h
        .service
        .initiate(&intent("712345678", "10.5", None))
        .await
        .unwrap();
    h.gateway.answer_queries_with("0", "processed");
    h.coordinator
        .poll_status(&rounded.checkout_request_id)
        .await
        .unwrap();
    let stored = h.service.find_by_id(rounded.transaction_id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert_eq!(stored.amount_minor_units, 11);

    let overridden = h
        .service
        .initiate(&intent("+254712345678", "300", None))
        .await
        .unwrap();
    h.coordinator
        .handle_callback(&success_callback(&overridden.checkout_request_id, json!(299)))
        .await
        .unwrap();
    let stored = h.service.find_by_id(overridden.transaction_id).await.unwrap();
    assert_eq!(stored.amount_minor_units, 299);
}

#[tokio::test]
async fn callback_for_unknown_checkout_id_is_not_found() {
    let h = harness(StubGateway::accepting());
    let err = h
        .coordinator
        .handle_callback(&success_callback("ws_CO_unknown", json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::NotFound { .. }));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn malformed_callback_is_structural_error() {
    let h = harness(StubGateway::accepting());
    let err = h
        .coordinator
        .handle_callback(&json!({ "Body": {} }))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::StructuralCallbackError { .. }));
}

#[tokio::test]
async fn rejected_push_creates_no_record() {
    let h = harness(StubGateway::rejecting());
    let err = h
        .service
        .initiate(&intent("0712345678", "100", None))
        .await
        .unwrap_err();
    match err {
        PaymentError::GatewayRejected { code, description } => {
            assert_eq!(code.as_deref(), Some("1"));
            assert_eq!(description, "Invalid Access Token");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn invalid_input_never_reaches_gateway() {
    let h = harness(StubGateway::accepting());
    let err = h
        .service
        .initiate(&intent("0712-45678", "100", None))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::ValidationError { .. }));
    assert!(h.gateway.pushes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn inconclusive_poll_only_stamps_last_checked() {
    let h = harness(StubGateway::accepting());
    let initiated = h
        .service
        .initiate(&intent("0712345678", "100", None))
        .await
        .unwrap();

    let err = h
        .coordinator
        .poll_status(&initiated.checkout_request_id)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::GatewayRejected { .. }));

    let stored = h.service.find_by_id(initiated.transaction_id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);
    assert!(stored.last_checked_at.is_some());
    assert!(stored.result_code.is_none());
}

#[tokio::test]
async fn poll_for_unknown_checkout_id_is_not_found() {
    let h = harness(StubGateway::accepting());
    let err = h.coordinator.poll_status("ws_CO_missing").await.unwrap_err();
    assert!(matches!(err, PaymentError::NotFound { .. }));
}

#[tokio::test]
async fn sweep_reconciles_stale_pending_transactions() {
    let h = harness(StubGateway::accepting());
    let first = h
        .service
        .initiate(&intent("0712345678", "100", None))
        .await
        .unwrap();
    let second = h
        .service
        .initiate(&intent("0722000000", "200", None))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let worker = ReconciliationSweepWorker::new(
        h.store.clone(),
        h.coordinator.clone(),
        SweepConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            batch_size: 10,
            min_age: Duration::ZERO,
        },
    );

    // gateway still processing: both stay pending and get stamped
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.still_pending, 2);
    assert_eq!(report.reconciled, 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.gateway.answer_queries_with("1032", "Request cancelled by user");
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.reconciled, 2);

    for id in [first.transaction_id, second.transaction_id] {
        let stored = h.service.find_by_id(id).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
    }

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.examined, 0);
}
