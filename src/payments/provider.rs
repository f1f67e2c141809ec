use crate::payments::error::PaymentResult;
use crate::payments::types::{PaymentRequest, PushAcknowledgement, StatusQueryResult};
use async_trait::async_trait;

/// Outbound side of an STK push gateway.
#[async_trait]
pub trait StkPushGateway: Send + Sync {
    /// Sends a signed push request. A returned acknowledgement may still have
    /// `accepted == false`; transport and HTTP failures come back as errors.
    async fn initiate_push(&self, request: &PaymentRequest) -> PaymentResult<PushAcknowledgement>;

    /// Asks the gateway for the definitive result of an earlier push.
    async fn query_status(&self, checkout_request_id: &str) -> PaymentResult<StatusQueryResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{RequestSignature, ResultCode};

    struct EchoGateway;

    #[async_trait]
    impl StkPushGateway for EchoGateway {
        async fn initiate_push(
            &self,
            request: &PaymentRequest,
        ) -> PaymentResult<PushAcknowledgement> {
            Ok(PushAcknowledgement {
                accepted: true,
                response_code: "0".to_string(),
                checkout_request_id: format!("ws_CO_{}", request.account_reference),
                merchant_request_id: "29115-34620561-1".to_string(),
                description: "Success. Request accepted for processing".to_string(),
            })
        }

        async fn query_status(
            &self,
            _checkout_request_id: &str,
        ) -> PaymentResult<StatusQueryResult> {
            Ok(StatusQueryResult {
                result_code: ResultCode::new("1032"),
                result_description: "Request cancelled by user".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn gateway_is_object_safe() {
        let gateway: Box<dyn StkPushGateway> = Box::new(EchoGateway);
        let ack = gateway
            .initiate_push(&PaymentRequest {
                subscriber_address: "254712345678".to_string(),
                amount_minor_units: 10,
                account_reference: "INV1".to_string(),
                description: "Payment for goods/services".to_string(),
                signature: RequestSignature {
                    timestamp: "20260101120000".to_string(),
                    password: "x".to_string(),
                },
            })
            .await
            .expect("push should succeed");
        assert!(ack.accepted);
        assert_eq!(ack.checkout_request_id, "ws_CO_INV1");

        let status = gateway.query_status("ws_CO_INV1").await.unwrap();
        assert!(!status.result_code.is_success());
    }
}
