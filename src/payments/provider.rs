use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CorrelationIds, PaymentOutcome, ProviderName, SubmitRequest, SubmitResponse,
};
use async_trait::async_trait;

/// Upstream mobile-money provider. Implementations may be slow, rate limited,
/// or unavailable; callers bound every call with their own timeout.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Send a push request to the subscriber's handset.
    async fn submit(&self, request: SubmitRequest) -> PaymentResult<SubmitResponse>;

    /// Ask the provider for the current status of an accepted request.
    async fn query(&self, correlation_ids: &CorrelationIds) -> PaymentResult<PaymentOutcome>;

    fn name(&self) -> ProviderName;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::ErrorCategory;

    struct MockGateway;

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn submit(&self, request: SubmitRequest) -> PaymentResult<SubmitResponse> {
            Ok(SubmitResponse::Accepted {
                correlation_ids: CorrelationIds {
                    merchant_request_id: format!("m-{}", request.account_reference),
                    checkout_request_id: "c-1".to_string(),
                },
                customer_message: None,
            })
        }

        async fn query(&self, _ids: &CorrelationIds) -> PaymentResult<PaymentOutcome> {
            Ok(PaymentOutcome::Failure {
                category: ErrorCategory::UserCancelled,
                code: 1032,
                message: "Request cancelled by user".to_string(),
            })
        }

        fn name(&self) -> ProviderName {
            ProviderName::Sandbox
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn PaymentGateway> = Box::new(MockGateway);
        let response = gateway
            .submit(SubmitRequest {
                phone_number: "254708374149".to_string(),
                amount: 500,
                account_reference: "ORD-1".to_string(),
                description: "Order".to_string(),
                callback_url: None,
            })
            .await
            .expect("submit should succeed");

        let ids = match response {
            SubmitResponse::Accepted {
                correlation_ids, ..
            } => correlation_ids,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(ids.merchant_request_id, "m-ORD-1");

        let outcome = gateway.query(&ids).await.expect("query should succeed");
        assert!(matches!(outcome, PaymentOutcome::Failure { code: 1032, .. }));
    }
}
