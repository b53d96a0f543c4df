use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Our order id, echoed back by the gateway in its callbacks' metadata.
    pub reference: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    #[serde(rename = "id")]
    pub provider_order_id: String,
    pub checkout_token: String,
}

/// key: payment-gateway -> outbound checkout creation
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> AppResult<CheckoutSession>;
}

/// Talks to the gateway's REST API with a bounded timeout.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|err| AppError::Message(format!("failed to build gateway client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_checkout(&self, request: &CheckoutRequest) -> AppResult<CheckoutSession> {
        let url = format!("{}/v1/orders", self.base_url);
        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|err| {
            warn!(?err, reference = %request.reference, "payment gateway request failed");
            AppError::UpstreamUnavailable(if err.is_timeout() {
                "gateway timed out".to_string()
            } else {
                "gateway unreachable".to_string()
            })
        })?;

        let status = response.status();
        if status.is_server_error() {
            warn!(%status, reference = %request.reference, "payment gateway failed");
            return Err(AppError::UpstreamUnavailable(format!(
                "gateway responded with {status}"
            )));
        }
        if !status.is_success() {
            // not retryable: credentials or request shape are wrong
            error!(%status, reference = %request.reference, "payment gateway rejected checkout");
            return Err(AppError::Message(format!(
                "gateway rejected checkout with {status}"
            )));
        }

        response.json::<CheckoutSession>().await.map_err(|err| {
            warn!(?err, reference = %request.reference, "payment gateway sent malformed checkout");
            AppError::UpstreamUnavailable("gateway response was malformed".to_string())
        })
    }
}

/// Local stand-in used when no gateway URL is configured.
pub struct StubPaymentGateway;

#[async_trait]
impl PaymentGateway for StubPaymentGateway {
    async fn create_checkout(&self, request: &CheckoutRequest) -> AppResult<CheckoutSession> {
        Ok(CheckoutSession {
            provider_order_id: format!("stub_{}", request.reference.simple()),
            checkout_token: format!("stub_tok_{}", Uuid::new_v4().simple()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn checkout() -> CheckoutRequest {
        CheckoutRequest {
            reference: Uuid::new_v4(),
            amount_cents: 499,
            currency: "USD".into(),
            description: "50 credits".into(),
        }
    }

    #[tokio::test]
    async fn http_gateway_returns_session() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/orders")
                    .header("authorization", "Bearer sk_test");
                then.status(200)
                    .json_body(json!({ "id": "prov_123", "checkout_token": "tok_abc" }));
            })
            .await;

        let gateway = HttpPaymentGateway::new(
            &server.base_url(),
            Some("sk_test".into()),
            Duration::from_secs(2),
        )
        .unwrap();
        let session = gateway.create_checkout(&checkout()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(session.provider_order_id, "prov_123");
        assert_eq!(session.checkout_token, "tok_abc");
    }

    #[tokio::test]
    async fn http_gateway_maps_server_errors_to_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/orders");
                then.status(503);
            })
            .await;

        let gateway =
            HttpPaymentGateway::new(&server.base_url(), None, Duration::from_secs(2)).unwrap();
        let err = gateway.create_checkout(&checkout()).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn http_gateway_client_errors_are_not_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/orders");
                then.status(401)
                    .json_body(json!({ "error": "invalid api key" }));
            })
            .await;

        let gateway = HttpPaymentGateway::new(
            &server.base_url(),
            Some("sk_revoked".into()),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = gateway.create_checkout(&checkout()).await.unwrap_err();
        assert!(matches!(err, AppError::Message(_)));
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn http_gateway_times_out_instead_of_hanging() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/orders");
                then.status(200)
                    .delay(Duration::from_millis(800))
                    .json_body(json!({ "id": "late", "checkout_token": "late" }));
            })
            .await;

        let gateway =
            HttpPaymentGateway::new(&server.base_url(), None, Duration::from_millis(100)).unwrap();
        let err = gateway.create_checkout(&checkout()).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn stub_gateway_derives_provider_id_from_reference() {
        let request = checkout();
        let session = StubPaymentGateway.create_checkout(&request).await.unwrap();
        assert_eq!(
            session.provider_order_id,
            format!("stub_{}", request.reference.simple())
        );
    }
}
