//! Payments endpoints.

use async_trait::async_trait;
use mockall::automock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::ApiClient;
use crate::checkout::PaymentMethod;
use crate::domain::aggregates::{OrderId, PaymentStatus};
use crate::{Result, StorefrontError};

/// What the gateway widget needs to take a payment for an order.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub gateway_order_id: String,
    pub gateway_key_id: String,
    pub amount: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String { "INR".to_string() }

/// Correlation fields echoed back by the gateway, sent for signature checking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub order_id: OrderId,
    pub gateway_payment_id: String,
    pub gateway_order_id: String,
    pub signature: String,
}

#[derive(Debug, Default, Deserialize)]
struct VerificationResponse {
    #[serde(default)]
    status: Option<PaymentStatus>,
    #[serde(default, alias = "verified")]
    success: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: PaymentStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePaymentBody { order_id: OrderId, method: PaymentMethod }

#[derive(Clone, Debug)]
pub struct HttpPaymentsApi {
    client: ApiClient,
}

impl HttpPaymentsApi {
    pub fn new(client: ApiClient) -> Self { Self { client } }
}

#[async_trait]
impl PaymentsApi for HttpPaymentsApi {
    async fn create_session(&self, order_id: OrderId, method: PaymentMethod) -> Result<PaymentSession> {
        self.client.post(&["payments"], &CreatePaymentBody { order_id, method }).await
    }

    async fn verify(&self, request: VerificationRequest) -> Result<bool> {
        let response: VerificationResponse = self.client.post(&["payments", "verify"], &request).await?;
        match (response.success, response.status) {
            (Some(flag), _) => Ok(flag),
            (None, Some(status)) => Ok(status.is_success()),
            (None, None) => Err(StorefrontError::Decode("verification response carries no result".into())),
        }
    }

    async fn latest_status(&self, order_id: OrderId) -> Result<PaymentStatus> {
        let response: StatusResponse = self.client.get(&["payments", "latest", order_id.as_str()]).await?;
        Ok(response.status)
    }
}

#[automock]
#[async_trait]
pub trait PaymentsApi: Send + Sync {
    /// Opens a payment attempt at the gateway for an existing order.
    async fn create_session(&self, order_id: OrderId, method: PaymentMethod) -> Result<PaymentSession>;

    /// Server-side signature check. `Ok(true)` only when the payment is confirmed.
    async fn verify(&self, request: VerificationRequest) -> Result<bool>;

    /// Status of the newest payment attempt for the order.
    async fn latest_status(&self, order_id: OrderId) -> Result<PaymentStatus>;
}
