//! Hosted-checkout payment gateway.
//!
//! The server only creates orders and verifies the signature the checkout
//! hands back to the browser; collecting the money happens on the gateway's
//! own page.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::GatewayConfig;

const DEFAULT_BASE_URL: &str = "https://api.razorpay.com";
const USER_AGENT: &str = concat!("dakiya/", env!("CARGO_PKG_VERSION"));

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payment gateway refused the order: {0}")]
    Api(String),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    /// Smallest currency unit.
    pub amount: i64,
    pub currency: String,
    /// Our reference, the checkout intent id.
    pub receipt: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

/// What the hosted checkout returns on success.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
}

#[axum::async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Public key the browser opens the checkout with.
    fn key_id(&self) -> &str;

    async fn create_order(&self, request: &OrderRequest) -> Result<GatewayOrder, GatewayError>;

    fn verify(&self, confirmation: &PaymentConfirmation) -> bool;
}

/// Shared handle to whichever gateway the server was started with.
#[derive(Clone)]
pub struct Gateway(pub Arc<dyn PaymentGateway>);

impl std::ops::Deref for Gateway {
    type Target = dyn PaymentGateway;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

pub fn signature_payload(order_id: &str, payment_id: &str) -> String {
    format!("{order_id}|{payment_id}")
}

/// Checks the hex HMAC-SHA256 of `order_id|payment_id` in constant time.
pub fn verify_signature(secret: &str, confirmation: &PaymentConfirmation) -> bool {
    let expected = match hex::decode(confirmation.signature.trim()) {
        Ok(it) => it,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(it) => it,
        Err(_) => return false,
    };
    mac.update(signature_payload(&confirmation.order_id, &confirmation.payment_id).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

pub struct RazorpayGateway {
    http: Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    description: String,
}

impl RazorpayGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            http,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
        })
    }
}

#[axum::async_trait]
impl PaymentGateway for RazorpayGateway {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    #[tracing::instrument(skip_all, fields(receipt = %request.receipt, amount = request.amount))]
    async fn create_order(&self, request: &OrderRequest) -> Result<GatewayOrder, GatewayError> {
        let response = self
            .http
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<ApiErrorEnvelope>()
                .await
                .map(|it| it.error.description)
                .unwrap_or_else(|_| status.to_string());

            tracing::warn!("gateway refused order: {}", message);
            return Err(GatewayError::Api(message));
        }

        let order = response.json::<GatewayOrder>().await?;
        tracing::debug!("gateway order {} created", order.id);

        Ok(order)
    }

    fn verify(&self, confirmation: &PaymentConfirmation) -> bool {
        verify_signature(&self.key_secret, confirmation)
    }
}


#[cfg(test)]
mod tests {
    use super::{fake::sign, *};

    #[test]
    fn test_sign_is_deterministic_and_keyed() {
        let signature = sign("secret", "order_abc", "pay_xyz");

        assert_eq!(signature.len(), 64);
        assert_eq!(signature, sign("secret", "order_abc", "pay_xyz"));
        assert_ne!(signature, sign("secret", "order_abc", "pay_xyy"));
        assert_ne!(signature, sign("secret2", "order_abc", "pay_xyz"));
    }

    #[test]
    fn test_verify_signature() {
        let confirmation = PaymentConfirmation {
            order_id: "order_abc".to_string(),
            payment_id: "pay_xyz".to_string(),
            signature: sign("secret", "order_abc", "pay_xyz"),
        };
        assert!(verify_signature("secret", &confirmation));
        assert!(!verify_signature("other", &confirmation));

        let tampered = PaymentConfirmation {
            payment_id: "pay_other".to_string(),
            ..confirmation.clone()
        };
        assert!(!verify_signature("secret", &tampered));

        let garbage = PaymentConfirmation {
            signature: "zz-not-hex".to_string(),
            ..confirmation
        };
        assert!(!verify_signature("secret", &garbage));
    }

    #[test]
    fn test_base_url_is_normalized() {
        let gateway = RazorpayGateway::new(&GatewayConfig {
            key_id: "rzp_test_key".to_string(),
            key_secret: "secret".to_string(),
            base_url: Some("http://localhost:9999/".to_string()),
        })
        .unwrap();

        assert_eq!(gateway.base_url, "http://localhost:9999");
        assert_eq!(gateway.key_id(), "rzp_test_key");
    }
}
