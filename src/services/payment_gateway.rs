use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::GatewayConfig;
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Longest gateway error body kept for logs
const MAX_ERROR_BODY: usize = 512;

/// Remote payment order created at the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayIntent {
    pub gateway_order_id: String,
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        ServiceError::GatewayUnavailable(err.to_string())
    }
}

/// Contract with the external payment provider.
///
/// Signature checks return `false` on any mismatch or malformed input; they
/// never error, so callers cannot accidentally treat a failure as success.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a payment order for `amount_minor` (e.g. paise) keyed by `receipt`.
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayIntent, GatewayError>;

    /// Checks the signature the client received after completing payment.
    fn verify_signature(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool;

    /// Checks a webhook delivery's signature over the raw body.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool;

    /// Whether webhook deliveries can be authenticated at all.
    fn webhook_enabled(&self) -> bool;

    /// Public key id handed to the client-side payment widget.
    fn key_id(&self) -> String;
}

fn mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

/// Canonical message the gateway signs for a completed payment.
pub fn payment_message(gateway_order_id: &str, payment_id: &str) -> String {
    format!("{}|{}", gateway_order_id, payment_id)
}

/// Lowercase hex HMAC-SHA256 of `payload`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Signature a genuine gateway would return for this payment.
pub fn sign_payment(secret: &str, gateway_order_id: &str, payment_id: &str) -> String {
    sign_payload(
        secret,
        payment_message(gateway_order_id, payment_id).as_bytes(),
    )
}

/// Constant-time check of a hex signature.
pub fn verify_hex_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = mac(secret);
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Serialize)]
struct CreateOrderRequest<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Deserialize)]
struct CreateOrderResponse {
    id: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

/// REST client for the gateway's orders API
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    webhook_secret: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
            webhook_secret: config.webhook_secret.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self), fields(receipt = %receipt))]
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayIntent, GatewayError> {
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderRequest {
                amount: amount_minor,
                currency,
                receipt,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            error!(status = status.as_u16(), "Gateway rejected order creation");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreateOrderResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if created.id.trim().is_empty() {
            return Err(GatewayError::InvalidResponse("empty order id".into()));
        }
        if let Some(amount) = created.amount {
            if amount != amount_minor {
                return Err(GatewayError::InvalidResponse(format!(
                    "amount mismatch: requested {}, gateway recorded {}",
                    amount_minor, amount
                )));
            }
        }

        info!(gateway_order_id = %created.id, "Gateway order created");
        Ok(GatewayIntent {
            gateway_order_id: created.id,
            amount_minor,
            currency: created.currency.unwrap_or_else(|| currency.to_string()),
        })
    }

    fn verify_signature(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool {
        if gateway_order_id.is_empty() || payment_id.is_empty() {
            return false;
        }
        verify_hex_signature(
            &self.key_secret,
            payment_message(gateway_order_id, payment_id).as_bytes(),
            signature,
        )
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool {
        match &self.webhook_secret {
            Some(secret) => verify_hex_signature(secret, payload, signature),
            None => false,
        }
    }

    fn webhook_enabled(&self) -> bool {
        self.webhook_secret.is_some()
    }

    fn key_id(&self) -> String {
        self.key_id.clone()
    }
}
