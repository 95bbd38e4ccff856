use crate::handlers::common::success_response;
use crate::{
    errors::ServiceError,
    events::Event,
    services::commerce::WebhookOutcome,
    AppState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Header carrying the hex HMAC of the raw body
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

/// The only event that can confirm a payment
pub const PAYMENT_CAPTURED: &str = "payment.captured";

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/payment", post(payment_webhook))
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    payload: Option<WebhookPayload>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    payment: PaymentWrapper,
}

#[derive(Debug, Deserialize)]
struct PaymentWrapper {
    entity: PaymentEntity,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub event: Option<String>,
    pub outcome: &'static str,
}

fn ack(event: Option<String>, outcome: &'static str) -> axum::response::Response {
    success_response(WebhookAck { event, outcome })
}

// POST /api/v1/webhooks/payment
//
// Deliveries may arrive before, after or instead of the client's own
// verification call; they go through the same idempotent confirmation.
// Only database failures answer 5xx so the gateway redelivers.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if !state.gateway.webhook_enabled() {
        warn!("Payment webhook received but no webhook secret is configured; ignoring");
        return Ok(ack(None, "ignored"));
    }

    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !state.gateway.verify_webhook(&body, signature) {
        warn!("Payment webhook signature verification failed");
        return Err(ServiceError::Unauthorized(
            "invalid webhook signature".to_string(),
        ));
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    state
        .event_sender
        .send_or_log(Event::WebhookReceived {
            event: envelope.event.clone(),
        })
        .await;

    if envelope.event != PAYMENT_CAPTURED {
        info!(event = %envelope.event, "Unhandled payment webhook event");
        return Ok(ack(Some(envelope.event), "ignored"));
    }

    let entity = envelope
        .payload
        .map(|p| p.payment.entity)
        .ok_or_else(|| ServiceError::BadRequest("missing payment entity".to_string()))?;

    let outcome = match state
        .services
        .reconciliation
        .confirm_from_webhook(&entity.order_id, &entity.id)
        .await
    {
        Ok(WebhookOutcome::Confirmed) => "confirmed",
        Ok(WebhookOutcome::AlreadyConfirmed) => "already_confirmed",
        Ok(WebhookOutcome::UnknownOrder) => "unknown_order",
        Err(err) if err.status_code().is_server_error() => return Err(err),
        Err(err) => {
            warn!(
                gateway_order_id = %entity.order_id,
                payment_id = %entity.id,
                error = %err,
                "Webhook confirmation rejected"
            );
            "rejected"
        }
    };

    info!(gateway_order_id = %entity.order_id, outcome, "Payment webhook processed");
    Ok(ack(Some(envelope.event), outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_captured_payment_entity() {
        let body = br#"{
            "event": "payment.captured",
            "payload": {"payment": {"entity": {"id": "pay_1", "order_id": "order_9", "amount": 1000}}}
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_slice(body).unwrap();
        assert_eq!(envelope.event, PAYMENT_CAPTURED);
        let entity = envelope.payload.unwrap().payment.entity;
        assert_eq!(entity.id, "pay_1");
        assert_eq!(entity.order_id, "order_9");
    }

    #[test]
    fn other_events_need_no_payload() {
        let envelope: WebhookEnvelope =
            serde_json::from_slice(br#"{"event":"order.paid"}"#).unwrap();
        assert!(envelope.payload.is_none());
    }
}
