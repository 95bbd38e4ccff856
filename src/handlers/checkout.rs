use crate::handlers::common::{created_response, message_response, validate_input};
use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::commerce::{CheckoutInput, VerifyOutcome, VerifyPaymentInput},
    AppState,
};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::Serialize;
use tracing::warn;

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(create_order))
        .route("/checkout/verify", post(verify_payment))
}

#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<VerifyOutcome>,
}

/// Create an order from the cart and open a gateway payment
async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CheckoutInput>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let result = state
        .services
        .checkout
        .create_order(user.user_id, payload)
        .await?;

    Ok(created_response(result))
}

/// Confirm a payment the client completed with the gateway widget.
///
/// A bad signature answers `{"success": false}` with 400 and never says which
/// part was wrong.
async fn verify_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<VerifyPaymentInput>,
) -> Result<Response, ServiceError> {
    validate_input(&payload)?;

    match state
        .services
        .reconciliation
        .verify_payment(user.user_id, payload)
        .await
    {
        Ok(outcome) => Ok(message_response(
            VerifyPaymentResponse {
                success: true,
                outcome: Some(outcome),
            },
            "Payment verified",
        )),
        Err(ServiceError::SignatureInvalid) => {
            warn!(user_id = %user.user_id, "Payment verification failed");
            Ok((
                StatusCode::BAD_REQUEST,
                Json(VerifyPaymentResponse {
                    success: false,
                    outcome: None,
                }),
            )
                .into_response())
        }
        Err(err) => Err(err),
    }
}
