use crate::handlers::common::success_response;
use crate::{errors::ServiceError, AppState};
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;

pub fn coupon_routes() -> Router<AppState> {
    Router::new().route("/coupons/validate", get(validate_coupon))
}

#[derive(Debug, Deserialize)]
pub struct ValidateCouponQuery {
    pub code: String,
    pub order_total: Decimal,
}

/// Read-only check of a coupon against an order total, with the discount it
/// would give. Never consumes a use.
async fn validate_coupon(
    State(state): State<AppState>,
    Query(query): Query<ValidateCouponQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let preview = state
        .services
        .coupon
        .preview(&query.code, query.order_total)
        .await?;

    Ok(success_response(preview))
}
