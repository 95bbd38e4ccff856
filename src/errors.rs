use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::telemetry::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Stable machine-readable code (e.g., "EMPTY_CART")
    pub code: String,
    /// Human-readable, user-safe description
    pub message: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Quantity must be greater than zero")]
    InvalidQuantity,

    #[error("Quantity per cart line cannot exceed {max}")]
    QuantityLimitExceeded { max: i32 },

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Invalid or inactive coupon code")]
    InvalidCoupon,

    #[error("Coupon has expired")]
    CouponExpired,

    #[error("Coupon usage limit reached")]
    CouponExhausted,

    #[error("Order total must be at least {minimum} to use this coupon")]
    MinimumOrderNotMet { minimum: Decimal },

    /// Carries the provider detail for logs only.
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment signature verification failed")]
    SignatureInvalid,

    #[error("Order does not belong to the current user")]
    OrderOwnershipMismatch,

    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Product {0} not found")]
    ProductNotFound(Uuid),

    #[error("Cannot change order status from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidQuantity
            | Self::QuantityLimitExceeded { .. }
            | Self::EmptyCart
            | Self::InvalidAddress
            | Self::InvalidCoupon
            | Self::CouponExpired
            | Self::MinimumOrderNotMet { .. }
            | Self::SignatureInvalid
            | Self::ValidationError(_)
            | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::CouponExhausted
            | Self::InvalidStatusTransition { .. }
            | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::OrderOwnershipMismatch | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::OrderNotFound(_) | Self::ProductNotFound(_) | Self::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable code clients can branch on without parsing messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::InvalidQuantity => "INVALID_QUANTITY",
            Self::QuantityLimitExceeded { .. } => "QUANTITY_LIMIT_EXCEEDED",
            Self::EmptyCart => "EMPTY_CART",
            Self::InvalidAddress => "INVALID_ADDRESS",
            Self::InvalidCoupon => "INVALID_COUPON",
            Self::CouponExpired => "COUPON_EXPIRED",
            Self::CouponExhausted => "COUPON_EXHAUSTED",
            Self::MinimumOrderNotMet { .. } => "MINIMUM_ORDER_NOT_MET",
            Self::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::OrderOwnershipMismatch => "ORDER_OWNERSHIP_MISMATCH",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::ProductNotFound(_) => "PRODUCT_NOT_FOUND",
            Self::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            Self::GatewayUnavailable(_) => "Payment initialization failed".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.error_code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
