use crate::handlers::common::{created_response, success_response, validate_input};
use crate::{
    auth::AdminUser,
    entities::OrderStatus,
    errors::ServiceError,
    services::commerce::{CreateCouponInput, UpdateOrderStatusInput},
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

/// Admin-only routes, nested under `/admin`
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/:id/status", put(update_order_status))
        .route("/coupons", get(list_coupons).post(create_coupon))
}

#[derive(Debug, Deserialize)]
pub struct AdminOrderQuery {
    pub status: Option<OrderStatus>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    20
}

async fn list_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<AdminOrderQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let orders = state
        .services
        .order
        .admin_list(query.status, query.page, query.per_page)
        .await?;

    Ok(success_response(orders))
}

async fn update_order_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusInput>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let status = payload.status;

    let order = state
        .services
        .order
        .admin_update_status(id, payload)
        .await?;

    info!(admin_id = %admin.user_id, order_id = %id, %status, "Admin changed order status");
    Ok(success_response(order))
}

async fn create_coupon(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(payload): Json<CreateCouponInput>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let coupon = state.services.coupon.create(payload).await?;
    Ok(created_response(coupon))
}

async fn list_coupons(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<impl IntoResponse, ServiceError> {
    let coupons = state.services.coupon.list().await?;
    Ok(success_response(coupons))
}
