use crate::handlers::common::{success_response, PaginationParams};
use crate::{auth::AuthUser, errors::ServiceError, AppState};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use uuid::Uuid;

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order))
}

/// The caller's orders, newest first
async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let orders = state
        .services
        .order
        .list_for_user(user.user_id, params.page, params.per_page)
        .await?;

    Ok(success_response(orders))
}

/// One of the caller's orders with its lines and payment record
async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.order.get_for_user(user.user_id, id).await?;
    Ok(success_response(order))
}
