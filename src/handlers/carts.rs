use crate::handlers::common::{success_response, validate_input};
use crate::{
    auth::{AuthUser, CartIdentity},
    errors::ServiceError,
    services::commerce::AddToCartInput,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart))
        .route("/cart/items", post(add_to_cart))
        .route(
            "/cart/items/:product_id",
            put(update_cart_item).delete(remove_cart_item),
        )
        .route("/cart/merge", post(merge_cart))
}

/// Set an absolute quantity; zero or less removes the line
#[derive(Debug, Deserialize)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MergeCartRequest {
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
}

/// Get the caller's cart, creating it on first use
async fn get_cart(
    State(state): State<AppState>,
    identity: CartIdentity,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.cart.get_or_create(&identity).await?;
    Ok(success_response(cart))
}

/// Add item to cart
async fn add_to_cart(
    State(state): State<AppState>,
    identity: CartIdentity,
    Json(payload): Json<AddToCartInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .cart
        .add_item(&identity, payload.product_id, payload.quantity)
        .await?;

    Ok(success_response(cart))
}

/// Update cart item quantity
async fn update_cart_item(
    State(state): State<AppState>,
    identity: CartIdentity,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<UpdateCartItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .cart
        .update_item(&identity, product_id, payload.quantity)
        .await?;

    Ok(success_response(cart))
}

/// Remove item from cart
async fn remove_cart_item(
    State(state): State<AppState>,
    identity: CartIdentity,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state
        .services
        .cart
        .remove_item(&identity, product_id)
        .await?;

    Ok(success_response(cart))
}

/// Fold the anonymous cart into the signed-in user's cart
async fn merge_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<MergeCartRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .cart
        .merge(user.user_id, &payload.session_id)
        .await?;

    info!(user_id = %user.user_id, "Cart merge requested");
    Ok(success_response(cart))
}
