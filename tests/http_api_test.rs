mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::{body_json, payment_signature, webhook_signature, TestApp, JWT_SECRET};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn decimal(value: &Value) -> Decimal {
    value
        .as_str()
        .expect("decimal serialized as string")
        .parse()
        .expect("valid decimal")
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

async fn webhook(app: &TestApp, body: &Value, signature: Option<String>) -> axum::response::Response {
    let raw = serde_json::to_vec(body).unwrap();
    let signature = signature.unwrap_or_else(|| webhook_signature(&raw));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/webhooks/payment")
        .header("content-type", "application/json")
        .header("x-webhook-signature", signature)
        .body(Body::from(raw))
        .unwrap();
    app.send(request).await
}

fn captured(gateway_order_id: &str, payment_id: &str) -> Value {
    json!({
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "order_id": gateway_order_id,
                    "amount": 50000,
                    "status": "captured"
                }
            }
        }
    })
}

/// Adds one line to the user's cart and checks out over HTTP.
async fn checkout(app: &TestApp, user_id: Uuid, token: &str) -> Value {
    let address = app.create_address(user_id).await;
    let product = app.create_product(dec!(250), None, 50).await;
    let auth = bearer(token);

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({"product_id": product.id, "quantity": 2})),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({"address_id": address.id})),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"].clone()
}

#[tokio::test]
async fn test_health_and_status() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/health", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["data"]["database"], "healthy");

    let response = app.request(Method::GET, "/api/v1/status", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["service"], "storefront-api");
}

#[tokio::test]
async fn test_anonymous_cart_via_session_header() {
    let app = TestApp::new().await;
    let product = app.create_product(dec!(12.50), None, 50).await;
    let session = [("x-session-id", "guest-abc")];

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({"product_id": product.id, "quantity": 3})),
            &session,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(decimal(&body["data"]["subtotal"]), dec!(37.50));
    assert_eq!(body["data"]["total_items"], 3);

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/items/{}", product.id),
            Some(json!({"quantity": 1})),
            &session,
        )
        .await;
    assert_eq!(decimal(&body_json(response).await["data"]["subtotal"]), dec!(12.50));

    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/cart/items/{}", product.id),
            None,
            &session,
        )
        .await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["lines"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_cart_requires_identity_and_positive_quantity() {
    let app = TestApp::new().await;
    let product = app.create_product(dec!(1), None, 50).await;

    let response = app.request(Method::GET, "/api/v1/cart", None, &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "AUTH_MISSING_IDENTITY");

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({"product_id": product.id, "quantity": 0})),
            &[("x-session-id", "guest-q")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_QUANTITY");

    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({"product_id": product.id, "quantity": 1})),
            &[("x-session-id", "guest-q")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/cart/items/{}", product.id),
            Some(json!({"quantity": i32::MAX})),
            &[("x-session-id", "guest-q")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "QUANTITY_LIMIT_EXCEEDED");

    let response = app
        .request(
            Method::GET,
            "/api/v1/cart",
            None,
            &[("authorization", "Bearer not-a-jwt"), ("x-session-id", "guest-q")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_merge_cart_over_http() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let token = app.token_for(user_id, &["CUSTOMER"]);
    let product = app.create_product(dec!(4), None, 50).await;

    app.request(
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({"product_id": product.id, "quantity": 2})),
        &[("x-session-id", "guest-merge")],
    )
    .await;

    let auth = bearer(&token);
    let response = app
        .request(
            Method::POST,
            "/api/v1/cart/merge",
            Some(json!({"session_id": "guest-merge"})),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["total_items"], 2);
    assert_eq!(body["data"]["user_id"], json!(user_id));
}

#[tokio::test]
async fn test_checkout_and_orders_require_authentication() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({"address_id": Uuid::new_v4()})),
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.request(Method::GET, "/api/v1/orders", None, &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let customer = bearer(&app.token_for(Uuid::new_v4(), &["CUSTOMER"]));
    let response = app
        .request(Method::GET, "/api/v1/admin/orders", None, &[("authorization", &customer)])
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let app = TestApp::new().await;
    let past = chrono::Utc::now().timestamp() - 3600;
    let claims = storefront_api::auth::Claims {
        sub: Uuid::new_v4().to_string(),
        roles: vec![],
        exp: past,
        iat: Some(past - 60),
    };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();

    let auth = bearer(&token);
    let response = app
        .request(Method::GET, "/api/v1/orders", None, &[("authorization", &auth)])
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_checkout_then_verify_over_http() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let token = app.token_for(user_id, &["CUSTOMER"]);
    let auth = bearer(&token);

    let data = checkout(&app, user_id, &token).await;
    assert_eq!(data["order"]["status"], "CREATED");
    assert_eq!(data["payment"]["key_id"], "key_test");
    assert_eq!(data["payment"]["amount_minor"], 50_000);
    let order_id = data["order"]["id"].as_str().unwrap().to_string();
    let gateway_order_id = data["payment"]["gateway_order_id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/verify",
            Some(json!({
                "order_id": order_id,
                "gateway_order_id": gateway_order_id,
                "payment_id": "pay_http",
                "signature": "deadbeef"
            })),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await, json!({"success": false}));

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/verify",
            Some(json!({
                "order_id": order_id,
                "gateway_order_id": gateway_order_id,
                "payment_id": "pay_http",
                "signature": payment_signature(&gateway_order_id, "pay_http")
            })),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["success"], true);
    assert_eq!(body["data"]["outcome"], "confirmed");

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            &[("authorization", &auth)],
        )
        .await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "PAID");
    assert_eq!(body["data"]["payment"]["status"], "COMPLETED");

    let response = app
        .request(Method::GET, "/api/v1/orders", None, &[("authorization", &auth)])
        .await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["total"], 1);

    let stranger = bearer(&app.token_for(Uuid::new_v4(), &[]));
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            &[("authorization", &stranger)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_checkout_with_empty_cart_is_bad_request() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let address = app.create_address(user_id).await;
    let auth = bearer(&app.token_for(user_id, &[]));

    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({"address_id": address.id})),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "EMPTY_CART");
}

#[tokio::test]
async fn test_checkout_reports_gateway_outage() {
    let app = TestApp::new().await;
    app.fake.set_failing(true);
    let user_id = Uuid::new_v4();
    let token = app.token_for(user_id, &[]);
    let address = app.create_address(user_id).await;
    let product = app.create_product(dec!(10), None, 50).await;
    let auth = bearer(&token);

    app.request(
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({"product_id": product.id, "quantity": 1})),
        &[("authorization", &auth)],
    )
    .await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({"address_id": address.id})),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["code"], "GATEWAY_UNAVAILABLE");
    assert_eq!(body["message"], "Payment initialization failed");
}

#[tokio::test]
async fn test_webhook_authentication_and_parsing() {
    let app = TestApp::new().await;
    let body = captured("order_x", "pay_x");

    let response = webhook(&app, &body, Some("00ff".into())).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let raw = b"{not json".to_vec();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/webhooks/payment")
        .header("x-webhook-signature", webhook_signature(&raw))
        .body(Body::from(raw))
        .unwrap();
    assert_eq!(app.send(request).await.status(), StatusCode::BAD_REQUEST);

    let response = webhook(&app, &json!({"event": "refund.processed"}), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["outcome"], "ignored");

    let response = webhook(&app, &body, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["outcome"], "unknown_order");
}

#[tokio::test]
async fn test_webhook_is_ignored_without_secret() {
    let app = TestApp::with_gateway(Arc::new(common::FakeGateway::without_webhooks())).await;

    let response = webhook(&app, &captured("order_x", "pay_x"), Some("anything".into())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["outcome"], "ignored");
}

#[tokio::test]
async fn test_webhook_confirms_order_then_verify_is_idempotent() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let token = app.token_for(user_id, &[]);
    let data = checkout(&app, user_id, &token).await;
    let order_id = data["order"]["id"].as_str().unwrap().to_string();
    let gateway_order_id = data["payment"]["gateway_order_id"].as_str().unwrap().to_string();

    let response = webhook(&app, &captured(&gateway_order_id, "pay_wh"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["outcome"], "confirmed");

    let auth = bearer(&token);
    let response = app
        .request(
            Method::POST,
            "/api/v1/checkout/verify",
            Some(json!({
                "order_id": order_id,
                "gateway_order_id": gateway_order_id,
                "payment_id": "pay_wh",
                "signature": payment_signature(&gateway_order_id, "pay_wh")
            })),
            &[("authorization", &auth)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["outcome"], "already_confirmed");

    // A second capture for a different payment is acknowledged but rejected
    let response = webhook(&app, &captured(&gateway_order_id, "pay_other"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["outcome"], "rejected");
}

#[tokio::test]
async fn test_admin_order_lifecycle() {
    let app = TestApp::new().await;
    let user_id = Uuid::new_v4();
    let token = app.token_for(user_id, &[]);
    let data = checkout(&app, user_id, &token).await;
    let order_id = data["order"]["id"].as_str().unwrap().to_string();
    let gateway_order_id = data["payment"]["gateway_order_id"].as_str().unwrap().to_string();
    let admin = bearer(&app.token_for(Uuid::new_v4(), &["admin"]));
    let status_uri = format!("/api/v1/admin/orders/{}/status", order_id);

    // Admins cannot mark an order paid
    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({"status": "PAID"})),
            &[("authorization", &admin)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "INVALID_STATUS_TRANSITION");

    webhook(&app, &captured(&gateway_order_id, "pay_admin"), None).await;

    let response = app
        .request(
            Method::GET,
            "/api/v1/admin/orders?status=PAID",
            None,
            &[("authorization", &admin)],
        )
        .await;
    assert_eq!(body_json(response).await["data"]["total"], 1);

    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({"status": "PROCESSING"})),
            &[("authorization", &admin)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({"status": "SHIPPED", "tracking_number": "TRK123", "carrier": "BlueDart"})),
            &[("authorization", &admin)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "SHIPPED");
    assert_eq!(body["data"]["tracking_number"], "TRK123");

    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({"status": "DELIVERED", "tracking_number": "TRK999"})),
            &[("authorization", &admin)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({"status": "DELIVERED"})),
            &[("authorization", &admin)],
        )
        .await;
    assert_eq!(body_json(response).await["data"]["status"], "DELIVERED");
}

#[tokio::test]
async fn test_coupon_admin_and_validation_endpoints() {
    let app = TestApp::new().await;
    let admin = bearer(&app.token_for(Uuid::new_v4(), &["ADMIN"]));

    let response = app
        .request(
            Method::POST,
            "/api/v1/admin/coupons",
            Some(json!({
                "code": "welcome15",
                "discount_type": "PERCENTAGE",
                "discount_value": "15",
                "min_order_value": "200",
                "usage_limit": 100
            })),
            &[("authorization", &admin)],
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["data"]["code"], "WELCOME15");

    let response = app
        .request(
            Method::GET,
            "/api/v1/coupons/validate?code=Welcome15&order_total=400",
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(decimal(&body["data"]["discount_amount"]), dec!(60));

    let response = app
        .request(
            Method::GET,
            "/api/v1/coupons/validate?code=WELCOME15&order_total=100",
            None,
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "MINIMUM_ORDER_NOT_MET");

    let response = app
        .request(Method::GET, "/api/v1/admin/coupons", None, &[("authorization", &admin)])
        .await;
    let body = body_json(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["used_count"], 0);
}
