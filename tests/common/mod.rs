#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use storefront_api::{
    auth::Claims,
    build_router,
    config::{AppConfig, GatewayConfig},
    db,
    entities::{address, coupon, product, DiscountType},
    events::{self, EventSender},
    handlers::AppServices,
    services::payment_gateway::{
        sign_payload, sign_payment, verify_hex_signature, GatewayError, GatewayIntent,
        PaymentGateway,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration_test_identity_secret_0123456789abcdef";
pub const KEY_SECRET: &str = "gateway_test_secret";
pub const WEBHOOK_SECRET: &str = "webhook_test_secret";

/// Minimal configuration suitable for tests.
pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        jwt_secret: JWT_SECRET.into(),
        host: "127.0.0.1".into(),
        port: 18_080,
        environment: "development".into(),
        log_level: "debug".into(),
        log_json: false,
        auto_migrate: true,
        db_max_connections: 1,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_acquire_timeout_secs: 10,
        cors_allowed_origins: None,
        event_channel_capacity: 256,
        currency: "INR".into(),
        request_timeout_secs: 30,
        gateway: GatewayConfig {
            base_url: "http://127.0.0.1:9".into(),
            key_id: "key_test".into(),
            key_secret: KEY_SECRET.into(),
            webhook_secret: Some(WEBHOOK_SECRET.into()),
            timeout_secs: 2,
        },
    }
}

/// In-process gateway that signs like the real one.
pub struct FakeGateway {
    fail: AtomicBool,
    intents: AtomicUsize,
    webhook_secret: Option<String>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            intents: AtomicUsize::new(0),
            webhook_secret: Some(WEBHOOK_SECRET.into()),
        }
    }

    pub fn without_webhooks() -> Self {
        Self {
            webhook_secret: None,
            ..Self::new()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn intents_created(&self) -> usize {
        self.intents.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayIntent, GatewayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout);
        }
        self.intents.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayIntent {
            gateway_order_id: format!("order_{}", receipt.replace('-', "")),
            amount_minor,
            currency: currency.to_string(),
        })
    }

    fn verify_signature(&self, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_hex_signature(
            KEY_SECRET,
            format!("{}|{}", gateway_order_id, payment_id).as_bytes(),
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
        "key_test".into()
    }
}

/// Helper harness for spinning up an application state backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub fake: Arc<FakeGateway>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let fake = Arc::new(FakeGateway::new());
        Self::build(fake.clone(), fake).await
    }

    /// Same as [`TestApp::new`] but with a caller-supplied gateway.
    pub async fn with_gateway(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self::build(gateway, Arc::new(FakeGateway::new())).await
    }

    async fn build(gateway: Arc<dyn PaymentGateway>, fake: Arc<FakeGateway>) -> Self {
        let cfg = test_config();
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(Arc::new(pool), cfg, EventSender::new(event_tx), gateway);
        let router = build_router(state.clone());

        Self {
            router,
            state,
            fake,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Bearer token as the identity provider would issue it.
    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            exp: now + 3600,
            iat: Some(now),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// Send a request against the router.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn create_product(
        &self,
        selling_price: Decimal,
        bulk_price: Option<Decimal>,
        bulk_min_quantity: i32,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("Product {}", &Uuid::new_v4().to_string()[..8])),
            selling_price: Set(selling_price),
            bulk_price: Set(bulk_price),
            bulk_min_quantity: Set(bulk_min_quantity),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert product")
    }

    pub async fn create_address(&self, user_id: Uuid) -> address::Model {
        address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            full_name: Set("Asha Rao".into()),
            line1: Set("12 MG Road".into()),
            line2: Set(None),
            city: Set("Bengaluru".into()),
            state: Set("KA".into()),
            postal_code: Set("560001".into()),
            country: Set("IN".into()),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert address")
    }

    pub async fn create_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        discount_value: Decimal,
        usage_limit: Option<i32>,
    ) -> coupon::Model {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            discount_type: Set(discount_type),
            discount_value: Set(discount_value),
            expiry_date: Set(None),
            min_order_value: Set(Decimal::ZERO),
            max_discount: Set(None),
            usage_limit: Set(usage_limit),
            used_count: Set(0),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert coupon")
    }
}

/// Signature the gateway hands the client after a successful payment.
pub fn payment_signature(gateway_order_id: &str, payment_id: &str) -> String {
    sign_payment(KEY_SECRET, gateway_order_id, payment_id)
}

/// Signature header value for a webhook body.
pub fn webhook_signature(body: &[u8]) -> String {
    sign_payload(WEBHOOK_SECRET, body)
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("response body is json")
}
