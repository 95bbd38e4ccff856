pub mod admin;
pub mod carts;
pub mod checkout;
pub mod common;
pub mod coupons;
pub mod orders;
pub mod payment_webhooks;

use crate::concurrency::KeyedLocks;
use crate::events::EventSender;
use crate::services::commerce::{
    CartService, CheckoutService, CouponService, OrderService, ReconciliationService,
};
use crate::services::payment_gateway::PaymentGateway;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub coupon: Arc<CouponService>,
    pub checkout: Arc<CheckoutService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub order: Arc<OrderService>,
}

impl AppServices {
    /// Builds every service around one shared lock table, so cart
    /// mutations, checkout and payment confirmation serialize on the same keys.
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        currency: String,
    ) -> Self {
        let locks = KeyedLocks::new();

        let cart = Arc::new(CartService::new(
            db.clone(),
            event_sender.clone(),
            locks.clone(),
        ));
        let coupon = Arc::new(CouponService::new(db.clone()));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            event_sender.clone(),
            gateway.clone(),
            locks.clone(),
            currency,
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            event_sender.clone(),
            gateway,
            locks.clone(),
        ));
        let order = Arc::new(OrderService::new(db, event_sender, locks));

        Self {
            cart,
            coupon,
            checkout,
            reconciliation,
            order,
        }
    }
}
