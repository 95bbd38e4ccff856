use crate::{
    auth::CartIdentity,
    concurrency::KeyedLocks,
    entities::{
        address, order,
        order::OrderStatus,
        order_item,
        payment_details::{self, METHOD_COUPON, METHOD_GATEWAY},
        Address, Order, PaymentStatus,
    },
    errors::ServiceError,
    events::{ConfirmationSource, Event, EventSender},
    services::payment_gateway::PaymentGateway,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{
    cart_service, coupon_service,
    order_service::{load_details, OrderDetails},
    pricing_service::{self, round_money, to_minor_units},
    reconciliation_service::{apply_confirmation, confirmation_events, Transition},
};

/// Checkout request body
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckoutInput {
    pub address_id: Uuid,
    #[validate(length(max = 64))]
    pub coupon_code: Option<String>,
}

/// What the client-side payment widget needs to collect payment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentInstructions {
    pub gateway_order_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub key_id: String,
}

/// Created order plus payment instructions. `payment` is absent when a
/// coupon covered the whole order and it was confirmed immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResult {
    pub order: OrderDetails,
    pub payment: Option<PaymentInstructions>,
}

/// Order line priced from the cart at checkout time
#[derive(Debug, Clone, PartialEq)]
struct LineSnapshot {
    product_id: Uuid,
    quantity: i32,
    price: Decimal,
    line_total: Decimal,
}

/// Checkout service for converting carts to orders
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    locks: KeyedLocks,
    currency: String,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        locks: KeyedLocks,
        currency: String,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            locks,
            currency,
        }
    }

    /// Turns the user's cart into an order and opens a gateway payment.
    ///
    /// Prices are captured per line; the coupon is validated against the
    /// subtotal but only redeemed once the order is paid. The cart is left
    /// untouched so an abandoned payment can be retried. Everything happens
    /// in one transaction, including the gateway call: when the gateway fails
    /// no order row survives.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Authenticated buyer
    /// * `input` - Shipping address and optional coupon code
    ///
    /// # Returns
    ///
    /// * `Ok(CheckoutResult)` - Order in CREATED (or PAID when fully discounted)
    /// * `Err(ServiceError::EmptyCart)` - Nothing to buy
    /// * `Err(ServiceError::InvalidAddress)` - Address missing or owned by someone else
    /// * `Err(ServiceError::GatewayUnavailable)` - Payment could not be initialized
    #[instrument(skip(self, input), fields(%user_id, address_id = %input.address_id))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        input: CheckoutInput,
    ) -> Result<CheckoutResult, ServiceError> {
        input.validate()?;
        let identity = CartIdentity::User(user_id);
        let _guard = self.locks.lock(&identity.lock_key()).await;

        let txn = self.db.begin().await?;

        let cart = cart_service::find_cart(&txn, &identity)
            .await?
            .ok_or(ServiceError::EmptyCart)?;
        cart_service::lock_cart_row(&txn, cart.id).await?;
        let lines = cart_service::lines_with_products(&txn, cart.id).await?;
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        Address::find_by_id(input.address_id)
            .filter(address::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .ok_or(ServiceError::InvalidAddress)?;

        let mut snapshots = Vec::with_capacity(lines.len());
        for (line, product) in &lines {
            if !product.is_active {
                warn!(product_id = %product.id, "Cart holds an inactive product");
                return Err(ServiceError::ProductNotFound(product.id));
            }
            let quote = pricing_service::quote(product, line.quantity);
            snapshots.push(LineSnapshot {
                product_id: product.id,
                quantity: line.quantity,
                price: quote.unit_price,
                line_total: quote.line_total,
            });
        }
        let subtotal = round_money(snapshots.iter().map(|s| s.line_total).sum());
        let total_items: i64 = snapshots.iter().map(|s| i64::from(s.quantity)).sum();
        let total_items = i32::try_from(total_items)
            .map_err(|_| ServiceError::ValidationError("Cart holds too many items".into()))?;

        let now = Utc::now();
        let (coupon_code, discount) =
            match input.coupon_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                Some(code) => {
                    let coupon = coupon_service::check_coupon(
                        coupon_service::find_by_code(&txn, code).await?,
                        subtotal,
                        now,
                    )?;
                    let discount = coupon_service::calculate_discount(&coupon, subtotal);
                    (Some(coupon.code), discount)
                }
                None => (None, Decimal::ZERO),
            };
        let total = round_money((subtotal - discount).max(Decimal::ZERO));
        let payable = total > Decimal::ZERO;

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            address_id: Set(input.address_id),
            subtotal: Set(subtotal),
            discount_amount: Set(discount),
            total_amount: Set(total),
            total_items: Set(total_items),
            coupon_code: Set(coupon_code),
            status: Set(OrderStatus::Created),
            tracking_number: Set(None),
            carrier: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for snapshot in &snapshots {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(snapshot.product_id),
                quantity: Set(snapshot.quantity),
                price: Set(snapshot.price),
                line_total: Set(snapshot.line_total),
            }
            .insert(&txn)
            .await?;
        }

        let method = if payable { METHOD_GATEWAY } else { METHOD_COUPON };
        let payment = payment_details::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            payment_method: Set(method.to_string()),
            gateway_order_id: Set(None),
            payment_id: Set(None),
            signature: Set(None),
            status: Set(PaymentStatus::Pending),
            amount: Set(total),
            currency: Set(self.currency.clone()),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        if !payable {
            return self.confirm_fully_discounted(txn, order, payment).await;
        }

        let amount_minor = to_minor_units(total)?;
        let intent = match self
            .gateway
            .create_intent(amount_minor, &self.currency, &order.id.to_string())
            .await
        {
            Ok(intent) => intent,
            Err(err) => {
                error!(order_id = %order.id, error = %err, "Gateway intent creation failed");
                txn.rollback().await?;
                return Err(err.into());
            }
        };

        let mut payment: payment_details::ActiveModel = payment.into();
        payment.gateway_order_id = Set(Some(intent.gateway_order_id.clone()));
        payment.updated_at = Set(Utc::now());
        payment.update(&txn).await?;

        let details = load_details(&txn, order).await?;
        txn.commit().await?;

        info!(
            order_id = %details.order.id,
            total = %total,
            gateway_order_id = %intent.gateway_order_id,
            "Order created, awaiting payment"
        );
        self.publish_created(&details.order).await;

        Ok(CheckoutResult {
            order: details,
            payment: Some(PaymentInstructions {
                gateway_order_id: intent.gateway_order_id,
                amount_minor: intent.amount_minor,
                currency: intent.currency,
                key_id: self.gateway.key_id(),
            }),
        })
    }

    /// Confirms an order the coupon paid for in full, in the checkout
    /// transaction, through the same routine payment verification uses.
    async fn confirm_fully_discounted(
        &self,
        txn: sea_orm::DatabaseTransaction,
        order: order::Model,
        payment: payment_details::Model,
    ) -> Result<CheckoutResult, ServiceError> {
        let reference = format!("coupon_{}", order.id);

        match apply_confirmation(&txn, &order, &payment, &reference, None).await? {
            Transition::Applied { .. } => {}
            Transition::Lost => {
                return Err(ServiceError::InternalError(format!(
                    "Order {} changed before confirmation",
                    order.id
                )));
            }
        }

        let paid = Order::find_by_id(order.id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::OrderNotFound(order.id))?;
        let details = load_details(&txn, paid).await?;
        txn.commit().await?;

        info!(order_id = %order.id, "Order fully covered by coupon, confirmed without gateway");
        self.publish_created(&order).await;
        for event in confirmation_events(&order, &reference, ConfirmationSource::ZeroAmount) {
            self.event_sender.send_or_log(event).await;
        }

        Ok(CheckoutResult {
            order: details,
            payment: None,
        })
    }

    async fn publish_created(&self, order: &order::Model) {
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                user_id: order.user_id,
                total_amount: order.total_amount,
            })
            .await;
    }
}
