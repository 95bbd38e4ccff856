use crate::{
    auth::CartIdentity,
    concurrency::{order_lock_key, KeyedLocks},
    entities::{
        order::{self, OrderStatus},
        payment_details, Order, PaymentDetails, PaymentStatus,
    },
    errors::ServiceError,
    events::{ConfirmationSource, Event, EventSender},
    services::payment_gateway::PaymentGateway,
};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{cart_service, coupon_service};

/// Client report of a completed gateway payment
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct VerifyPaymentInput {
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub gateway_order_id: String,
    #[validate(length(min = 1, max = 128))]
    pub payment_id: String,
    #[validate(length(min = 1, max = 256))]
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// This call moved the order to PAID
    Confirmed,
    /// The order was already PAID with the same payment id
    AlreadyConfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Confirmed,
    AlreadyConfirmed,
    /// No local order carries the gateway order id
    UnknownOrder,
}

/// Result of the shared CREATED -> PAID routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Applied { lines_cleared: u64 },
    /// The conditional update matched no row: someone else moved the order
    Lost,
}

/// Applies a confirmed payment inside `txn`.
///
/// Order status moves only if it is still CREATED, so two confirmations of
/// the same order cannot both pass this point. The payment record, the
/// coupon counter and the cart clear follow in the same transaction; any
/// error leaves the caller to roll everything back.
pub(crate) async fn apply_confirmation<C: ConnectionTrait>(
    txn: &C,
    order: &order::Model,
    payment: &payment_details::Model,
    payment_id: &str,
    signature: Option<&str>,
) -> Result<Transition, ServiceError> {
    let now = Utc::now();

    let moved = Order::update_many()
        .col_expr(order::Column::Status, Expr::value(OrderStatus::Paid))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Status.eq(OrderStatus::Created))
        .exec(txn)
        .await?
        .rows_affected;
    if moved == 0 {
        return Ok(Transition::Lost);
    }

    let mut record: payment_details::ActiveModel = payment.clone().into();
    record.status = Set(PaymentStatus::Completed);
    record.payment_id = Set(Some(payment_id.to_string()));
    if let Some(signature) = signature {
        record.signature = Set(Some(signature.to_string()));
    }
    record.paid_at = Set(Some(now));
    record.updated_at = Set(now);
    record.update(txn).await?;

    if let Some(code) = &order.coupon_code {
        coupon_service::redeem(txn, code).await?;
    }

    let lines_cleared =
        match cart_service::find_cart(txn, &CartIdentity::User(order.user_id)).await? {
            Some(cart) => cart_service::clear_lines(txn, cart.id).await?,
            None => 0,
        };

    Ok(Transition::Applied { lines_cleared })
}

/// Events describing a confirmation that has committed.
pub(crate) fn confirmation_events(
    order: &order::Model,
    payment_id: &str,
    source: ConfirmationSource,
) -> Vec<Event> {
    let mut events = vec![Event::PaymentConfirmed {
        order_id: order.id,
        payment_id: payment_id.to_string(),
        source,
    }];
    if let Some(code) = &order.coupon_code {
        events.push(Event::CouponRedeemed {
            code: code.clone(),
            order_id: order.id,
        });
    }
    events.push(Event::OrderStatusChanged {
        order_id: order.id,
        old_status: OrderStatus::Created.to_string(),
        new_status: OrderStatus::Paid.to_string(),
    });
    events
}

/// Drives orders from CREATED to PAID using client verification or
/// gateway webhooks. Both paths share one idempotent confirmation routine.
#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    locks: KeyedLocks,
}

impl ReconciliationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        locks: KeyedLocks,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            locks,
        }
    }

    /// Confirms a payment reported by the client.
    ///
    /// The signature is checked before anything is read or written. Retrying
    /// with the same payment after success returns `AlreadyConfirmed` and
    /// changes nothing.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Authenticated caller; must own the order
    /// * `input` - Gateway order id, payment id and signature from the widget
    ///
    /// # Returns
    ///
    /// * `Err(ServiceError::SignatureInvalid)` - Signature or gateway order id mismatch
    /// * `Err(ServiceError::OrderOwnershipMismatch)` - Order belongs to someone else
    /// * `Err(ServiceError::Conflict)` - Order already paid by a different payment
    /// * `Err(ServiceError::CouponExhausted)` - Coupon ran out; order marked FAILED
    #[instrument(skip(self, input), fields(order_id = %input.order_id, %user_id))]
    pub async fn verify_payment(
        &self,
        user_id: Uuid,
        input: VerifyPaymentInput,
    ) -> Result<VerifyOutcome, ServiceError> {
        input.validate()?;

        if !self.gateway.verify_signature(
            &input.gateway_order_id,
            &input.payment_id,
            &input.signature,
        ) {
            warn!("Payment signature rejected");
            return Err(ServiceError::SignatureInvalid);
        }

        let _order_guard = self.locks.lock(&order_lock_key(input.order_id)).await;

        let order = Order::find_by_id(input.order_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::OrderNotFound(input.order_id))?;
        if order.user_id != user_id {
            warn!("Verification attempted for another user's order");
            return Err(ServiceError::OrderOwnershipMismatch);
        }

        let _cart_guard = self
            .locks
            .lock(&CartIdentity::User(order.user_id).lock_key())
            .await;

        self.confirm(
            order.id,
            &input.gateway_order_id,
            &input.payment_id,
            Some(&input.signature),
            ConfirmationSource::ClientVerification,
        )
        .await
    }

    /// Confirms a payment announced by an authenticated `payment.captured`
    /// webhook. The caller has already checked the delivery signature.
    #[instrument(skip(self))]
    pub async fn confirm_from_webhook(
        &self,
        gateway_order_id: &str,
        payment_id: &str,
    ) -> Result<WebhookOutcome, ServiceError> {
        let Some(payment) = PaymentDetails::find()
            .filter(payment_details::Column::GatewayOrderId.eq(gateway_order_id))
            .one(&*self.db)
            .await?
        else {
            warn!("Webhook for unknown gateway order");
            return Ok(WebhookOutcome::UnknownOrder);
        };

        let _order_guard = self.locks.lock(&order_lock_key(payment.order_id)).await;
        let order = Order::find_by_id(payment.order_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::OrderNotFound(payment.order_id))?;
        let _cart_guard = self
            .locks
            .lock(&CartIdentity::User(order.user_id).lock_key())
            .await;

        let outcome = self
            .confirm(
                order.id,
                gateway_order_id,
                payment_id,
                None,
                ConfirmationSource::Webhook,
            )
            .await?;

        Ok(match outcome {
            VerifyOutcome::Confirmed => WebhookOutcome::Confirmed,
            VerifyOutcome::AlreadyConfirmed => WebhookOutcome::AlreadyConfirmed,
        })
    }

    /// Runs the confirmation transaction. Caller holds the order and cart locks.
    async fn confirm(
        &self,
        order_id: Uuid,
        gateway_order_id: &str,
        payment_id: &str,
        signature: Option<&str>,
        source: ConfirmationSource,
    ) -> Result<VerifyOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;
        let payment = PaymentDetails::find()
            .filter(payment_details::Column::OrderId.eq(order_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!("Order {} has no payment record", order_id))
            })?;

        if payment.gateway_order_id.as_deref() != Some(gateway_order_id) {
            warn!(%order_id, "Gateway order id does not match the order");
            return Err(ServiceError::SignatureInvalid);
        }

        match order.status {
            OrderStatus::Created => {}
            OrderStatus::Failed | OrderStatus::Cancelled => {
                return Err(ServiceError::InvalidStatusTransition {
                    from: order.status.to_string(),
                    to: OrderStatus::Paid.to_string(),
                });
            }
            _ => return already_paid(&payment, payment_id),
        }

        match apply_confirmation(&txn, &order, &payment, payment_id, signature).await {
            Ok(Transition::Applied { lines_cleared }) => {
                txn.commit().await?;
                info!(%order_id, ?source, lines_cleared, "Payment confirmed, order PAID");
                for event in confirmation_events(&order, payment_id, source) {
                    self.event_sender.send_or_log(event).await;
                }
                Ok(VerifyOutcome::Confirmed)
            }
            Ok(Transition::Lost) => {
                txn.rollback().await?;
                let current = PaymentDetails::find()
                    .filter(payment_details::Column::OrderId.eq(order_id))
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "Order {} has no payment record",
                            order_id
                        ))
                    })?;
                already_paid(&current, payment_id)
            }
            Err(ServiceError::CouponExhausted) => {
                txn.rollback().await?;
                self.fail_exhausted(&order, payment_id).await?;
                Err(ServiceError::CouponExhausted)
            }
            Err(err) => {
                txn.rollback().await?;
                Err(err)
            }
        }
    }

    /// Marks an order FAILED after its coupon ran out at confirmation time.
    /// The captured payment id is kept so the payment can be refunded.
    async fn fail_exhausted(
        &self,
        order: &order::Model,
        payment_id: &str,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Failed))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(OrderStatus::Created))
            .exec(&txn)
            .await?;
        PaymentDetails::update_many()
            .col_expr(
                payment_details::Column::Status,
                Expr::value(PaymentStatus::Failed),
            )
            .col_expr(
                payment_details::Column::PaymentId,
                Expr::value(payment_id.to_string()),
            )
            .col_expr(payment_details::Column::UpdatedAt, Expr::value(now))
            .filter(payment_details::Column::OrderId.eq(order.id))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        error!(
            order_id = %order.id,
            payment_id,
            coupon = order.coupon_code.as_deref().unwrap_or_default(),
            "Coupon exhausted at confirmation; order FAILED, payment needs refund"
        );
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id: order.id,
                reason: "coupon usage limit reached".into(),
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id: order.id,
                old_status: OrderStatus::Created.to_string(),
                new_status: OrderStatus::Failed.to_string(),
            })
            .await;
        Ok(())
    }
}

fn already_paid(
    payment: &payment_details::Model,
    payment_id: &str,
) -> Result<VerifyOutcome, ServiceError> {
    if payment.status == PaymentStatus::Completed
        && payment.payment_id.as_deref() == Some(payment_id)
    {
        info!(order_id = %payment.order_id, "Payment already confirmed");
        Ok(VerifyOutcome::AlreadyConfirmed)
    } else {
        warn!(order_id = %payment.order_id, "Order already settled by a different payment");
        Err(ServiceError::Conflict(format!(
            "Order {} is already settled",
            payment.order_id
        )))
    }
}
