use crate::{
    concurrency::{order_lock_key, KeyedLocks},
    entities::{
        order::{self, OrderStatus},
        order_item, payment_details, Order, OrderItem, PaymentDetails, PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Order together with its lines and payment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payment: Option<payment_details::Model>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderListResponse {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Admin status change request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateOrderStatusInput {
    pub status: OrderStatus,
    #[validate(length(min = 1, max = 100))]
    pub tracking_number: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub carrier: Option<String>,
}

/// Transitions an administrator may apply.
///
/// CREATED -> PAID is missing on purpose: only payment confirmation moves an
/// order into PAID.
pub fn admin_transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Created, Failed)
            | (Created, Cancelled)
            | (Paid, Processing)
            | (Paid, Failed)
            | (Paid, Cancelled)
            | (Processing, Shipped)
            | (Shipped, Delivered)
    )
}

/// Loads the lines and payment record of an order.
pub(crate) async fn load_details<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<OrderDetails, ServiceError> {
    let items = OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?;
    let payment = PaymentDetails::find()
        .filter(payment_details::Column::OrderId.eq(order.id))
        .one(conn)
        .await?;

    Ok(OrderDetails {
        order,
        items,
        payment,
    })
}

/// Order history and admin lifecycle operations
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    locks: KeyedLocks,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>, locks: KeyedLocks) -> Self {
        Self {
            db,
            event_sender,
            locks,
        }
    }

    /// Lists a user's orders, newest first
    #[instrument(skip(self))]
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let query = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt);
        self.paginate(query, page, per_page).await
    }

    /// Fetches one of the user's own orders with its lines and payment.
    ///
    /// # Returns
    ///
    /// * `Err(ServiceError::OrderNotFound)` - No such order
    /// * `Err(ServiceError::OrderOwnershipMismatch)` - Order belongs to someone else
    #[instrument(skip(self))]
    pub async fn get_for_user(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;

        if order.user_id != user_id {
            warn!(%order_id, %user_id, "Order requested by a different user");
            return Err(ServiceError::OrderOwnershipMismatch);
        }

        load_details(&*self.db, order).await
    }

    /// Lists all orders, optionally restricted to one status
    #[instrument(skip(self))]
    pub async fn admin_list(
        &self,
        status: Option<OrderStatus>,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let mut query = Order::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(order::Column::Status.eq(status));
        }
        self.paginate(query, page, per_page).await
    }

    async fn paginate(
        &self,
        query: sea_orm::Select<Order>,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);

        let paginator = query.paginate(&*self.db, per_page);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        Ok(OrderListResponse {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Moves an order along the admin lifecycle.
    ///
    /// Shipment details may only accompany the move to SHIPPED. Cancelling or
    /// failing an unpaid order also fails its pending payment.
    #[instrument(skip(self, input), fields(%order_id, new_status = %input.status))]
    pub async fn admin_update_status(
        &self,
        order_id: Uuid,
        input: UpdateOrderStatusInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;
        let new_status = input.status;
        if new_status != OrderStatus::Shipped
            && (input.tracking_number.is_some() || input.carrier.is_some())
        {
            return Err(ServiceError::ValidationError(
                "tracking_number and carrier can only be set when shipping".into(),
            ));
        }

        let _guard = self.locks.lock(&order_lock_key(order_id)).await;
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;
        let old_status = order.status;

        if !admin_transition_allowed(old_status, new_status) {
            warn!(from = %old_status, to = %new_status, "Rejected order status change");
            return Err(ServiceError::InvalidStatusTransition {
                from: old_status.to_string(),
                to: new_status.to_string(),
            });
        }

        let now = Utc::now();
        let mut update = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(old_status));
        if let Some(tracking) = input.tracking_number.clone() {
            update = update.col_expr(order::Column::TrackingNumber, Expr::value(tracking));
        }
        if let Some(carrier) = input.carrier.clone() {
            update = update.col_expr(order::Column::Carrier, Expr::value(carrier));
        }

        if update.exec(&txn).await?.rows_affected == 0 {
            // A payment confirmation in another process won the row
            return Err(ServiceError::Conflict(format!(
                "Order {} changed concurrently",
                order_id
            )));
        }

        let payment_failed = old_status == OrderStatus::Created;
        if payment_failed {
            if let Some(payment) = PaymentDetails::find()
                .filter(payment_details::Column::OrderId.eq(order_id))
                .one(&txn)
                .await?
            {
                let mut payment: payment_details::ActiveModel = payment.into();
                payment.status = Set(PaymentStatus::Failed);
                payment.updated_at = Set(now);
                payment.update(&txn).await?;
            }
        }

        let updated = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::OrderNotFound(order_id))?;
        let details = load_details(&txn, updated).await?;
        txn.commit().await?;

        info!(old_status = %old_status, new_status = %new_status, "Order status updated");

        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;
        if payment_failed {
            self.event_sender
                .send_or_log(Event::PaymentFailed {
                    order_id,
                    reason: format!("order {} by admin", new_status.as_str().to_lowercase()),
                })
                .await;
        }

        Ok(details)
    }
}
