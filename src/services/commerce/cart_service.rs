use crate::{
    auth::CartIdentity,
    concurrency::KeyedLocks,
    entities::{cart, cart_item, product, Cart, CartItem, Product},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::pricing_service;

/// Largest quantity a single cart line may hold.
pub const MAX_LINE_QUANTITY: i32 = 10_000;

/// Input for adding a product to the cart
#[derive(Debug, Clone, Deserialize)]
pub struct AddToCartInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Quantity a line holds after adding `added` units to `current`.
pub fn combined_quantity(current: i32, added: i32) -> Result<i32, ServiceError> {
    current
        .checked_add(added)
        .filter(|total| *total <= MAX_LINE_QUANTITY)
        .ok_or(ServiceError::QuantityLimitExceeded {
            max: MAX_LINE_QUANTITY,
        })
}

/// What `add_line` does when the combined quantity passes the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overflow {
    Reject,
    Clamp,
}

/// A cart line with prices derived from the product at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartLineView {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub bulk_applied: bool,
    pub line_total: Decimal,
}

/// Priced snapshot of a cart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartView {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub lines: Vec<CartLineView>,
    pub subtotal: Decimal,
    pub total_items: i64,
    pub updated_at: DateTime<Utc>,
}

impl CartView {
    pub fn line(&self, product_id: Uuid) -> Option<&CartLineView> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Shopping cart store keyed by user id or anonymous session token.
///
/// Every mutation runs as one read-modify-write transaction and is
/// serialized per cart identity, so concurrent additions to the same cart
/// never lose updates. The cart row is also locked inside the transaction
/// for deployments that run more than one instance.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    locks: KeyedLocks,
}

impl CartService {
    /// Creates a new `CartService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing cart events
    /// * `locks` - Per-identity locks shared with checkout and reconciliation
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>, locks: KeyedLocks) -> Self {
        Self {
            db,
            event_sender,
            locks,
        }
    }

    /// Returns the cart for `identity`, creating an empty one on first use.
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn get_or_create(&self, identity: &CartIdentity) -> Result<CartView, ServiceError> {
        let cart = ensure_cart(&*self.db, identity).await?;
        build_view(&*self.db, &cart).await
    }

    /// Adds `quantity` units of a product.
    ///
    /// Quantities are cumulative: adding to an existing line increases it
    /// rather than replacing it, and the line is re-priced at the new total
    /// quantity, so crossing the bulk threshold switches the whole line to
    /// the bulk price.
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - Updated cart with derived prices
    /// * `Err(ServiceError::InvalidQuantity)` - `quantity` is zero or negative
    /// * `Err(ServiceError::QuantityLimitExceeded)` - The line would exceed [`MAX_LINE_QUANTITY`]
    /// * `Err(ServiceError::ProductNotFound)` - Product missing or inactive
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn add_item(
        &self,
        identity: &CartIdentity,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidQuantity);
        }
        if quantity > MAX_LINE_QUANTITY {
            return Err(ServiceError::QuantityLimitExceeded {
                max: MAX_LINE_QUANTITY,
            });
        }

        let _guard = self.locks.lock(&identity.lock_key()).await;
        let cart = ensure_cart(&*self.db, identity).await?;

        let txn = self.db.begin().await?;
        lock_cart_row(&txn, cart.id).await?;

        let product = Product::find_by_id(product_id)
            .one(&txn)
            .await?
            .filter(|p| p.is_active)
            .ok_or(ServiceError::ProductNotFound(product_id))?;

        add_line(&txn, cart.id, product.id, quantity, Overflow::Reject).await?;
        touch_cart(&txn, cart.id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                product_id,
                quantity,
            })
            .await;

        info!(cart_id = %cart.id, %product_id, quantity, "Added item to cart");
        build_view(&*self.db, &cart).await
    }

    /// Sets a line's quantity. Zero or negative removes the line.
    /// Updating a product that is not in the cart changes nothing.
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn update_item(
        &self,
        identity: &CartIdentity,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity > MAX_LINE_QUANTITY {
            return Err(ServiceError::QuantityLimitExceeded {
                max: MAX_LINE_QUANTITY,
            });
        }

        let _guard = self.locks.lock(&identity.lock_key()).await;
        let cart = ensure_cart(&*self.db, identity).await?;

        let txn = self.db.begin().await?;
        lock_cart_row(&txn, cart.id).await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?;

        match existing {
            None => {
                info!(cart_id = %cart.id, %product_id, "Update for product not in cart ignored");
            }
            Some(item) if quantity <= 0 => {
                CartItem::delete_by_id(item.id).exec(&txn).await?;
                touch_cart(&txn, cart.id).await?;
            }
            Some(item) => {
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(quantity);
                item.updated_at = Set(Utc::now());
                item.update(&txn).await?;
                touch_cart(&txn, cart.id).await?;
            }
        }

        txn.commit().await?;
        build_view(&*self.db, &cart).await
    }

    /// Removes a product's line. Removing a product not in the cart is a no-op.
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub async fn remove_item(
        &self,
        identity: &CartIdentity,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let _guard = self.locks.lock(&identity.lock_key()).await;
        let cart = ensure_cart(&*self.db, identity).await?;

        let txn = self.db.begin().await?;
        lock_cart_row(&txn, cart.id).await?;

        let removed = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&txn)
            .await?
            .rows_affected;
        if removed > 0 {
            touch_cart(&txn, cart.id).await?;
        }

        txn.commit().await?;
        build_view(&*self.db, &cart).await
    }

    /// Folds an anonymous cart into the user's cart and deletes it.
    ///
    /// Every anonymous line is added to the user cart with add semantics
    /// (quantities sum), capped at [`MAX_LINE_QUANTITY`]. Re-running the merge after the anonymous cart is
    /// gone returns the user cart unchanged.
    #[instrument(skip(self, session_token), fields(%user_id))]
    pub async fn merge(
        &self,
        user_id: Uuid,
        session_token: &str,
    ) -> Result<CartView, ServiceError> {
        let user_identity = CartIdentity::User(user_id);
        let session_identity =
            CartIdentity::session(session_token).map_err(|e| ServiceError::BadRequest(e.to_string()))?;

        // Fixed order so two merges touching the same carts cannot deadlock
        let mut keys = [user_identity.lock_key(), session_identity.lock_key()];
        keys.sort();
        let _first = self.locks.lock(&keys[0]).await;
        let _second = self.locks.lock(&keys[1]).await;

        let user_cart = ensure_cart(&*self.db, &user_identity).await?;
        let Some(session_cart) = find_cart(&*self.db, &session_identity).await? else {
            info!("No anonymous cart to merge");
            return build_view(&*self.db, &user_cart).await;
        };

        let txn = self.db.begin().await?;
        lock_cart_row(&txn, user_cart.id).await?;
        lock_cart_row(&txn, session_cart.id).await?;

        let session_lines = lines_with_products(&txn, session_cart.id).await?;
        let mut merged = 0usize;
        for (line, product) in &session_lines {
            if !product.is_active {
                warn!(product_id = %product.id, "Skipping inactive product during cart merge");
                continue;
            }
            add_line(&txn, user_cart.id, line.product_id, line.quantity, Overflow::Clamp).await?;
            merged += 1;
        }

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(session_cart.id))
            .exec(&txn)
            .await?;
        Cart::delete_by_id(session_cart.id).exec(&txn).await?;
        touch_cart(&txn, user_cart.id).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartMerged {
                user_id,
                lines_merged: merged,
            })
            .await;

        info!(lines_merged = merged, "Merged anonymous cart into user cart");
        build_view(&*self.db, &user_cart).await
    }
}

/// Finds the cart stored under `identity`.
pub(crate) async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    identity: &CartIdentity,
) -> Result<Option<cart::Model>, ServiceError> {
    let query = match identity {
        CartIdentity::User(user_id) => Cart::find().filter(cart::Column::UserId.eq(*user_id)),
        CartIdentity::Session(token) => {
            Cart::find().filter(cart::Column::SessionId.eq(token.clone()))
        }
    };
    Ok(query.one(conn).await?)
}

/// Returns the identity's cart, inserting it if missing.
///
/// The unique identity columns make a concurrent double insert fail; the
/// loser re-reads the winner's row.
async fn ensure_cart<C: ConnectionTrait>(
    conn: &C,
    identity: &CartIdentity,
) -> Result<cart::Model, ServiceError> {
    if let Some(cart) = find_cart(conn, identity).await? {
        return Ok(cart);
    }

    let now = Utc::now();
    let (user_id, session_id) = match identity {
        CartIdentity::User(id) => (Some(*id), None),
        CartIdentity::Session(token) => (None, Some(token.clone())),
    };
    let insert = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        session_id: Set(session_id),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await;

    match insert {
        Ok(cart) => Ok(cart),
        Err(err) => find_cart(conn, identity)
            .await?
            .ok_or(ServiceError::DatabaseError(err)),
    }
}

pub(crate) async fn lock_cart_row<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<(), ServiceError> {
    Cart::find_by_id(cart_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
    Ok(())
}

/// Adds to an existing line in place, or inserts a new one.
///
/// Callers hold the cart lock, so the read and the write cannot interleave
/// with another mutation of the same cart.
async fn add_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    product_id: Uuid,
    quantity: i32,
    overflow: Overflow,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let existing = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .filter(cart_item::Column::ProductId.eq(product_id))
        .one(conn)
        .await?;
    let current = existing.as_ref().map_or(0, |item| item.quantity);

    let target = match combined_quantity(current, quantity) {
        Ok(total) => total,
        Err(_) if overflow == Overflow::Clamp => {
            warn!(%product_id, current, quantity, "Cart line capped at quantity limit");
            MAX_LINE_QUANTITY.max(current)
        }
        Err(err) => return Err(err),
    };

    match existing {
        Some(item) if item.quantity == target => {}
        Some(item) => {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(target);
            item.updated_at = Set(now);
            item.update(conn).await?;
        }
        None => {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart_id),
                product_id: Set(product_id),
                quantity: Set(target),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(conn)
            .await?;
        }
    }

    Ok(())
}

async fn touch_cart<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<(), ServiceError> {
    Cart::update_many()
        .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(cart::Column::Id.eq(cart_id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Cart lines joined with their products, oldest line first.
pub(crate) async fn lines_with_products<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<(cart_item::Model, product::Model)>, ServiceError> {
    let rows = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .order_by_asc(cart_item::Column::Id)
        .find_also_related(Product)
        .all(conn)
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(line, product)| match product {
            Some(product) => Some((line, product)),
            None => {
                warn!(line_id = %line.id, "Cart line references a missing product");
                None
            }
        })
        .collect())
}

/// Deletes every line of a cart. Returns how many lines were removed.
pub(crate) async fn clear_lines<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<u64, ServiceError> {
    let removed = CartItem::delete_many()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .exec(conn)
        .await?
        .rows_affected;
    touch_cart(conn, cart_id).await?;
    Ok(removed)
}

async fn build_view<C: ConnectionTrait>(
    conn: &C,
    cart: &cart::Model,
) -> Result<CartView, ServiceError> {
    let rows = lines_with_products(conn, cart.id).await?;
    let updated_at = Cart::find_by_id(cart.id)
        .one(conn)
        .await?
        .map(|c| c.updated_at)
        .unwrap_or(cart.updated_at);

    let lines: Vec<CartLineView> = rows
        .iter()
        .map(|(line, product)| {
            let quote = pricing_service::quote(product, line.quantity);
            CartLineView {
                product_id: product.id,
                name: product.name.clone(),
                quantity: line.quantity,
                unit_price: quote.unit_price,
                bulk_applied: quote.bulk_applied,
                line_total: quote.line_total,
            }
        })
        .collect();

    Ok(CartView {
        id: cart.id,
        user_id: cart.user_id,
        subtotal: lines.iter().map(|l| l.line_total).sum(),
        total_items: lines.iter().map(|l| i64::from(l.quantity)).sum(),
        lines,
        updated_at,
    })
}
