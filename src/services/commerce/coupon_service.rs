use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::pricing_service::round_money;
use crate::entities::coupon::{self, DiscountType, Entity as Coupon};
use crate::errors::ServiceError;

/// Coupon codes are matched case-insensitively by storing them upper-cased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Discount a coupon would give on `order_total`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponPreview {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub discount_amount: Decimal,
    pub min_order_value: Decimal,
    pub max_discount: Option<Decimal>,
}

/// Input for creating a coupon
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateCouponInput {
    #[validate(length(min = 3, max = 64))]
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_order_value: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Runs the ordered coupon checks. The first failing check wins.
///
/// Read-only: nothing is reserved or counted here.
pub fn check_coupon(
    coupon: Option<coupon::Model>,
    order_total: Decimal,
    now: DateTime<Utc>,
) -> Result<coupon::Model, ServiceError> {
    let coupon = match coupon {
        Some(c) if c.is_active => c,
        _ => return Err(ServiceError::InvalidCoupon),
    };

    if coupon.expiry_date.map(|expiry| expiry <= now).unwrap_or(false) {
        return Err(ServiceError::CouponExpired);
    }

    if coupon.is_exhausted() {
        return Err(ServiceError::CouponExhausted);
    }

    if order_total < coupon.min_order_value {
        return Err(ServiceError::MinimumOrderNotMet {
            minimum: round_money(coupon.min_order_value),
        });
    }

    Ok(coupon)
}

/// Discount for `order_total`, never more than the total itself.
pub fn calculate_discount(coupon: &coupon::Model, order_total: Decimal) -> Decimal {
    if order_total <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let discount = match coupon.discount_type {
        DiscountType::Percentage => {
            let raw = order_total * coupon.discount_value / Decimal::ONE_HUNDRED;
            match coupon.max_discount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
        DiscountType::Fixed => coupon.discount_value,
    };

    round_money(discount.max(Decimal::ZERO).min(order_total))
}

/// Looks a coupon up by code on any connection or transaction.
pub async fn find_by_code<C: ConnectionTrait>(
    conn: &C,
    code: &str,
) -> Result<Option<coupon::Model>, ServiceError> {
    Ok(Coupon::find()
        .filter(coupon::Column::Code.eq(normalize_code(code)))
        .one(conn)
        .await?)
}

/// Consumes one use of the coupon.
///
/// Single guarded UPDATE: the counter only moves while it is below the limit,
/// so concurrent redemptions of the last use cannot both succeed.
pub async fn redeem<C: ConnectionTrait>(conn: &C, code: &str) -> Result<(), ServiceError> {
    let code = normalize_code(code);
    let result = Coupon::update_many()
        .col_expr(
            coupon::Column::UsedCount,
            Expr::col(coupon::Column::UsedCount).add(1),
        )
        .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(coupon::Column::Code.eq(code.clone()))
        .filter(
            Condition::any()
                .add(coupon::Column::UsageLimit.is_null())
                .add(
                    Expr::col(coupon::Column::UsedCount)
                        .lt(Expr::col(coupon::Column::UsageLimit)),
                ),
        )
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return match find_by_code(conn, &code).await? {
            Some(_) => {
                warn!(code = %code, "Coupon redemption rejected: usage limit reached");
                Err(ServiceError::CouponExhausted)
            }
            None => Err(ServiceError::InvalidCoupon),
        };
    }

    Ok(())
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Validates `code` against `order_total`. Never mutates the coupon.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        order_total: Decimal,
    ) -> Result<coupon::Model, ServiceError> {
        let coupon = find_by_code(&*self.db, code).await?;
        check_coupon(coupon, order_total, Utc::now())
    }

    /// Validation plus the discount the coupon would give.
    #[instrument(skip(self))]
    pub async fn preview(
        &self,
        code: &str,
        order_total: Decimal,
    ) -> Result<CouponPreview, ServiceError> {
        if order_total < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "order_total cannot be negative".into(),
            ));
        }
        let coupon = self.validate(code, order_total).await?;
        let discount_amount = calculate_discount(&coupon, order_total);

        Ok(CouponPreview {
            code: coupon.code,
            discount_type: coupon.discount_type,
            discount_value: coupon.discount_value,
            discount_amount,
            min_order_value: coupon.min_order_value,
            max_discount: coupon.max_discount,
        })
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create(&self, input: CreateCouponInput) -> Result<coupon::Model, ServiceError> {
        input.validate()?;

        if input.discount_value <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "discount_value must be positive".into(),
            ));
        }
        if input.discount_type == DiscountType::Percentage
            && input.discount_value > Decimal::ONE_HUNDRED
        {
            return Err(ServiceError::ValidationError(
                "percentage discount cannot exceed 100".into(),
            ));
        }
        let min_order_value = input.min_order_value.unwrap_or(Decimal::ZERO);
        if min_order_value < Decimal::ZERO
            || input.max_discount.map(|m| m <= Decimal::ZERO).unwrap_or(false)
        {
            return Err(ServiceError::ValidationError(
                "min_order_value cannot be negative and max_discount must be positive".into(),
            ));
        }

        let code = normalize_code(&input.code);
        if find_by_code(&*self.db, &code).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Coupon {} already exists",
                code
            )));
        }

        let now = Utc::now();
        let coupon = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            discount_type: Set(input.discount_type),
            discount_value: Set(input.discount_value),
            expiry_date: Set(input.expiry_date),
            min_order_value: Set(min_order_value),
            max_discount: Set(input.max_discount),
            usage_limit: Set(input.usage_limit),
            used_count: Set(0),
            is_active: Set(input.is_active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(code = %code, "Coupon created");
        Ok(coupon)
    }

    pub async fn list(&self) -> Result<Vec<coupon::Model>, ServiceError> {
        Ok(Coupon::find()
            .order_by_asc(coupon::Column::Code)
            .all(&*self.db)
            .await?)
    }
}
