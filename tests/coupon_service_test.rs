mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use storefront_api::{
    entities::{coupon, Coupon, DiscountType},
    errors::ServiceError,
    services::commerce::{coupon_service, CreateCouponInput},
};

fn create_input(code: &str) -> CreateCouponInput {
    CreateCouponInput {
        code: code.to_string(),
        discount_type: DiscountType::Percentage,
        discount_value: dec!(20),
        expiry_date: None,
        min_order_value: Some(dec!(500)),
        max_discount: Some(dec!(150)),
        usage_limit: Some(10),
        is_active: true,
    }
}

#[tokio::test]
async fn test_create_normalizes_code_and_rejects_duplicates() {
    let app = TestApp::new().await;
    let coupons = &app.services().coupon;

    let created = coupons.create(create_input("  festive20 ")).await.unwrap();
    assert_eq!(created.code, "FESTIVE20");
    assert_eq!(created.used_count, 0);

    assert_matches!(
        coupons.create(create_input("Festive20")).await,
        Err(ServiceError::Conflict(_))
    );
    assert_eq!(coupons.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_rejects_nonsensical_values() {
    let app = TestApp::new().await;
    let coupons = &app.services().coupon;

    let mut over = create_input("OVER100");
    over.discount_value = dec!(120);
    assert_matches!(coupons.create(over).await, Err(ServiceError::ValidationError(_)));

    let mut zero = create_input("ZERO");
    zero.discount_value = dec!(0);
    assert_matches!(coupons.create(zero).await, Err(ServiceError::ValidationError(_)));

    let mut limit = create_input("NOLIMIT");
    limit.usage_limit = Some(0);
    assert_matches!(coupons.create(limit).await, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn test_preview_applies_cap_and_minimum() {
    let app = TestApp::new().await;
    let coupons = &app.services().coupon;
    coupons.create(create_input("FESTIVE20")).await.unwrap();

    let preview = coupons.preview("festive20", dec!(600)).await.unwrap();
    assert_eq!(preview.discount_amount, dec!(120));

    let capped = coupons.preview("FESTIVE20", dec!(2000)).await.unwrap();
    assert_eq!(capped.discount_amount, dec!(150));

    assert_matches!(
        coupons.preview("FESTIVE20", dec!(499.99)).await,
        Err(ServiceError::MinimumOrderNotMet { minimum }) if minimum == dec!(500)
    );
    assert_matches!(
        coupons.preview("UNKNOWN", dec!(600)).await,
        Err(ServiceError::InvalidCoupon)
    );
    assert_matches!(
        coupons.preview("FESTIVE20", dec!(-1)).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn test_validation_checks_expiry_activity_and_usage_without_mutating() {
    let app = TestApp::new().await;
    let coupons = &app.services().coupon;

    let expired = app
        .create_coupon("OLD", DiscountType::Fixed, dec!(50), None)
        .await;
    let mut active: coupon::ActiveModel = expired.into();
    active.expiry_date = Set(Some(Utc::now() - Duration::days(1)));
    active.update(app.db()).await.unwrap();
    assert_matches!(
        coupons.validate("OLD", dec!(100)).await,
        Err(ServiceError::CouponExpired)
    );

    let paused = app
        .create_coupon("PAUSED", DiscountType::Fixed, dec!(50), None)
        .await;
    let mut active: coupon::ActiveModel = paused.into();
    active.is_active = Set(false);
    active.update(app.db()).await.unwrap();
    assert_matches!(
        coupons.validate("PAUSED", dec!(100)).await,
        Err(ServiceError::InvalidCoupon)
    );

    let used_up = app
        .create_coupon("USEDUP", DiscountType::Fixed, dec!(50), Some(2))
        .await;
    let mut active: coupon::ActiveModel = used_up.clone().into();
    active.used_count = Set(2);
    active.update(app.db()).await.unwrap();
    assert_matches!(
        coupons.validate("usedup", dec!(100)).await,
        Err(ServiceError::CouponExhausted)
    );

    let fresh = app
        .create_coupon("FRESH", DiscountType::Fixed, dec!(50), Some(1))
        .await;
    for _ in 0..3 {
        coupons.validate("FRESH", dec!(100)).await.unwrap();
    }
    let stored = Coupon::find_by_id(fresh.id).one(app.db()).await.unwrap().unwrap();
    assert_eq!(stored.used_count, 0);
}

#[tokio::test]
async fn test_redeem_stops_at_usage_limit() {
    let app = TestApp::new().await;
    let limited = app
        .create_coupon("TWICE", DiscountType::Fixed, dec!(10), Some(2))
        .await;

    coupon_service::redeem(app.db(), "twice").await.unwrap();
    coupon_service::redeem(app.db(), "TWICE").await.unwrap();
    assert_matches!(
        coupon_service::redeem(app.db(), "TWICE").await,
        Err(ServiceError::CouponExhausted)
    );
    assert_matches!(
        coupon_service::redeem(app.db(), "MISSING").await,
        Err(ServiceError::InvalidCoupon)
    );

    let stored = Coupon::find_by_id(limited.id).one(app.db()).await.unwrap().unwrap();
    assert_eq!(stored.used_count, 2);

    let unlimited = app
        .create_coupon("FOREVER", DiscountType::Fixed, dec!(10), None)
        .await;
    for _ in 0..5 {
        coupon_service::redeem(app.db(), "FOREVER").await.unwrap();
    }
    let stored = Coupon::find_by_id(unlimited.id).one(app.db()).await.unwrap().unwrap();
    assert_eq!(stored.used_count, 5);
}
