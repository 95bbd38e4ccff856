/// Commerce services: pricing, coupons, carts, checkout and payment reconciliation
pub mod cart_service;
pub mod checkout_service;
pub mod coupon_service;
pub mod order_service;
pub mod pricing_service;
pub mod reconciliation_service;

// Re-export services for convenience
pub use cart_service::{AddToCartInput, CartLineView, CartService, CartView, MAX_LINE_QUANTITY};
pub use checkout_service::{CheckoutInput, CheckoutResult, CheckoutService, PaymentInstructions};
pub use coupon_service::{CouponPreview, CouponService, CreateCouponInput};
pub use order_service::{OrderDetails, OrderListResponse, OrderService, UpdateOrderStatusInput};
pub use reconciliation_service::{
    ReconciliationService, VerifyOutcome, VerifyPaymentInput, WebhookOutcome,
};
