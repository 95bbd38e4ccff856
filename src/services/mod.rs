// Commerce: carts, coupons, checkout, orders and reconciliation
pub mod commerce;

// External payment provider
pub mod payment_gateway;
