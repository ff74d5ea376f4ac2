pub mod payment_order;
pub mod user;
