pub mod gateway;
pub mod pending_orders;
pub mod signature;
pub mod subscriptions;
