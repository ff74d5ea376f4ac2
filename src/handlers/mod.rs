use axum::routing::post;
use axum::Router;

use crate::AppState;

pub mod payment_webhooks;
pub mod payments;

/// Routes mounted under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new().nest(
        "/payments",
        payments::payments_routes()
            .route("/webhook", post(payment_webhooks::payment_webhook)),
    )
}
