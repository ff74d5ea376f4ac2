use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::entities::payment_order::{Model as PaymentOrder, OrderStatus, SubscriptionStatus};
use crate::errors::ErrorResponse;
use crate::handlers::payments::{ConfirmRequest, SubscribeRequest};
use crate::services::subscriptions::{SubscriptionCheckout, SubscriptionView};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Subscription Payments API",
        version = "1.0.0",
        description = r#"
# Subscription Payments API

Recurring-payment core built on the LINE Pay v3 gateway.

## Flow

1. `POST /api/v1/payments/subscribe` opens a checkout and returns the
   gateway redirect URL. Send an `X-Session-Id` header; the order
   context is parked under it while the payer is at the gateway.
2. The payer approves (or cancels) at the gateway and is redirected
   back with a `transactionId`.
3. `POST /api/v1/payments/confirm` reconciles the outcome. The call is
   idempotent: repeating it returns the already-reconciled order.

The gateway may also push the outcome to `POST /api/v1/payments/webhook`.

## Error Handling

Errors use a consistent body with appropriate HTTP status codes:

```json
{
  "error": "Conflict",
  "message": "Conflict: subscription already active until 2026-09-30T10:00:00Z",
  "timestamp": "2026-08-30T10:00:00Z"
}
```

A gateway decline is not an error: confirm returns 200 with the order
in `FAILED` status. 502 means the gateway was unreachable and the order
is still `PENDING`; retry the call.
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Payments", description = "Subscription checkout and reconciliation"),
        (name = "Health", description = "Liveness and readiness probes")
    ),
    paths(
        crate::handlers::payments::subscribe,
        crate::handlers::payments::confirm,
        crate::handlers::payments::get_subscription,
        crate::handlers::payments::get_order,
        crate::handlers::payment_webhooks::payment_webhook,
    ),
    components(schemas(
        SubscribeRequest,
        ConfirmRequest,
        SubscriptionCheckout,
        SubscriptionView,
        PaymentOrder,
        OrderStatus,
        SubscriptionStatus,
        ErrorResponse,
    ))
)]
pub struct ApiDoc;

/// Swagger UI at /docs backed by /api-docs/openapi.json.
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_covers_payment_paths() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.contains(&&"/api/v1/payments/subscribe".to_string()));
        assert!(paths.contains(&&"/api/v1/payments/confirm".to_string()));
        assert!(paths.contains(&&"/api/v1/payments/webhook".to_string()));
        assert!(paths.contains(&&"/api/v1/payments/subscription/{user_id}".to_string()));
    }
}
