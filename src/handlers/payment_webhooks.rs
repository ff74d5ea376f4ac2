use axum::{extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::ServiceError;
use crate::AppState;

/// Gateway-initiated reconciliation. The gateway retries delivery on
/// non-2xx, so infrastructure failures are surfaced as 502 and terminal
/// outcomes as 200.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Source address not allowed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown transaction", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    // Verify source address if an allow-list is configured
    let allowed = state.config.webhook_allowed_ips();
    if !allowed.is_empty() {
        let source = source_ip(&headers);
        let ok = source
            .as_deref()
            .map(|ip| allowed.iter().any(|a| a == ip))
            .unwrap_or(false);
        if !ok {
            warn!(source = ?source, "payment webhook from disallowed source");
            return Err(ServiceError::Unauthorized(
                "webhook source not allowed".to_string(),
            ));
        }
    }

    let json: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    let transaction_id = transaction_id(&json).ok_or_else(|| {
        ServiceError::BadRequest("payload missing transactionId".to_string())
    })?;

    info!(%transaction_id, "payment webhook received");

    // No parked session context on this path: reconcile from the durable
    // order row alone. Already-reconciled orders come back unchanged.
    let order = state
        .subscriptions
        .confirm_subscription(&transaction_id, None)
        .await?;

    info!(order_id = %order.order_id, status = ?order.status, "webhook reconciled");
    Ok((StatusCode::OK, "ok"))
}

fn source_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// The gateway serializes transaction ids as either a JSON number or a
/// string depending on the notification type.
fn transaction_id(payload: &Value) -> Option<String> {
    match payload.get("transactionId") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
