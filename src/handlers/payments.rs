use crate::entities::payment_order;
use crate::errors::ServiceError;
use crate::services::gateway::RedirectUrls;
use crate::services::subscriptions::{SubscriptionCheckout, SubscriptionView};
use crate::ApiResponse;
use crate::AppState;
use axum::{
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Header carrying the opaque session key that ties the subscribe call
/// to the confirm call across the gateway redirect.
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "user_id": "550e8400-e29b-41d4-a716-446655440000",
    "amount": "299",
    "currency": "TWD",
    "confirm_url": "https://app.example.com/pay/confirm",
    "cancel_url": "https://app.example.com/pay/cancel"
}))]
pub struct SubscribeRequest {
    /// User opening the subscription
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub user_id: Uuid,

    /// Charge amount
    #[schema(example = "299")]
    pub amount: Decimal,

    /// Currency code (ISO 4217, defaults to the configured currency)
    #[schema(example = "TWD")]
    pub currency: Option<String>,

    /// Display name of the plan being purchased
    #[schema(example = "Monthly subscription")]
    pub plan: Option<String>,

    /// Where the gateway sends the payer after approving
    #[validate(url)]
    pub confirm_url: String,

    /// Where the gateway sends the payer after cancelling
    #[validate(url)]
    pub cancel_url: String,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({ "transaction_id": "2026083012345678910" }))]
pub struct ConfirmRequest {
    /// Gateway-issued transaction id from the redirect query string
    #[validate(length(min = 1, max = 64))]
    pub transaction_id: String,
}

fn session_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Open a subscription checkout
#[utoipa::path(
    post,
    path = "/api/v1/payments/subscribe",
    request_body = SubscribeRequest,
    params(
        ("X-Session-Id" = String, Header, description = "Opaque session key for the checkout")
    ),
    responses(
        (status = 201, description = "Checkout opened; redirect the payer to payment_url",
            body = crate::ApiResponse<SubscriptionCheckout>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown user", body = crate::errors::ErrorResponse),
        (status = 409, description = "Subscription already active", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SubscriptionCheckout>>), ServiceError> {
    request.validate()?;
    let session_key = session_key(&headers).ok_or_else(|| {
        ServiceError::BadRequest(format!("missing {} header", SESSION_HEADER))
    })?;

    let checkout = state
        .subscriptions
        .request_subscription(
            request.user_id,
            request.amount,
            request.currency,
            request.plan,
            RedirectUrls {
                confirm_url: request.confirm_url,
                cancel_url: request.cancel_url,
            },
            &session_key,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(checkout))))
}

/// Confirm a subscription payment after the gateway redirect
#[utoipa::path(
    post,
    path = "/api/v1/payments/confirm",
    request_body = ConfirmRequest,
    params(
        ("X-Session-Id" = Option<String>, Header, description = "Session key issued at subscribe time")
    ),
    responses(
        (status = 200, description = "Order reconciled; status is SUCCESS or FAILED",
            body = crate::ApiResponse<payment_order::Model>),
        (status = 400, description = "Bad request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown transaction", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway unavailable; retry later", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ApiResponse<payment_order::Model>>, ServiceError> {
    request.validate()?;

    // The parked context is optional: reconciliation works from the
    // durable order row alone when the session expired.
    let pending = match session_key(&headers) {
        Some(key) => state
            .pending_orders
            .take(&key)
            .await
            .map_err(|e| ServiceError::InternalError(e.to_string()))?,
        None => None,
    };

    let order = state
        .subscriptions
        .confirm_subscription(&request.transaction_id, pending)
        .await?;

    Ok(Json(ApiResponse::success(order)))
}

/// Get a user's subscription state
#[utoipa::path(
    get,
    path = "/api/v1/payments/subscription/{user_id}",
    params(
        ("user_id" = Uuid, Path, description = "User to look up")
    ),
    responses(
        (status = 200, description = "Subscription state", body = crate::ApiResponse<SubscriptionView>),
        (status = 404, description = "Unknown user", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<SubscriptionView>>, ServiceError> {
    let view = state.subscriptions.get_subscription(user_id).await?;
    Ok(Json(ApiResponse::success(view)))
}

/// Get a payment order by its caller-issued id
#[utoipa::path(
    get,
    path = "/api/v1/payments/orders/{order_id}",
    params(
        ("order_id" = String, Path, description = "Caller-issued order id")
    ),
    responses(
        (status = 200, description = "Payment order", body = crate::ApiResponse<payment_order::Model>),
        (status = 404, description = "Unknown order", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<payment_order::Model>>, ServiceError> {
    let order = state.subscriptions.get_order(&order_id).await?;
    Ok(Json(ApiResponse::success(order)))
}

pub fn payments_routes() -> Router<AppState> {
    Router::new()
        .route("/subscribe", post(subscribe))
        .route("/confirm", post(confirm))
        .route("/subscription/:user_id", get(get_subscription))
        .route("/orders/:order_id", get(get_order))
}
