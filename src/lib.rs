//! Subscription Payments API Library
//!
//! Recurring-payment core: opens checkouts against the LINE Pay v3
//! gateway and reconciles their outcomes into payment orders.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod services;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::ToSchema;

use services::pending_orders::PendingOrderStore;
use services::subscriptions::SubscriptionService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub subscriptions: Arc<SubscriptionService>,
    pub pending_orders: Arc<PendingOrderStore>,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Service identity and build info.
async fn status_handler() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Readiness probe: verifies the database answers.
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let db_healthy = state.db.ping().await.is_ok();
    Json(json!({
        "status": if db_healthy { "healthy" } else { "degraded" },
        "database": if db_healthy { "up" } else { "down" },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Builds the application router: probes, the v1 API and Swagger UI.
/// Cross-cutting layers (CORS, timeouts) are applied by the binary.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1", handlers::api_v1_routes())
        .merge(openapi::swagger_ui())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
