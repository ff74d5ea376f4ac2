use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use sea_orm::{ActiveModelTrait, Set};
use subpay_api::cache::InMemoryCache;
use subpay_api::config::AppConfig;
use subpay_api::db;
use subpay_api::entities::user;
use subpay_api::events::{self, EventSender};
use subpay_api::services::gateway::{
    GatewayError, PaymentConfirmation, PaymentGateway, PaymentRequest, PaymentRequested,
};
use subpay_api::services::pending_orders::PendingOrderStore;
use subpay_api::services::subscriptions::SubscriptionService;
use subpay_api::{app, AppState};

/// Scripted behavior for the next gateway calls.
#[derive(Debug, Clone)]
pub enum GatewayScript {
    Approve,
    Decline { code: String, message: String },
    Unavailable,
}

/// In-process stand-in for the payment gateway. Approves everything by
/// default; tests can script declines and outages per call direction.
pub struct MockGateway {
    next_txn: AtomicU64,
    request_script: Mutex<GatewayScript>,
    confirm_script: Mutex<GatewayScript>,
    pub confirm_calls: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            next_txn: AtomicU64::new(1),
            request_script: Mutex::new(GatewayScript::Approve),
            confirm_script: Mutex::new(GatewayScript::Approve),
            confirm_calls: AtomicU64::new(0),
        }
    }

    pub fn script_request(&self, script: GatewayScript) {
        *self.request_script.lock().unwrap() = script;
    }

    pub fn script_confirm(&self, script: GatewayScript) {
        *self.confirm_script.lock().unwrap() = script;
    }

    pub fn confirm_call_count(&self) -> u64 {
        self.confirm_calls.load(Ordering::SeqCst)
    }

    fn apply(script: &GatewayScript) -> Result<(), GatewayError> {
        match script {
            GatewayScript::Approve => Ok(()),
            GatewayScript::Decline { code, message } => Err(GatewayError::Business {
                code: code.clone(),
                message: message.clone(),
            }),
            GatewayScript::Unavailable => Err(GatewayError::Http { status: 503 }),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn request_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentRequested, GatewayError> {
        Self::apply(&self.request_script.lock().unwrap().clone())?;
        let n = self.next_txn.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentRequested {
            transaction_id: format!("TXN-{:08}", n),
            payment_url: format!(
                "https://sandbox-api-pay.line.me/web/payments/wait?order={}",
                request.order_id
            ),
        })
    }

    async fn confirm_payment(
        &self,
        transaction_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentConfirmation, GatewayError> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        Self::apply(&self.confirm_script.lock().unwrap().clone())?;
        Ok(PaymentConfirmation {
            transaction_id: transaction_id.to_string(),
            details: serde_json::json!({
                "transactionId": transaction_id,
                "payInfo": [{ "method": "CREDIT_CARD", "amount": amount }],
                "currency": currency,
            }),
        })
    }
}

/// Test harness: the full router over an in-memory SQLite database and
/// a scriptable gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config_tweak(|_| {}).await
    }

    /// Builds the app, letting the caller adjust configuration before
    /// services are wired.
    pub async fn with_config_tweak(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
            "1657000000".to_string(),
            "test-channel-secret-0123456789abcdef".to_string(),
            "0123456789abcdef0123456789abcdef".to_string(),
        );
        // One connection keeps the in-memory database alive and shared.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        tweak(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let pool = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(64);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(MockGateway::new());
        let pending_orders = Arc::new(PendingOrderStore::new(
            Arc::new(InMemoryCache::new()),
            &cfg.session_encryption_key,
            Duration::from_secs(cfg.pending_order_ttl_secs),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            pool.clone(),
            gateway.clone(),
            pending_orders.clone(),
            Some(Arc::new(EventSender::new(event_tx))),
            cfg.default_currency.clone(),
        ));

        let state = AppState {
            db: pool,
            config: Arc::new(cfg),
            subscriptions,
            pending_orders,
        };

        Self {
            router: app(state.clone()),
            state,
            gateway,
            _event_task: event_task,
        }
    }

    pub async fn seed_user(&self, email: &str) -> user::Model {
        let now = Utc::now();
        user::ActiveModel {
            id: Set(Uuid::new_v4()),
            email: Set(email.to_string()),
            display_name: Set("Test User".to_string()),
            is_subscribed: Set(false),
            subscription_due_at: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed user")
    }

    /// Sends a request through the router without starting a listener.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("failed to build request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error")
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(
        response.status(),
        expected,
        "unexpected status for response"
    );
}
