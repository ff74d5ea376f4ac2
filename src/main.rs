use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

use subpay_api::cache::InMemoryCache;
use subpay_api::config;
use subpay_api::db;
use subpay_api::events::{self, EventSender};
use subpay_api::services::gateway::{LinePayClient, LinePayConfig};
use subpay_api::services::pending_orders::PendingOrderStore;
use subpay_api::services::subscriptions::SubscriptionService;
use subpay_api::{app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config().context("failed to load configuration")?;
    config::init_tracing(config.log_level(), config.log_json);

    info!(
        environment = %config.environment,
        "starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let db = Arc::new(
        db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?,
    );

    if config.auto_migrate {
        info!("running database migrations");
        db::run_migrations(&db)
            .await
            .context("failed to run migrations")?;
    }

    // Event channel: handlers publish, a background task drains and logs.
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = Arc::new(EventSender::new(event_tx));
    tokio::spawn(events::process_events(event_rx));

    let gateway = Arc::new(
        LinePayClient::new(LinePayConfig::from_app_config(&config))
            .map_err(|e| anyhow::anyhow!("failed to build gateway client: {}", e))?,
    );

    let pending_orders = Arc::new(PendingOrderStore::new(
        Arc::new(InMemoryCache::new()),
        &config.session_encryption_key,
        Duration::from_secs(config.pending_order_ttl_secs),
    ));

    let subscriptions = Arc::new(SubscriptionService::new(
        db.clone(),
        gateway,
        pending_orders.clone(),
        Some(event_sender),
        config.default_currency.clone(),
    ));

    let config = Arc::new(config);
    let state = AppState {
        db,
        config: config.clone(),
        subscriptions,
        pending_orders,
    };

    let cors = build_cors_layer(config.cors_allowed_origins.as_deref());

    let router = app(state)
        .layer(cors)
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

fn build_cors_layer(allowed_origins: Option<&str>) -> CorsLayer {
    let methods = [Method::GET, Method::POST];
    match allowed_origins {
        Some(raw) if !raw.trim().is_empty() => {
            let origins: Vec<HeaderValue> = raw
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(v) => Some(v),
                    Err(_) => {
                        warn!("ignoring invalid CORS origin: {}", o);
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(methods)
                .allow_headers(Any)
        }
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C; shutting down"),
        _ = terminate => info!("received SIGTERM; shutting down"),
    }
}
