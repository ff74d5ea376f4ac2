//! End-to-end tests for the subscription payment flow:
//! checkout, confirmation, idempotency, renewal and failure handling.

mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{assert_status, response_json, GatewayScript, TestApp};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
use serde_json::{json, Value};
use subpay_api::entities::payment_order;

fn subscribe_payload(user_id: &str) -> Value {
    json!({
        "user_id": user_id,
        "amount": "299",
        "confirm_url": "https://app.example.com/pay/confirm",
        "cancel_url": "https://app.example.com/pay/cancel"
    })
}

/// Runs subscribe and confirm for the user, returning the confirmed order.
async fn subscribe_and_confirm(app: &TestApp, user_id: &str, session: &str) -> Value {
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[("x-session-id", session)],
            Some(subscribe_payload(user_id)),
        )
        .await;
    assert_status(&response, StatusCode::CREATED);
    let body = response_json(response).await;
    let transaction_id = body["data"]["transaction_id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm",
            &[("x-session-id", session)],
            Some(json!({ "transaction_id": transaction_id })),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    response_json(response).await
}

#[tokio::test]
async fn subscribe_opens_pending_order_with_payment_url() {
    let app = TestApp::new().await;
    let user = app.seed_user("alice@example.com").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[("x-session-id", "sess-1")],
            Some(subscribe_payload(&user.id.to_string())),
        )
        .await;
    assert_status(&response, StatusCode::CREATED);

    let body = response_json(response).await;
    assert!(body["success"].as_bool().unwrap());
    let data = &body["data"];
    assert!(data["order_id"].as_str().unwrap().starts_with("SUB-"));
    assert!(data["payment_url"]
        .as_str()
        .unwrap()
        .starts_with("https://"));

    let order = payment_order::Entity::find()
        .filter(payment_order::Column::OrderId.eq(data["order_id"].as_str().unwrap()))
        .one(&*app.state.db)
        .await
        .unwrap()
        .expect("order row should exist");
    assert_eq!(order.status, payment_order::OrderStatus::Pending);
    assert!(!order.is_current);
    assert_eq!(order.user_id, Some(user.id));
    assert_eq!(order.currency, "TWD");
}

#[tokio::test]
async fn subscribe_without_session_header_is_rejected() {
    let app = TestApp::new().await;
    let user = app.seed_user("bob@example.com").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[],
            Some(subscribe_payload(&user.id.to_string())),
        )
        .await;
    assert_status(&response, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn subscribe_for_unknown_user_is_not_found() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[("x-session-id", "sess-1")],
            Some(subscribe_payload(
                "00000000-0000-0000-0000-000000000000",
            )),
        )
        .await;
    assert_status(&response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn confirm_activates_subscription() {
    let app = TestApp::new().await;
    let user = app.seed_user("carol@example.com").await;

    let body = subscribe_and_confirm(&app, &user.id.to_string(), "sess-1").await;
    let order = &body["data"];
    assert_eq!(order["status"], "SUCCESS");
    assert_eq!(order["subscription_status"], "ACTIVE");
    assert_eq!(order["is_current"], true);
    assert!(order["paid_at"].as_str().is_some());
    assert!(order["due_at"].as_str().is_some());

    // Due date is one month out.
    let paid_at: chrono::DateTime<Utc> =
        order["paid_at"].as_str().unwrap().parse().unwrap();
    let due_at: chrono::DateTime<Utc> = order["due_at"].as_str().unwrap().parse().unwrap();
    let days = (due_at - paid_at).num_days();
    assert!((28..=31).contains(&days), "unexpected period: {} days", days);

    // The user row mirrors the subscription.
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/subscription/{}", user.id),
            &[],
            None,
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let view = response_json(response).await;
    assert_eq!(view["data"]["active"], true);
    assert!(view["data"]["due_at"].as_str().is_some());
}

#[tokio::test]
async fn confirm_is_idempotent() {
    let app = TestApp::new().await;
    let user = app.seed_user("dave@example.com").await;

    let first = subscribe_and_confirm(&app, &user.id.to_string(), "sess-1").await;
    let transaction_id = first["data"]["transaction_id"].as_str().unwrap();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm",
            &[],
            Some(json!({ "transaction_id": transaction_id })),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let second = response_json(response).await;

    assert_eq!(second["data"]["status"], "SUCCESS");
    assert_eq!(second["data"]["paid_at"], first["data"]["paid_at"]);
    // The gateway was only charged once.
    assert_eq!(app.gateway.confirm_call_count(), 1);
}

#[tokio::test]
async fn duplicate_subscription_conflicts_without_new_order() {
    let app = TestApp::new().await;
    let user = app.seed_user("erin@example.com").await;

    subscribe_and_confirm(&app, &user.id.to_string(), "sess-1").await;
    let orders_before = payment_order::Entity::find()
        .count(&*app.state.db)
        .await
        .unwrap();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[("x-session-id", "sess-2")],
            Some(subscribe_payload(&user.id.to_string())),
        )
        .await;
    assert_status(&response, StatusCode::CONFLICT);

    let orders_after = payment_order::Entity::find()
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(orders_before, orders_after);
}

#[tokio::test]
async fn renewal_demotes_previous_order() {
    let app = TestApp::new().await;
    let user = app.seed_user("frank@example.com").await;

    let first = subscribe_and_confirm(&app, &user.id.to_string(), "sess-1").await;
    let first_id: uuid::Uuid = first["data"]["id"].as_str().unwrap().parse().unwrap();

    // Lapse the subscription so a renewal is allowed.
    let lapsed = payment_order::ActiveModel {
        id: Set(first_id),
        due_at: Set(Some(Utc::now() - Duration::days(1))),
        ..Default::default()
    };
    payment_order::Entity::update(lapsed)
        .exec(&*app.state.db)
        .await
        .unwrap();

    let second = subscribe_and_confirm(&app, &user.id.to_string(), "sess-2").await;
    assert_eq!(second["data"]["status"], "SUCCESS");
    assert_eq!(second["data"]["is_current"], true);

    // Exactly one current order; the old one is expired.
    let current = payment_order::Entity::find()
        .filter(payment_order::Column::IsCurrent.eq(true))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert_ne!(current[0].id, first_id);

    let old = payment_order::Entity::find_by_id(first_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert!(!old.is_current);
    assert_eq!(
        old.subscription_status,
        Some(payment_order::SubscriptionStatus::Expired)
    );
}

#[tokio::test]
async fn declined_confirm_marks_order_failed() {
    let app = TestApp::new().await;
    let user = app.seed_user("grace@example.com").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[("x-session-id", "sess-1")],
            Some(subscribe_payload(&user.id.to_string())),
        )
        .await;
    let body = response_json(response).await;
    let transaction_id = body["data"]["transaction_id"].as_str().unwrap().to_string();

    app.gateway.script_confirm(GatewayScript::Decline {
        code: "1198".into(),
        message: "payment declined".into(),
    });

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm",
            &[("x-session-id", "sess-1")],
            Some(json!({ "transaction_id": transaction_id })),
        )
        .await;
    // A decline is a terminal outcome, not a transport error.
    assert_status(&response, StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "FAILED");
    assert_eq!(body["data"]["subscription_status"], "CANCELLED");
    assert_eq!(body["data"]["is_current"], false);

    // The user never became subscribed.
    let view = response_json(
        app.request(
            Method::GET,
            &format!("/api/v1/payments/subscription/{}", user.id),
            &[],
            None,
        )
        .await,
    )
    .await;
    assert_eq!(view["data"]["active"], false);
}

#[tokio::test]
async fn gateway_outage_leaves_order_pending_and_retryable() {
    let app = TestApp::new().await;
    let user = app.seed_user("heidi@example.com").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[("x-session-id", "sess-1")],
            Some(subscribe_payload(&user.id.to_string())),
        )
        .await;
    let body = response_json(response).await;
    let transaction_id = body["data"]["transaction_id"].as_str().unwrap().to_string();

    app.gateway.script_confirm(GatewayScript::Unavailable);
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm",
            &[("x-session-id", "sess-1")],
            Some(json!({ "transaction_id": transaction_id.clone() })),
        )
        .await;
    assert_status(&response, StatusCode::BAD_GATEWAY);

    let order = payment_order::Entity::find()
        .filter(payment_order::Column::TransactionId.eq(transaction_id.clone()))
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, payment_order::OrderStatus::Pending);

    // Once the gateway recovers the same confirm succeeds.
    app.gateway.script_confirm(GatewayScript::Approve);
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm",
            &[],
            Some(json!({ "transaction_id": transaction_id })),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "SUCCESS");
}

#[tokio::test]
async fn confirm_unknown_transaction_is_not_found() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/confirm",
            &[],
            Some(json!({ "transaction_id": "TXN-DOES-NOT-EXIST" })),
        )
        .await;
    assert_status(&response, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn subscribe_fails_when_gateway_rejects_request() {
    let app = TestApp::new().await;
    let user = app.seed_user("ivan@example.com").await;

    app.gateway.script_request(GatewayScript::Decline {
        code: "1104".into(),
        message: "merchant not found".into(),
    });

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/subscribe",
            &[("x-session-id", "sess-1")],
            Some(subscribe_payload(&user.id.to_string())),
        )
        .await;
    assert_status(&response, StatusCode::PAYMENT_REQUIRED);

    // No order row is left behind for a checkout the gateway refused.
    let count = payment_order::Entity::find()
        .count(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn status_and_health_endpoints_respond() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/status", &[], None).await;
    assert_status(&response, StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["name"], "subpay-api");

    let response = app.request(Method::GET, "/health", &[], None).await;
    assert_status(&response, StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "healthy");
}
