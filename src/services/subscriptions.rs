use chrono::{Months, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::payment_order::{self, OrderStatus, SubscriptionStatus};
use crate::entities::user;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::gateway::{
    GatewayError, Package, PaymentGateway, PaymentRequest, RedirectUrls,
};
use crate::services::pending_orders::{PendingOrder, PendingOrderStore};

/// Months of service granted per successful charge.
const BILLING_PERIOD_MONTHS: u32 = 1;

const DEFAULT_PLAN_NAME: &str = "Monthly subscription";

/// Result of opening a checkout: the payer must now be redirected to
/// `payment_url` and will come back through the confirm endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SubscriptionCheckout {
    pub order_id: String,
    pub transaction_id: String,
    pub payment_url: String,
}

/// A user's subscription as derived from their current payment order.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SubscriptionView {
    pub user_id: Uuid,
    pub active: bool,
    pub due_at: Option<chrono::DateTime<Utc>>,
    pub current_order: Option<payment_order::Model>,
}

/// Drives the order state machine: opens checkouts against the gateway
/// and reconciles gateway outcomes into payment orders.
///
/// Status is mutated exactly once after creation (Pending -> Success or
/// Pending -> Failed); every transition and its side effects happen in a
/// single database transaction.
pub struct SubscriptionService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    pending_orders: Arc<PendingOrderStore>,
    event_sender: Option<Arc<EventSender>>,
    default_currency: String,
}

impl SubscriptionService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        pending_orders: Arc<PendingOrderStore>,
        event_sender: Option<Arc<EventSender>>,
        default_currency: String,
    ) -> Self {
        Self {
            db,
            gateway,
            pending_orders,
            event_sender,
            default_currency,
        }
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                error!("Failed to send event: {}", e);
            }
        }
    }

    /// Opens a subscription checkout for `user_id`.
    ///
    /// Refuses with Conflict while the user already holds an active,
    /// unexpired subscription; in that case no gateway call is made and
    /// no row is written. On success a Pending order row exists, the
    /// order context is parked under `session_key`, and the caller gets
    /// the gateway redirect URL.
    #[instrument(skip(self, redirect_urls, session_key), fields(user_id = %user_id, amount = %amount))]
    pub async fn request_subscription(
        &self,
        user_id: Uuid,
        amount: Decimal,
        currency: Option<String>,
        plan: Option<String>,
        redirect_urls: RedirectUrls,
        session_key: &str,
    ) -> Result<SubscriptionCheckout, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "amount must be positive".into(),
            ));
        }
        let currency = currency.unwrap_or_else(|| self.default_currency.clone());

        let account = user::Entity::find_by_id(user_id)
            .one(&*self.db)
            .await
            .map_err(|e| {
                error!("Failed to load user {}: {}", user_id, e);
                ServiceError::DatabaseError(e)
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("No user {}", user_id)))?;

        if let Some(current) = self.find_current_order(&*self.db, user_id).await? {
            let still_active = current.status == OrderStatus::Success
                && current.subscription_status == Some(SubscriptionStatus::Active)
                && current.due_at.map(|due| due > Utc::now()).unwrap_or(false);
            if still_active {
                let due = current.due_at.map(|d| d.to_rfc3339()).unwrap_or_default();
                return Err(ServiceError::Conflict(format!(
                    "subscription already active until {}",
                    due
                )));
            }
        }

        let order_id = format!("SUB-{}", Uuid::new_v4().simple());
        let request = PaymentRequest {
            amount,
            currency: currency.clone(),
            order_id: order_id.clone(),
            packages: vec![Package {
                id: "subscription".into(),
                amount,
                name: plan.unwrap_or_else(|| DEFAULT_PLAN_NAME.to_string()),
            }],
            redirect_urls: redirect_urls.clone(),
        };

        let requested = self
            .gateway
            .request_payment(&request)
            .await
            .map_err(map_gateway_error)?;

        let now = Utc::now();
        let order = payment_order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id.clone()),
            transaction_id: Set(Some(requested.transaction_id.clone())),
            user_id: Set(Some(user_id)),
            amount: Set(amount),
            currency: Set(currency.clone()),
            status: Set(OrderStatus::Pending),
            subscription_status: Set(None),
            is_current: Set(false),
            paid_at: Set(None),
            due_at: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        };
        order.insert(&*self.db).await.map_err(|e| {
            error!("Failed to insert payment order {}: {}", order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        self.pending_orders
            .put(
                session_key,
                PendingOrder {
                    order_id: order_id.clone(),
                    user_id,
                    amount,
                    currency: currency.clone(),
                    transaction_id: requested.transaction_id.clone(),
                    redirect_urls,
                    created_at: now,
                    expires_at: now,
                },
            )
            .await
            .map_err(|e| {
                error!("Failed to park pending order {}: {}", order_id, e);
                ServiceError::InternalError(e.to_string())
            })?;

        self.emit(Event::SubscriptionPaymentRequested {
            order_id: order_id.clone(),
            user_id,
            amount,
            currency,
        })
        .await;

        info!(%order_id, email = %account.email, "subscription checkout opened");
        Ok(SubscriptionCheckout {
            order_id,
            transaction_id: requested.transaction_id,
            payment_url: requested.payment_url,
        })
    }

    /// Reconciles a gateway outcome for `transaction_id`.
    ///
    /// Idempotent: an order already reconciled is returned as-is without
    /// touching the gateway again. A gateway business decline marks the
    /// order Failed and returns it; only infrastructure failures surface
    /// as errors, leaving the order Pending for a later retry.
    #[instrument(skip(self, pending))]
    pub async fn confirm_subscription(
        &self,
        transaction_id: &str,
        pending: Option<PendingOrder>,
    ) -> Result<payment_order::Model, ServiceError> {
        let order = payment_order::Entity::find()
            .filter(payment_order::Column::TransactionId.eq(transaction_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No payment order for transaction {}",
                    transaction_id
                ))
            })?;

        if order.status != OrderStatus::Pending {
            info!(order_id = %order.order_id, status = ?order.status, "order already reconciled");
            return Ok(order);
        }

        // Stale or foreign pending context is ignored rather than trusted.
        let pending = match pending {
            Some(p) if p.transaction_id == transaction_id && p.order_id == order.order_id => {
                Some(p)
            }
            Some(p) => {
                warn!(
                    order_id = %order.order_id,
                    pending_order_id = %p.order_id,
                    "pending context does not match order; ignoring it"
                );
                None
            }
            None => None,
        };
        let user_id = order
            .user_id
            .or_else(|| pending.as_ref().map(|p| p.user_id));

        match self
            .gateway
            .confirm_payment(transaction_id, order.amount, &order.currency)
            .await
        {
            Ok(_confirmation) => self.mark_success(order, user_id).await,
            Err(e) if e.is_retryable() => {
                warn!(order_id = %order.order_id, error = %e, "gateway unavailable; order stays pending");
                Err(ServiceError::ExternalServiceError(e.to_string()))
            }
            Err(e) => self.mark_failed(order, e).await,
        }
    }

    /// Pending -> Success. In one transaction: demote any other current
    /// order of the user, promote this one, and sync the user row.
    async fn mark_success(
        &self,
        order: payment_order::Model,
        user_id: Option<Uuid>,
    ) -> Result<payment_order::Model, ServiceError> {
        let paid_at = Utc::now();
        let due_at = paid_at
            .checked_add_months(Months::new(BILLING_PERIOD_MONTHS))
            .ok_or_else(|| ServiceError::InternalError("due date overflow".into()))?;

        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        // Re-read under the transaction: a concurrent confirm may have
        // won the race after the optimistic check.
        let current = payment_order::Entity::find_by_id(order.id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("No payment order {}", order.order_id)))?;
        if current.status != OrderStatus::Pending {
            txn.rollback().await.map_err(ServiceError::DatabaseError)?;
            return Ok(current);
        }

        if let Some(uid) = user_id {
            self.demote_current_orders(&txn, uid, order.id).await?;
        }

        let mut active: payment_order::ActiveModel = current.into();
        active.status = Set(OrderStatus::Success);
        active.subscription_status = Set(Some(SubscriptionStatus::Active));
        active.is_current = Set(true);
        active.user_id = Set(user_id);
        active.paid_at = Set(Some(paid_at));
        active.due_at = Set(Some(due_at));
        active.updated_at = Set(Some(paid_at));
        let updated = active.update(&txn).await.map_err(|e| {
            error!("Failed to promote order {}: {}", order.order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        if let Some(uid) = user_id {
            user::Entity::update_many()
                .col_expr(user::Column::IsSubscribed, Expr::value(true))
                .col_expr(user::Column::SubscriptionDueAt, Expr::value(Some(due_at)))
                .col_expr(user::Column::UpdatedAt, Expr::value(Some(paid_at)))
                .filter(user::Column::Id.eq(uid))
                .exec(&txn)
                .await
                .map_err(ServiceError::DatabaseError)?;
        }

        txn.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        if let Some(uid) = user_id {
            self.emit(Event::SubscriptionActivated {
                order_id: updated.order_id.clone(),
                user_id: uid,
                due_at,
            })
            .await;
        }

        info!(order_id = %updated.order_id, %due_at, "subscription activated");
        Ok(updated)
    }

    /// Pending -> Failed after a terminal gateway decline. The current
    /// flag of any previous subscription is left untouched.
    async fn mark_failed(
        &self,
        order: payment_order::Model,
        cause: GatewayError,
    ) -> Result<payment_order::Model, ServiceError> {
        let now = Utc::now();

        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let current = payment_order::Entity::find_by_id(order.id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("No payment order {}", order.order_id)))?;
        if current.status != OrderStatus::Pending {
            txn.rollback().await.map_err(ServiceError::DatabaseError)?;
            return Ok(current);
        }

        let mut failed: payment_order::ActiveModel = current.into();
        failed.status = Set(OrderStatus::Failed);
        failed.subscription_status = Set(Some(SubscriptionStatus::Cancelled));
        failed.updated_at = Set(Some(now));
        let updated = failed.update(&txn).await.map_err(|e| {
            error!("Failed to mark order {} failed: {}", order.order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        txn.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        self.emit(Event::SubscriptionPaymentFailed {
            order_id: updated.order_id.clone(),
            reason: cause.to_string(),
        })
        .await;

        warn!(order_id = %updated.order_id, cause = %cause, "subscription payment declined");
        Ok(updated)
    }

    /// Clears `is_current` from every other order of the user, expiring
    /// their subscription state. Part of the promotion transaction so at
    /// most one current order is ever observable.
    async fn demote_current_orders<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        keep_order: Uuid,
    ) -> Result<(), ServiceError> {
        payment_order::Entity::update_many()
            .col_expr(payment_order::Column::IsCurrent, Expr::value(false))
            .col_expr(
                payment_order::Column::SubscriptionStatus,
                Expr::value(Some(SubscriptionStatus::Expired)),
            )
            .col_expr(
                payment_order::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(payment_order::Column::UserId.eq(user_id))
            .filter(payment_order::Column::IsCurrent.eq(true))
            .filter(payment_order::Column::Id.ne(keep_order))
            .exec(conn)
            .await
            .map_err(|e| {
                error!("Failed to demote current orders for {}: {}", user_id, e);
                ServiceError::DatabaseError(e)
            })?;
        Ok(())
    }

    async fn find_current_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<Option<payment_order::Model>, ServiceError> {
        payment_order::Entity::find()
            .filter(payment_order::Column::UserId.eq(user_id))
            .filter(payment_order::Column::IsCurrent.eq(true))
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Current subscription state for a user. `active` is computed from
    /// the due date at read time, so a lapsed subscription reads inactive
    /// without waiting for the next reconciliation.
    #[instrument(skip(self))]
    pub async fn get_subscription(&self, user_id: Uuid) -> Result<SubscriptionView, ServiceError> {
        user::Entity::find_by_id(user_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("No user {}", user_id)))?;

        let current = self.find_current_order(&*self.db, user_id).await?;
        let due_at = current.as_ref().and_then(|o| o.due_at);
        let active = current
            .as_ref()
            .map(|o| o.subscription_status == Some(SubscriptionStatus::Active))
            .unwrap_or(false)
            && due_at.map(|due| due > Utc::now()).unwrap_or(false);

        Ok(SubscriptionView {
            user_id,
            active,
            due_at,
            current_order: current,
        })
    }

    /// Looks a single order up by its caller-issued id.
    pub async fn get_order(&self, order_id: &str) -> Result<payment_order::Model, ServiceError> {
        payment_order::Entity::find()
            .filter(payment_order::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("No payment order {}", order_id)))
    }
}

/// Maps gateway failures that are not handled inline onto the service
/// error taxonomy.
fn map_gateway_error(e: GatewayError) -> ServiceError {
    match e {
        GatewayError::Business { code, message } => {
            ServiceError::PaymentFailed(format!("{} ({})", message, code))
        }
        GatewayError::Configuration(msg) => ServiceError::InternalError(msg),
        other => ServiceError::ExternalServiceError(other.to_string()),
    }
}
