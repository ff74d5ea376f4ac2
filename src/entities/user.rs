use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    #[validate(email)]
    pub email: String,

    pub display_name: String,

    /// Mirrors the user's reconciled subscription state
    pub is_subscribed: bool,
    pub subscription_due_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::payment_order::Entity")]
    PaymentOrders,
}

impl Related<super::payment_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentOrders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
