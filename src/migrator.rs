// `#[async_trait]` requires the elided `&SchemaManager` form from the trait
// definition; spelling out `<'_>` fails with E0195 (early- vs late-bound).
#![allow(elided_lifetimes_in_paths)]

use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_users_table::Migration),
            Box::new(m20260101_000002_create_payment_orders_table::Migration),
        ]
    }
}

mod m20260101_000001_create_users_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000001_create_users_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Users::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Users::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Users::Email)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Users::DisplayName).string().not_null())
                        .col(
                            ColumnDef::new(Users::IsSubscribed)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(Users::SubscriptionDueAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Users::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Users::UpdatedAt).timestamp_with_time_zone().null())
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Users::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum Users {
        Table,
        Id,
        Email,
        DisplayName,
        IsSubscribed,
        SubscriptionDueAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20260101_000002_create_payment_orders_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20260101_000002_create_payment_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentOrders::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::OrderId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::TransactionId)
                                .string()
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PaymentOrders::UserId).uuid().null())
                        .col(ColumnDef::new(PaymentOrders::Amount).decimal().not_null())
                        .col(
                            ColumnDef::new(PaymentOrders::Currency)
                                .string_len(3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::SubscriptionStatus)
                                .string_len(16)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::IsCurrent)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(PaymentOrders::PaidAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(PaymentOrders::DueAt).timestamp_with_time_zone().null())
                        .col(
                            ColumnDef::new(PaymentOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentOrders::UpdatedAt).timestamp_with_time_zone().null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payment_orders_user")
                                .from(PaymentOrders::Table, PaymentOrders::UserId)
                                .to(Users::Table, Users::Id),
                        )
                        .to_owned(),
                )
                .await?;

            // Reconciliation looks orders up by transaction id and scans a
            // user's current orders; index both paths.
            manager
                .create_index(
                    Index::create()
                        .name("idx_payment_orders_user_current")
                        .table(PaymentOrders::Table)
                        .col(PaymentOrders::UserId)
                        .col(PaymentOrders::IsCurrent)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentOrders::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum PaymentOrders {
        Table,
        Id,
        OrderId,
        TransactionId,
        UserId,
        Amount,
        Currency,
        Status,
        SubscriptionStatus,
        IsCurrent,
        PaidAt,
        DueAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(Iden)]
    enum Users {
        Table,
        Id,
    }
}
