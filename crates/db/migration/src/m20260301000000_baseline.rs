use sea_orm_migration::{prelude::*, sea_orm::DatabaseBackend};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(Users::Table)
                    .col(pk_id_col(manager, Users::Id))
                    .col(uuid_col(Users::Uuid))
                    .col(ColumnDef::new(Users::FirstName).string().not_null())
                    .col(ColumnDef::new(Users::LastName).string().not_null())
                    .col(ColumnDef::new(Users::Email).string().not_null())
                    .col(ColumnDef::new(Users::Birthday).string_len(10).not_null())
                    .col(ColumnDef::new(Users::Timezone).string_len(64).not_null())
                    .col(
                        ColumnDef::new(Users::Active)
                            .boolean()
                            .not_null()
                            .default(Expr::val(true)),
                    )
                    .col(timestamp_col(Users::CreatedAt))
                    .col(timestamp_col(Users::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_uuid")
                    .table(Users::Table)
                    .col(Users::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_email")
                    .table(Users::Table)
                    .col(Users::Email)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_active")
                    .table(Users::Table)
                    .col(Users::Active)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(ScheduledMessages::Table)
                    .col(pk_id_col(manager, ScheduledMessages::Id))
                    .col(uuid_col(ScheduledMessages::Uuid))
                    .col(fk_id_col(manager, ScheduledMessages::UserId))
                    .col(
                        ColumnDef::new(ScheduledMessages::MessageType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledMessages::MessageBody)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledMessages::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(
                        ColumnDef::new(ScheduledMessages::ScheduledDate)
                            .string_len(10)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledMessages::ScheduledAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ScheduledMessages::SentAt).timestamp())
                    .col(
                        ColumnDef::new(ScheduledMessages::RetryCount)
                            .integer()
                            .not_null()
                            .default(Expr::val(0)),
                    )
                    .col(ColumnDef::new(ScheduledMessages::ErrorMessage).text())
                    .col(ColumnDef::new(ScheduledMessages::LockId).uuid())
                    .col(ColumnDef::new(ScheduledMessages::LockedUntil).timestamp())
                    .col(timestamp_col(ScheduledMessages::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_scheduled_messages_user_id")
                            .from(ScheduledMessages::Table, ScheduledMessages::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_scheduled_messages_uuid")
                    .table(ScheduledMessages::Table)
                    .col(ScheduledMessages::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // The dedup identity: at most one record per (user, type, civil date).
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_scheduled_messages_identity")
                    .table(ScheduledMessages::Table)
                    .col(ScheduledMessages::UserId)
                    .col(ScheduledMessages::MessageType)
                    .col(ScheduledMessages::ScheduledDate)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_scheduled_messages_due")
                    .table(ScheduledMessages::Table)
                    .col(ScheduledMessages::Status)
                    .col(ScheduledMessages::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ScheduledMessages::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: Iden + 'static>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn fk_id_col<T: Iden + 'static>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().to_owned()
}

fn uuid_col<T: Iden + 'static>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().not_null().to_owned()
}

fn timestamp_col<T: Iden + 'static>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum Users {
    Table,
    Id,
    Uuid,
    FirstName,
    LastName,
    Email,
    Birthday,
    Timezone,
    Active,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum ScheduledMessages {
    Table,
    Id,
    Uuid,
    UserId,
    MessageType,
    MessageBody,
    Status,
    ScheduledDate,
    ScheduledAt,
    SentAt,
    RetryCount,
    ErrorMessage,
    LockId,
    LockedUntil,
    CreatedAt,
}
