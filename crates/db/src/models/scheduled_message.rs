use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::entities::scheduled_message;
use crate::models::ids;
use crate::retry::retry_on_sqlite_busy;
use crate::types::{MessageStatus, MessageType};

#[derive(Debug, Error)]
pub enum ScheduledMessageError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("User not found")]
    UserNotFound,
    #[error("Scheduled message not found")]
    NotFound,
    #[error("Lease no longer held")]
    LeaseLost,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub message_type: MessageType,
    pub message_body: String,
    pub status: MessageStatus,
    pub scheduled_date: String,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub lock_id: Option<Uuid>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Result of an idempotent insert against the `(user, type, date)` identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Existed,
}

impl ScheduledMessage {
    async fn from_model<C: ConnectionTrait>(
        db: &C,
        model: scheduled_message::Model,
    ) -> Result<Self, DbErr> {
        let user_uuid = ids::user_uuid_by_id(db, model.user_id)
            .await?
            .ok_or(DbErr::RecordNotFound("User not found".to_string()))?;

        Ok(Self {
            id: model.uuid,
            user_id: user_uuid,
            message_type: model.message_type,
            message_body: model.message_body,
            status: model.status,
            scheduled_date: model.scheduled_date,
            scheduled_at: model.scheduled_at,
            sent_at: model.sent_at,
            retry_count: model.retry_count,
            error_message: model.error_message,
            lock_id: model.lock_id,
            locked_until: model.locked_until,
            created_at: model.created_at,
        })
    }

    /// Insert a pending record, or no-op when one already exists for this
    /// `(user, type, date)` identity. Conflicts are absorbed silently so
    /// concurrent materialiser replicas stay idempotent.
    pub async fn create_if_absent<C: ConnectionTrait>(
        db: &C,
        user_uuid: Uuid,
        message_type: MessageType,
        scheduled_date: &str,
        message_body: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<CreateOutcome, ScheduledMessageError> {
        let user_row_id = ids::user_id_by_uuid(db, user_uuid)
            .await?
            .ok_or(ScheduledMessageError::UserNotFound)?;

        let active = scheduled_message::ActiveModel {
            uuid: Set(Uuid::new_v4()),
            user_id: Set(user_row_id),
            message_type: Set(message_type),
            message_body: Set(message_body.to_string()),
            status: Set(MessageStatus::Pending),
            scheduled_date: Set(scheduled_date.to_string()),
            scheduled_at: Set(scheduled_at),
            sent_at: Set(None),
            retry_count: Set(0),
            error_message: Set(None),
            lock_id: Set(None),
            locked_until: Set(None),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        let rows = scheduled_message::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([
                    scheduled_message::Column::UserId,
                    scheduled_message::Column::MessageType,
                    scheduled_message::Column::ScheduledDate,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(db)
            .await?;

        Ok(if rows == 0 {
            CreateOutcome::Existed
        } else {
            CreateOutcome::Created
        })
    }

    fn unlocked_condition(now: DateTime<Utc>) -> Condition {
        // A record is locked iff lock_id is set and the lease has not expired.
        Condition::any()
            .add(scheduled_message::Column::LockId.is_null())
            .add(scheduled_message::Column::LockedUntil.lte(now))
    }

    /// Records ready to be attempted: pending/retry, due, and not held by a
    /// live lease. Ordered FIFO by `scheduled_at`.
    pub async fn find_due<C: ConnectionTrait>(
        db: &C,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Self>, DbErr> {
        let records = scheduled_message::Entity::find()
            .filter(
                scheduled_message::Column::Status
                    .is_in([MessageStatus::Pending, MessageStatus::Retry]),
            )
            .filter(scheduled_message::Column::ScheduledAt.lte(now))
            .filter(Self::unlocked_condition(now))
            .order_by_asc(scheduled_message::Column::ScheduledAt)
            .limit(limit)
            .all(db)
            .await?;

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            messages.push(Self::from_model(db, record).await?);
        }
        Ok(messages)
    }

    /// Pending/retry records whose send instant has passed; used by the
    /// startup recovery pass.
    pub async fn find_missed<C: ConnectionTrait>(
        db: &C,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, DbErr> {
        let records = scheduled_message::Entity::find()
            .filter(
                scheduled_message::Column::Status
                    .is_in([MessageStatus::Pending, MessageStatus::Retry]),
            )
            .filter(scheduled_message::Column::ScheduledAt.lt(now))
            .order_by_asc(scheduled_message::Column::ScheduledAt)
            .all(db)
            .await?;

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            messages.push(Self::from_model(db, record).await?);
        }
        Ok(messages)
    }

    pub async fn find_by_uuid<C: ConnectionTrait>(
        db: &C,
        uuid: Uuid,
    ) -> Result<Option<Self>, DbErr> {
        let record = scheduled_message::Entity::find()
            .filter(scheduled_message::Column::Uuid.eq(uuid))
            .one(db)
            .await?;
        match record {
            Some(model) => Ok(Some(Self::from_model(db, model).await?)),
            None => Ok(None),
        }
    }

    /// Single-statement compare-and-set lease claim. Succeeds only while the
    /// record is still pending/retry and unlocked or expired; returns whether
    /// this caller now holds the lease.
    pub async fn acquire_lease<C: ConnectionTrait>(
        db: &C,
        uuid: Uuid,
        lock_id: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let now = Utc::now();
        let result = retry_on_sqlite_busy(|| async {
            scheduled_message::Entity::update_many()
                .col_expr(scheduled_message::Column::LockId, Expr::value(lock_id))
                .col_expr(
                    scheduled_message::Column::LockedUntil,
                    Expr::value(lease_until),
                )
                .filter(scheduled_message::Column::Uuid.eq(uuid))
                .filter(
                    scheduled_message::Column::Status
                        .is_in([MessageStatus::Pending, MessageStatus::Retry]),
                )
                .filter(Self::unlocked_condition(now))
                .exec(db)
                .await
        })
        .await?;

        Ok(result.rows_affected == 1)
    }

    /// Terminal success transition. Filtered on the held `lock_id` so a
    /// holder whose lease was reaped cannot clobber another worker's state.
    pub async fn mark_sent<C: ConnectionTrait>(
        db: &C,
        uuid: Uuid,
        lock_id: Uuid,
    ) -> Result<(), ScheduledMessageError> {
        let result = retry_on_sqlite_busy(|| async {
            scheduled_message::Entity::update_many()
                .col_expr(
                    scheduled_message::Column::Status,
                    Expr::value(MessageStatus::Sent),
                )
                .col_expr(scheduled_message::Column::SentAt, Expr::value(Utc::now()))
                .col_expr(
                    scheduled_message::Column::ErrorMessage,
                    Expr::value(None::<String>),
                )
                .col_expr(scheduled_message::Column::LockId, Expr::value(None::<Uuid>))
                .col_expr(
                    scheduled_message::Column::LockedUntil,
                    Expr::value(None::<DateTime<Utc>>),
                )
                .filter(scheduled_message::Column::Uuid.eq(uuid))
                .filter(scheduled_message::Column::LockId.eq(lock_id))
                .exec(db)
                .await
        })
        .await?;

        if result.rows_affected == 0 {
            return Err(ScheduledMessageError::LeaseLost);
        }
        Ok(())
    }

    /// Record a failed processor invocation. The counter bumps once per
    /// invocation and clamps at `max_retries`; the record turns `Failed` on
    /// the invocation after the counter reaches the cap, so a failed record
    /// always carries `retry_count == max_retries`.
    pub async fn mark_failure<C: ConnectionTrait>(
        db: &C,
        uuid: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<MessageStatus, ScheduledMessageError> {
        let record = scheduled_message::Entity::find()
            .filter(scheduled_message::Column::Uuid.eq(uuid))
            .one(db)
            .await?
            .ok_or(ScheduledMessageError::NotFound)?;

        // Sent is terminal; a stale holder racing a successful worker must
        // not resurrect the record.
        if record.status == MessageStatus::Sent {
            return Err(ScheduledMessageError::LeaseLost);
        }

        let next_status = if record.retry_count >= max_retries {
            MessageStatus::Failed
        } else {
            MessageStatus::Retry
        };
        let next_count = (record.retry_count + 1).min(max_retries);

        let mut active: scheduled_message::ActiveModel = record.into();
        active.status = Set(next_status.clone());
        active.retry_count = Set(next_count);
        active.error_message = Set(Some(error.to_string()));
        active.lock_id = Set(None);
        active.locked_until = Set(None);
        retry_on_sqlite_busy(|| {
            let active = active.clone();
            async move { active.update(db).await }
        })
        .await?;

        Ok(next_status)
    }

    /// Best-effort unlock used on errors and cancellation. A no-op when the
    /// lease is no longer ours; the lease expiry is the final safety net.
    pub async fn release_lease<C: ConnectionTrait>(
        db: &C,
        uuid: Uuid,
        lock_id: Uuid,
    ) -> Result<(), DbErr> {
        scheduled_message::Entity::update_many()
            .col_expr(scheduled_message::Column::LockId, Expr::value(None::<Uuid>))
            .col_expr(
                scheduled_message::Column::LockedUntil,
                Expr::value(None::<DateTime<Utc>>),
            )
            .filter(scheduled_message::Column::Uuid.eq(uuid))
            .filter(scheduled_message::Column::LockId.eq(lock_id))
            .exec(db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;

    use crate::models::user::{CreateUser, User};

    use super::*;

    async fn setup_db() -> sea_orm::DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn seed_user(db: &sea_orm::DatabaseConnection) -> Uuid {
        let user_id = Uuid::new_v4();
        User::create(
            db,
            &CreateUser {
                first_name: "John".to_string(),
                last_name: "Doe".to_string(),
                email: format!("{user_id}@example.com"),
                birthday: "1990-05-15".to_string(),
                timezone: "America/New_York".to_string(),
                active: None,
            },
            user_id,
        )
        .await
        .unwrap();
        user_id
    }

    async fn seed_due_message(db: &sea_orm::DatabaseConnection, user_id: Uuid) -> Uuid {
        let scheduled_at = Utc::now() - Duration::minutes(5);
        ScheduledMessage::create_if_absent(
            db,
            user_id,
            MessageType::Birthday,
            "2026-05-15",
            "Hey, John Doe it's your birthday",
            scheduled_at,
        )
        .await
        .unwrap();
        let due = ScheduledMessage::find_due(db, Utc::now(), 10).await.unwrap();
        due[0].id
    }

    #[tokio::test]
    async fn identity_is_deduplicated() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let scheduled_at = Utc::now();

        let first = ScheduledMessage::create_if_absent(
            &db,
            user_id,
            MessageType::Birthday,
            "2026-05-15",
            "body",
            scheduled_at,
        )
        .await
        .unwrap();
        assert_eq!(first, CreateOutcome::Created);

        let second = ScheduledMessage::create_if_absent(
            &db,
            user_id,
            MessageType::Birthday,
            "2026-05-15",
            "body",
            scheduled_at,
        )
        .await
        .unwrap();
        assert_eq!(second, CreateOutcome::Existed);

        // A different type on the same date is a distinct identity.
        let anniversary = ScheduledMessage::create_if_absent(
            &db,
            user_id,
            MessageType::Anniversary,
            "2026-05-15",
            "body",
            scheduled_at,
        )
        .await
        .unwrap();
        assert_eq!(anniversary, CreateOutcome::Created);
    }

    #[tokio::test]
    async fn find_due_orders_by_scheduled_at_and_skips_future() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let now = Utc::now();

        ScheduledMessage::create_if_absent(
            &db,
            user_id,
            MessageType::Birthday,
            "2026-05-16",
            "later",
            now - Duration::minutes(1),
        )
        .await
        .unwrap();
        ScheduledMessage::create_if_absent(
            &db,
            user_id,
            MessageType::Birthday,
            "2026-05-15",
            "earlier",
            now - Duration::minutes(10),
        )
        .await
        .unwrap();
        ScheduledMessage::create_if_absent(
            &db,
            user_id,
            MessageType::Birthday,
            "2026-05-17",
            "future",
            now + Duration::hours(1),
        )
        .await
        .unwrap();

        let due = ScheduledMessage::find_due(&db, now, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].message_body, "earlier");
        assert_eq!(due[1].message_body, "later");
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let message_id = seed_due_message(&db, user_id).await;

        let winner = Uuid::new_v4();
        let loser = Uuid::new_v4();
        let lease_until = Utc::now() + Duration::minutes(5);

        assert!(
            ScheduledMessage::acquire_lease(&db, message_id, winner, lease_until)
                .await
                .unwrap()
        );
        assert!(
            !ScheduledMessage::acquire_lease(&db, message_id, loser, lease_until)
                .await
                .unwrap()
        );

        // A locked record is not handed out again.
        let due = ScheduledMessage::find_due(&db, Utc::now(), 10).await.unwrap();
        assert!(due.is_empty());

        // An expired lease is equivalent to unlocked.
        let expired = Utc::now() - Duration::seconds(1);
        ScheduledMessage::acquire_lease(&db, message_id, winner, expired)
            .await
            .unwrap();
        assert!(
            ScheduledMessage::acquire_lease(&db, message_id, loser, lease_until)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn mark_sent_requires_the_held_lock() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let message_id = seed_due_message(&db, user_id).await;

        let lock_id = Uuid::new_v4();
        ScheduledMessage::acquire_lease(&db, message_id, lock_id, Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        let stale = Uuid::new_v4();
        let err = ScheduledMessage::mark_sent(&db, message_id, stale)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduledMessageError::LeaseLost));

        ScheduledMessage::mark_sent(&db, message_id, lock_id)
            .await
            .unwrap();

        let sent = ScheduledMessage::find_by_uuid(&db, message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert!(sent.sent_at.is_some());
        assert!(sent.lock_id.is_none());
        assert!(sent.error_message.is_none());

        // Sent records never come back as due or leasable.
        assert!(
            ScheduledMessage::find_due(&db, Utc::now() + Duration::hours(1), 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            !ScheduledMessage::acquire_lease(
                &db,
                message_id,
                Uuid::new_v4(),
                Utc::now() + Duration::minutes(5)
            )
            .await
            .unwrap()
        );
    }

    #[tokio::test]
    async fn failure_counter_clamps_and_fails_after_the_cap() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let message_id = seed_due_message(&db, user_id).await;
        let max_retries = 3;

        for expected_count in 1..=3 {
            let status = ScheduledMessage::mark_failure(&db, message_id, "boom", max_retries)
                .await
                .unwrap();
            assert_eq!(status, MessageStatus::Retry);
            let record = ScheduledMessage::find_by_uuid(&db, message_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.retry_count, expected_count);
            assert_eq!(record.error_message.as_deref(), Some("boom"));
        }

        let status = ScheduledMessage::mark_failure(&db, message_id, "boom", max_retries)
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::Failed);
        let record = ScheduledMessage::find_by_uuid(&db, message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.retry_count, max_retries);
        assert!(record.lock_id.is_none());
    }

    #[tokio::test]
    async fn release_lease_is_scoped_to_the_holder() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let message_id = seed_due_message(&db, user_id).await;

        let holder = Uuid::new_v4();
        ScheduledMessage::acquire_lease(&db, message_id, holder, Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        // Someone else's release is a no-op.
        ScheduledMessage::release_lease(&db, message_id, Uuid::new_v4())
            .await
            .unwrap();
        let record = ScheduledMessage::find_by_uuid(&db, message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.lock_id, Some(holder));

        ScheduledMessage::release_lease(&db, message_id, holder)
            .await
            .unwrap();
        let record = ScheduledMessage::find_by_uuid(&db, message_id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.lock_id.is_none());
    }

    #[tokio::test]
    async fn find_missed_returns_overdue_pending_and_retry() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let message_id = seed_due_message(&db, user_id).await;

        let missed = ScheduledMessage::find_missed(&db, Utc::now()).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].id, message_id);

        ScheduledMessage::mark_failure(&db, message_id, "boom", 3)
            .await
            .unwrap();
        let missed = ScheduledMessage::find_missed(&db, Utc::now()).await.unwrap();
        assert_eq!(missed.len(), 1, "retry records stay recoverable");

        let lock_id = Uuid::new_v4();
        ScheduledMessage::acquire_lease(&db, message_id, lock_id, Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        ScheduledMessage::mark_sent(&db, message_id, lock_id)
            .await
            .unwrap();
        assert!(
            ScheduledMessage::find_missed(&db, Utc::now())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn deleting_the_user_cascades_to_messages() {
        let db = setup_db().await;
        let user_id = seed_user(&db).await;
        let message_id = seed_due_message(&db, user_id).await;

        User::delete(&db, user_id).await.unwrap();
        assert!(
            ScheduledMessage::find_by_uuid(&db, message_id)
                .await
                .unwrap()
                .is_none()
        );
    }
}
