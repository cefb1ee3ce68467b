//! Due processor: drives pending/retry records to a terminal state under a
//! per-record lease. Persistence is the queue — a failed record simply comes
//! back on the next tick.

use chrono::{Duration, Utc};
use db::DbErr;
use db::models::scheduled_message::{ScheduledMessage, ScheduledMessageError};
use db::models::user::User;
use db::types::MessageStatus;
use uuid::Uuid;

use crate::ServiceContext;
use crate::services::email::EmailError;

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub attempted: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

enum RecordOutcome {
    Sent,
    Transitioned(MessageStatus),
    Skipped,
    Cancelled,
}

/// One processor tick over the due batch, FIFO by `scheduled_at`.
pub async fn process_due(ctx: &ServiceContext) -> Result<DispatchOutcome, DbErr> {
    let now = Utc::now();
    let batch =
        ScheduledMessage::find_due(&ctx.db.pool, now, ctx.config.schedule.batch_limit).await?;
    process_batch(ctx, batch).await
}

/// Startup recovery: pick up everything whose send instant passed while the
/// process was down, through the same per-record pipeline.
pub async fn recover_missed(ctx: &ServiceContext) -> Result<DispatchOutcome, DbErr> {
    let batch = ScheduledMessage::find_missed(&ctx.db.pool, Utc::now()).await?;
    if !batch.is_empty() {
        tracing::info!(count = batch.len(), "recovering deliveries missed during downtime");
    }
    process_batch(ctx, batch).await
}

async fn process_batch(
    ctx: &ServiceContext,
    batch: Vec<ScheduledMessage>,
) -> Result<DispatchOutcome, DbErr> {
    let mut outcome = DispatchOutcome::default();

    for message in batch {
        if *ctx.shutdown.borrow() {
            break;
        }
        match process_one(ctx, &message).await {
            Ok(RecordOutcome::Sent) => {
                outcome.attempted += 1;
                outcome.sent += 1;
            }
            Ok(RecordOutcome::Transitioned(status)) => {
                outcome.attempted += 1;
                match status {
                    MessageStatus::Failed => outcome.failed += 1,
                    _ => outcome.retried += 1,
                }
            }
            Ok(RecordOutcome::Skipped) => {}
            Ok(RecordOutcome::Cancelled) => break,
            // Per-record store errors end at the tick boundary; the record
            // comes back once its lease expires.
            Err(err) => {
                tracing::error!(message_id = %message.id, error = %err, "record pipeline failed");
            }
        }
    }

    Ok(outcome)
}

async fn process_one(
    ctx: &ServiceContext,
    message: &ScheduledMessage,
) -> Result<RecordOutcome, ScheduledMessageError> {
    let db = &ctx.db.pool;
    let lock_id = Uuid::new_v4();
    let lease_until = Utc::now()
        + Duration::from_std(ctx.config.schedule.lease_duration)
            .unwrap_or_else(|_| Duration::minutes(5));

    if !ScheduledMessage::acquire_lease(db, message.id, lock_id, lease_until).await? {
        tracing::debug!(message_id = %message.id, "lease held by another worker, skipping");
        return Ok(RecordOutcome::Skipped);
    }

    match attempt_delivery(ctx, message.id, lock_id).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if let Err(release_err) =
                ScheduledMessage::release_lease(db, message.id, lock_id).await
            {
                tracing::warn!(
                    message_id = %message.id,
                    error = %release_err,
                    "failed to release lease; expiry will reclaim it"
                );
            }
            Err(err)
        }
    }
}

async fn attempt_delivery(
    ctx: &ServiceContext,
    message_id: Uuid,
    lock_id: Uuid,
) -> Result<RecordOutcome, ScheduledMessageError> {
    let db = &ctx.db.pool;

    // Re-read under the lease: the scan snapshot may be stale.
    let Some(message) = ScheduledMessage::find_by_uuid(db, message_id).await? else {
        // Cascade-deleted between scan and lease.
        return Ok(RecordOutcome::Skipped);
    };
    let Some(user) = User::find_by_uuid(db, message.user_id).await? else {
        tracing::warn!(message_id = %message_id, "user vanished mid-processing, releasing lease");
        ScheduledMessage::release_lease(db, message_id, lock_id).await?;
        return Ok(RecordOutcome::Skipped);
    };

    match ctx.email.send(&user.email, &message.message_body).await {
        Ok(()) => {
            ScheduledMessage::mark_sent(db, message_id, lock_id).await?;
            tracing::info!(
                message_id = %message_id,
                user_id = %user.id,
                attempt = message.retry_count + 1,
                "greeting delivered"
            );
            Ok(RecordOutcome::Sent)
        }
        Err(EmailError::Cancelled) => {
            ScheduledMessage::release_lease(db, message_id, lock_id).await?;
            Ok(RecordOutcome::Cancelled)
        }
        Err(err) => {
            let classification = match &err {
                EmailError::BreakerOpen => "breaker_open",
                EmailError::Terminal(_) => "terminal",
                _ => "transient",
            };
            let status = ScheduledMessage::mark_failure(
                db,
                message_id,
                &err.to_string(),
                ctx.config.schedule.max_retries,
            )
            .await?;
            tracing::warn!(
                message_id = %message_id,
                user_id = %user.id,
                attempt = message.retry_count + 1,
                classification,
                status = %status,
                error = %err,
                "delivery attempt failed"
            );
            Ok(RecordOutcome::Transitioned(status))
        }
    }
}
