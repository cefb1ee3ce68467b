//! Occurrence materialiser: turns "this user's event day is today" into a
//! durable pending record with a precise local-09:00 send instant.

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use db::DbErr;
use db::models::scheduled_message::{CreateOutcome, ScheduledMessage, ScheduledMessageError};
use db::models::user::User;
use db::types::MessageType;
use thiserror::Error;

use crate::ServiceContext;

#[derive(Debug, Error)]
enum MaterialiseError {
    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("unparsable anchor date '{0}'")]
    InvalidAnchor(String),
    #[error("send time is unrepresentable in this zone")]
    UnrepresentableSendTime,
    #[error(transparent)]
    Store(#[from] ScheduledMessageError),
}

#[derive(Debug, Default)]
pub struct MaterialiseOutcome {
    pub scanned: usize,
    pub created: usize,
}

/// One materialiser tick. Safe to run concurrently across replicas: the
/// store's identity constraint absorbs duplicate inserts. Per-user problems
/// are logged and never abort the batch.
pub async fn materialise_today(ctx: &ServiceContext) -> Result<MaterialiseOutcome, DbErr> {
    let now = Utc::now();
    let users = User::find_active(&ctx.db.pool).await?;
    let mut outcome = MaterialiseOutcome {
        scanned: users.len(),
        ..Default::default()
    };

    for user in &users {
        match materialise_user(ctx, user, now).await {
            Ok(Some(CreateOutcome::Created)) => {
                outcome.created += 1;
                tracing::info!(user_id = %user.id, "scheduled birthday greeting for today");
            }
            Ok(Some(CreateOutcome::Existed)) => {
                tracing::debug!(user_id = %user.id, "greeting already scheduled for today");
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(user_id = %user.id, error = %err, "skipping user this tick");
            }
        }
    }

    Ok(outcome)
}

/// Returns `None` when today is not this user's event day.
async fn materialise_user(
    ctx: &ServiceContext,
    user: &User,
    now: DateTime<Utc>,
) -> Result<Option<CreateOutcome>, MaterialiseError> {
    let tz: Tz = user
        .timezone
        .parse()
        .map_err(|_| MaterialiseError::InvalidTimezone(user.timezone.clone()))?;
    let today = now.with_timezone(&tz).date_naive();

    let anchor = NaiveDate::parse_from_str(&user.birthday, "%Y-%m-%d")
        .map_err(|_| MaterialiseError::InvalidAnchor(user.birthday.clone()))?;
    if !is_event_day(anchor, today) {
        return Ok(None);
    }

    let schedule = &ctx.config.schedule;
    let scheduled_at = send_instant(tz, today, schedule.send_hour, schedule.send_minute)
        .ok_or(MaterialiseError::UnrepresentableSendTime)?;
    let scheduled_date = today.format("%Y-%m-%d").to_string();
    let body = render_body(&user.first_name, &user.last_name, MessageType::Birthday);

    let outcome = ScheduledMessage::create_if_absent(
        &ctx.db.pool,
        user.id,
        MessageType::Birthday,
        &scheduled_date,
        &body,
        scheduled_at,
    )
    .await?;
    Ok(Some(outcome))
}

/// Month/day equality against the anchor. A Feb 29 anchor therefore never
/// matches in a non-leap year; there is no shift to Feb 28 or Mar 1.
fn is_event_day(anchor: NaiveDate, today: NaiveDate) -> bool {
    anchor.month() == today.month() && anchor.day() == today.day()
}

/// The UTC instant of the configured local wall time on `date` in `tz`.
///
/// A wall time swallowed by a DST spring-forward gap resolves to the first
/// valid instant at or after it; an ambiguous fall-back time resolves to the
/// earlier of the two UTC instants.
fn send_instant(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let mut wall = date.and_hms_opt(hour, minute, 0)?;
    // DST gaps are at most a couple of hours; scanning a day covers any zone.
    for _ in 0..(24 * 60) {
        match tz.from_local_datetime(&wall) {
            LocalResult::Single(local) => return Some(local.with_timezone(&Utc)),
            LocalResult::Ambiguous(earlier, _) => return Some(earlier.with_timezone(&Utc)),
            LocalResult::None => wall += Duration::minutes(1),
        }
    }
    None
}

fn render_body(first_name: &str, last_name: &str, message_type: MessageType) -> String {
    format!("Hey, {first_name} {last_name} it's your {message_type}")
}
