//! Periodic driver: a minimal cron parser plus two tick loops (materialise,
//! process) and a one-shot recovery pass at startup. A ticker is enough for
//! the default cadences; no cron crate needed.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use thiserror::Error;

use crate::ServiceContext;
use crate::services::{dispatch, greetings};

#[derive(Debug, Error)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct CronParseError {
    expression: String,
    reason: String,
}

/// Five-field cron schedule (`MIN HOUR DOM MON DOW`). Each field accepts
/// `*`, `*/N`, a number, or a comma list; fields are matched independently.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let err = |reason: &str| CronParseError {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(err("expected 5 fields: MIN HOUR DOM MON DOW"));
        }

        Ok(Self {
            minutes: parse_field(parts[0], 0, 59).ok_or_else(|| err("bad minute field"))?,
            hours: parse_field(parts[1], 0, 23).ok_or_else(|| err("bad hour field"))?,
            days_of_month: parse_field(parts[2], 1, 31)
                .ok_or_else(|| err("bad day-of-month field"))?,
            months: parse_field(parts[3], 1, 12).ok_or_else(|| err("bad month field"))?,
            days_of_week: parse_field(parts[4], 0, 6)
                .ok_or_else(|| err("bad day-of-week field"))?,
        })
    }

    /// First fire strictly after `after`, scanning minute by minute. Covers
    /// a full year, which is enough for any satisfiable 5-field schedule.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days_of_month.contains(&t.day())
            && self.months.contains(&t.month())
            && self.days_of_week.contains(&t.weekday().num_days_from_sunday())
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n as usize).collect());
    }

    if field.contains(',') {
        let values: Result<Vec<u32>, _> = field.split(',').map(|s| s.trim().parse()).collect();
        let values: Vec<u32> = values.ok()?;
        if values.iter().any(|v| *v < min || *v > max) {
            return None;
        }
        return Some(values);
    }

    let n: u32 = field.parse().ok()?;
    (n >= min && n <= max).then(|| vec![n])
}

#[derive(Clone, Copy)]
enum TickKind {
    Materialise,
    Process,
}

impl TickKind {
    fn name(self) -> &'static str {
        match self {
            TickKind::Materialise => "materialise",
            TickKind::Process => "process",
        }
    }
}

pub struct Scheduler {
    ctx: ServiceContext,
    check_schedule: CronSchedule,
    process_schedule: CronSchedule,
}

impl Scheduler {
    /// Parses both cadences up front so a bad expression aborts startup.
    pub fn new(ctx: ServiceContext) -> Result<Self, CronParseError> {
        let check_schedule = CronSchedule::parse(&ctx.config.schedule.check_cron)?;
        let process_schedule = CronSchedule::parse(&ctx.config.schedule.process_cron)?;
        Ok(Self {
            ctx,
            check_schedule,
            process_schedule,
        })
    }

    /// Runs until the shutdown watch flips. The in-flight tick is drained
    /// before this future resolves; no new ticks start after shutdown.
    pub async fn run(self) {
        // Close the downtime window before the periodic loops begin.
        match dispatch::recover_missed(&self.ctx).await {
            Ok(outcome) if outcome.attempted > 0 => {
                tracing::info!(sent = outcome.sent, failed = outcome.failed, "recovery pass done");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "startup recovery pass failed");
            }
        }

        tokio::join!(
            run_loop(self.ctx.clone(), self.check_schedule, TickKind::Materialise),
            run_loop(self.ctx.clone(), self.process_schedule, TickKind::Process),
        );
        tracing::info!("scheduler stopped");
    }
}

async fn run_loop(ctx: ServiceContext, schedule: CronSchedule, kind: TickKind) {
    let mut shutdown = ctx.shutdown.clone();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let now = Utc::now();
        let Some(fire_at) = schedule.next_after(now) else {
            tracing::error!(task = kind.name(), "schedule yields no future fire, stopping loop");
            return;
        };
        let wait = (fire_at - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        // The tick runs to completion before the next fire is considered,
        // so ticks never overlap within a replica.
        let result = match kind {
            TickKind::Materialise => greetings::materialise_today(&ctx).await.map(|outcome| {
                tracing::debug!(
                    task = kind.name(),
                    scanned = outcome.scanned,
                    created = outcome.created,
                    "tick complete"
                );
            }),
            TickKind::Process => dispatch::process_due(&ctx).await.map(|outcome| {
                tracing::debug!(
                    task = kind.name(),
                    attempted = outcome.attempted,
                    sent = outcome.sent,
                    "tick complete"
                );
            }),
        };
        if let Err(err) = result {
            tracing::error!(task = kind.name(), error = %err, "tick failed");
        }

        if let Some(next_fire) = schedule.next_after(fire_at) {
            if Utc::now() > next_fire {
                tracing::warn!(task = kind.name(), "tick overran its cadence, skipping missed fire");
            }
        }
    }
}
