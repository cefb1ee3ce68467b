use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const EMAIL_SERVICE_URL_ENV: &str = "EMAIL_SERVICE_URL";
const EMAIL_SERVICE_TIMEOUT_ENV: &str = "EMAIL_SERVICE_TIMEOUT";
const EMAIL_SERVICE_MAX_RETRIES_ENV: &str = "EMAIL_SERVICE_MAX_RETRIES";
const EMAIL_SERVICE_RETRY_DELAY_ENV: &str = "EMAIL_SERVICE_RETRY_DELAY";
const CIRCUIT_BREAKER_THRESHOLD_ENV: &str = "CIRCUIT_BREAKER_THRESHOLD";
const CIRCUIT_BREAKER_RESET_MS_ENV: &str = "CIRCUIT_BREAKER_RESET_MS";
const BIRTHDAY_CHECK_CRON_ENV: &str = "BIRTHDAY_CHECK_CRON";
const MESSAGE_PROCESS_CRON_ENV: &str = "MESSAGE_PROCESS_CRON";
const BIRTHDAY_MESSAGE_HOUR_ENV: &str = "BIRTHDAY_MESSAGE_HOUR";
const BIRTHDAY_MESSAGE_MINUTE_ENV: &str = "BIRTHDAY_MESSAGE_MINUTE";
const MESSAGE_BATCH_LIMIT_ENV: &str = "MESSAGE_BATCH_LIMIT";
const MESSAGE_LEASE_SECS_ENV: &str = "MESSAGE_LEASE_SECS";

const DEFAULT_EMAIL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_EMAIL_MAX_RETRIES: u32 = 3;
const DEFAULT_EMAIL_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_RESET_MS: u64 = 60_000;
const DEFAULT_CHECK_CRON: &str = "*/5 * * * *";
const DEFAULT_PROCESS_CRON: &str = "* * * * *";
const DEFAULT_MESSAGE_HOUR: u32 = 9;
const DEFAULT_MESSAGE_MINUTE: u32 = 0;
const DEFAULT_BATCH_LIMIT: u64 = 50;
const DEFAULT_LEASE_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVar(&'static str),
    #[error("invalid value '{value}' for {var}")]
    InvalidVar { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Additional attempts after the first, within one `send` invocation.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub breaker_threshold: u32,
    pub breaker_reset: Duration,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub check_cron: String,
    pub process_cron: String,
    pub send_hour: u32,
    pub send_minute: u32,
    pub batch_limit: u64,
    pub lease_duration: Duration,
    /// Cap on a record's persisted retry counter. Shares
    /// `EMAIL_SERVICE_MAX_RETRIES` with the in-call retry budget.
    pub max_retries: i32,
}

/// Typed configuration, read once at startup. Hot reload is a non-goal.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub email: EmailConfig,
    pub schedule: ScheduleConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary lookup so tests never touch process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup(EMAIL_SERVICE_URL_ENV)
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingVar(EMAIL_SERVICE_URL_ENV))?;

        let timeout_ms = parse_or_default(&lookup, EMAIL_SERVICE_TIMEOUT_ENV, DEFAULT_EMAIL_TIMEOUT_MS)?;
        let max_retries =
            parse_or_default(&lookup, EMAIL_SERVICE_MAX_RETRIES_ENV, DEFAULT_EMAIL_MAX_RETRIES)?;
        let retry_delay_ms = parse_or_default(
            &lookup,
            EMAIL_SERVICE_RETRY_DELAY_ENV,
            DEFAULT_EMAIL_RETRY_DELAY_MS,
        )?;
        let breaker_threshold = parse_or_default(
            &lookup,
            CIRCUIT_BREAKER_THRESHOLD_ENV,
            DEFAULT_BREAKER_THRESHOLD,
        )?;
        let breaker_reset_ms =
            parse_or_default(&lookup, CIRCUIT_BREAKER_RESET_MS_ENV, DEFAULT_BREAKER_RESET_MS)?;

        let send_hour = parse_or_default(&lookup, BIRTHDAY_MESSAGE_HOUR_ENV, DEFAULT_MESSAGE_HOUR)?;
        if send_hour > 23 {
            return Err(ConfigError::InvalidVar {
                var: BIRTHDAY_MESSAGE_HOUR_ENV,
                value: send_hour.to_string(),
            });
        }
        let send_minute =
            parse_or_default(&lookup, BIRTHDAY_MESSAGE_MINUTE_ENV, DEFAULT_MESSAGE_MINUTE)?;
        if send_minute > 59 {
            return Err(ConfigError::InvalidVar {
                var: BIRTHDAY_MESSAGE_MINUTE_ENV,
                value: send_minute.to_string(),
            });
        }

        let batch_limit = parse_or_default(&lookup, MESSAGE_BATCH_LIMIT_ENV, DEFAULT_BATCH_LIMIT)?;
        let lease_secs = parse_or_default(&lookup, MESSAGE_LEASE_SECS_ENV, DEFAULT_LEASE_SECS)?;

        Ok(Self {
            email: EmailConfig {
                base_url,
                request_timeout: Duration::from_millis(timeout_ms),
                max_retries,
                retry_base_delay: Duration::from_millis(retry_delay_ms),
                breaker_threshold,
                breaker_reset: Duration::from_millis(breaker_reset_ms),
            },
            schedule: ScheduleConfig {
                check_cron: lookup(BIRTHDAY_CHECK_CRON_ENV)
                    .unwrap_or_else(|| DEFAULT_CHECK_CRON.to_string()),
                process_cron: lookup(MESSAGE_PROCESS_CRON_ENV)
                    .unwrap_or_else(|| DEFAULT_PROCESS_CRON.to_string()),
                send_hour,
                send_minute,
                batch_limit,
                lease_duration: Duration::from_secs(lease_secs),
                max_retries: max_retries as i32,
            },
        })
    }
}

fn parse_or_default<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { var, value: raw }),
        None => Ok(default),
    }
}
