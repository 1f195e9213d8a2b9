//! Timer parsing and next-fire computation
//!
//! The weekly and daily points are compiled into `cron` schedules. All
//! schedule points are UTC.

use chrono::{DateTime, NaiveTime, Timelike, Utc, Weekday};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

use super::config::IngestConfig;
use super::error::{IngestError, IngestResult};

/// Parsed timer configuration for the three background loops
#[derive(Debug, Clone)]
pub struct SyncSchedule {
    pub delta_interval: Duration,
    pub full_day: Weekday,
    pub full_time: NaiveTime,
    pub cleanup_time: NaiveTime,
    full: Schedule,
    cleanup: Schedule,
}

impl SyncSchedule {
    pub fn from_config(config: &IngestConfig) -> IngestResult<Self> {
        let full_day = parse_weekday(&config.full_sync_day)?;
        let full_time = parse_time(&config.full_sync_time)?;
        let cleanup_time = parse_time(&config.cleanup_time)?;

        Ok(Self {
            delta_interval: parse_interval(&config.delta_sync_interval)?,
            full: cron_schedule(full_time, &full_day.to_string())?,
            cleanup: cron_schedule(cleanup_time, "*")?,
            full_day,
            full_time,
            cleanup_time,
        })
    }

    /// First full sync strictly after `now`
    pub fn next_full(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.full.after(&now).next()
    }

    /// First retention cleanup strictly after `now`
    pub fn next_cleanup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cleanup.after(&now).next()
    }
}

/// `sec min hour day-of-month month day-of-week`
fn cron_schedule(at: NaiveTime, day_of_week: &str) -> IngestResult<Schedule> {
    let expr = format!("0 {} {} * * {}", at.minute(), at.hour(), day_of_week);
    Schedule::from_str(&expr)
        .map_err(|e| IngestError::Config(format!("invalid schedule '{}': {}", expr, e)))
}

/// Parse "30s", "15m", "6h" or "1d"
pub fn parse_interval(value: &str) -> IngestResult<Duration> {
    let value = value.trim();
    let invalid = || IngestError::Config(format!("invalid interval '{}'", value));

    let split = value.len().checked_sub(1).ok_or_else(invalid)?;
    if !value.is_char_boundary(split) {
        return Err(invalid());
    }
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount.trim().parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }

    let unit_secs: u64 = match unit.to_ascii_lowercase().as_str() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(invalid()),
    };
    let secs = amount.checked_mul(unit_secs).ok_or_else(invalid)?;
    Ok(Duration::from_secs(secs))
}

/// Parse "HH:MM"
pub fn parse_time(value: &str) -> IngestResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| IngestError::Config(format!("invalid time '{}': {}", value, e)))
}

/// Parse a weekday name such as "sunday" or "Sun"
pub fn parse_weekday(value: &str) -> IngestResult<Weekday> {
    value
        .trim()
        .parse::<Weekday>()
        .map_err(|_| IngestError::Config(format!("invalid weekday '{}'", value)))
}

/// Wall-clock distance to `target`, zero if it already passed
pub fn until(target: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}
