//! Turns a raw `getday` payload into the strings and totals the dashboard shows.
//!
//! Stage summaries look like `22:40-23:10 | 1:05-1:50`; point summaries like
//! `23:02 [1] | 23:47 [2]`. Both stop growing once the accumulated text passes
//! a display bound. The bound is checked before each append, so a summary may
//! end up at most one segment longer than the bound.

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, TimeZone, Utc};
use std::fmt::Display;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::api::{response_code, response_data, Transport, GET_DAY_ENDPOINT};
use crate::auth::{request_timestamp, DeviceIdentity};
use crate::data::{DayReport, DerivedFields, PointEvent, RawDayReport, SleepEvent, SleepStatus};
use crate::error::{PillowError, Result};

pub const INTERVAL_SUMMARY_LIMIT: usize = 240;
pub const POINT_SUMMARY_LIMIT: usize = 245;

/// Timezone field the backend expects in every `getday` body.
pub const BACKEND_TIMEZONE: i32 = 7;

const SEPARATOR: &str = " | ";
const EMPTY: &str = "-";

/// `H:MM` in `tz`, hour without leading zero. Each timestamp gets the
/// offset `tz` has at that instant.
pub fn clock<Tz>(timestamp: i64, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match DateTime::<Utc>::from_timestamp(timestamp, 0) {
        Some(t) => t.with_timezone(tz).format("%-H:%M").to_string(),
        None => "?:??".to_string(),
    }
}

/// Intervals of one sleep stage, in input order.
///
/// An interval that starts at the minute the previous one of the same stage
/// ended extends that segment instead of opening a new one.
pub fn summarize_intervals<Tz>(events: &[SleepEvent], status: SleepStatus, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut summary = String::new();
    let mut prev_end: Option<String> = None;

    for event in events.iter().filter(|e| e.status == status) {
        if summary.len() > INTERVAL_SUMMARY_LIMIT {
            break;
        }

        let start = clock(event.start, tz);
        let end = clock(event.end, tz);

        match prev_end.as_deref() {
            Some(prev) if prev == start => {
                summary.truncate(summary.len() - prev.len());
                summary.push_str(&end);
            }
            _ => {
                if !summary.is_empty() {
                    summary.push_str(SEPARATOR);
                }
                summary.push_str(&start);
                summary.push('-');
                summary.push_str(&end);
            }
        }

        prev_end = Some(end);
    }

    if summary.is_empty() {
        EMPTY.to_string()
    } else {
        summary
    }
}

/// `H:MM [value]` for each point, in input order.
pub fn summarize_points<Tz>(series: &[PointEvent], tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut summary = String::new();

    for point in series {
        if summary.len() > POINT_SUMMARY_LIMIT {
            break;
        }
        if !summary.is_empty() {
            summary.push_str(SEPARATOR);
        }
        summary.push_str(&format!("{} [{}]", clock(point.time, tz), point.value));
    }

    if summary.is_empty() {
        EMPTY.to_string()
    } else {
        summary
    }
}

pub fn sum_values(series: &[PointEvent]) -> f64 {
    series.iter().map(|p| p.value).sum()
}

impl DerivedFields {
    pub fn compute<Tz>(raw: &RawDayReport, tz: &Tz) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Self {
            deep_sleep_time: summarize_intervals(&raw.sleep_data, SleepStatus::Deep, tz),
            light_sleep_time: summarize_intervals(&raw.sleep_data, SleepStatus::Light, tz),
            rem_time: summarize_intervals(&raw.sleep_data, SleepStatus::Rem, tz),
            awake_time: summarize_intervals(&raw.sleep_data, SleepStatus::Awake, tz),
            revolve_time: summarize_points(&raw.body_revolve, tz),
            move_time: summarize_points(&raw.body_move, tz),
            vibrate_time: summarize_points(&raw.snore, tz),
            snore_count_time: summarize_points(&raw.snore_count, tz),
            vibrate_count: sum_values(&raw.snore),
            snore_count_total: sum_values(&raw.snore_count),
        }
    }
}

pub fn build_report<Tz>(
    day: NaiveDate,
    raw: RawDayReport,
    tz: &Tz,
    fetched_at: DateTime<Utc>,
) -> DayReport
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let derived = DerivedFields::compute(&raw, tz);
    DayReport {
        day,
        raw,
        derived,
        fetched_at,
    }
}

/// Fetches one day's sleep data and shapes it into a [`DayReport`].
pub struct ReportClient {
    transport: Arc<dyn Transport>,
    identity: DeviceIdentity,
    timezone: Option<FixedOffset>,
}

impl ReportClient {
    pub fn new(transport: Arc<dyn Transport>, identity: DeviceIdentity) -> Self {
        Self {
            transport,
            identity,
            timezone: None,
        }
    }

    /// Format clock times in `tz` instead of the system's local time zone.
    pub fn with_timezone(mut self, tz: FixedOffset) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub async fn fetch_day(&self, token: &str, day: NaiveDate) -> Result<DayReport> {
        let target_day = day.format("%Y-%m-%d").to_string();
        debug!("Fetching report for {}", target_day);

        let body = json!({
            "cname": self.identity.cname(),
            "tmsp": request_timestamp(Utc::now()),
            "day": target_day,
            "did": self.identity.did(),
            "uid": self.identity.uid(),
            "timezone": BACKEND_TIMEZONE,
        });

        let response = self
            .transport
            .post_json(GET_DAY_ENDPOINT, &[("token", token)], &body)
            .await?;

        let code = response_code(GET_DAY_ENDPOINT, &response)?;
        if code.parse::<i64>().ok() != Some(1000) {
            debug!("Report request rejected with code {}", code);
            return Err(PillowError::unauthorized(GET_DAY_ENDPOINT, code));
        }

        let data = response_data(GET_DAY_ENDPOINT, &response)?;
        let raw: RawDayReport = serde_json::from_value(data.clone()).map_err(|e| {
            PillowError::malformed(GET_DAY_ENDPOINT, format!("Failed to parse day report: {}", e))
        })?;

        debug!(
            "Report for {}: {} sleep intervals, {} snore samples",
            target_day,
            raw.sleep_data.len(),
            raw.snore.len()
        );

        let report = match &self.timezone {
            Some(tz) => build_report(day, raw, tz, Utc::now()),
            None => build_report(day, raw, &Local, Utc::now()),
        };
        Ok(report)
    }

    pub async fn fetch_last_night_report(&self, token: &str) -> Result<DayReport> {
        let yesterday = Local::now().date_naive() - Duration::days(1);
        self.fetch_day(token, yesterday).await
    }
}
