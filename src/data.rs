use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ── Sleep stages ────────────────────────────────────────

/// Sleep stage as encoded by the backend (`1..=4`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StatusCode", into = "i64")]
pub enum SleepStatus {
    Deep,
    Light,
    Rem,
    Awake,
    /// Any code the backend adds later; never matched by a stage summary.
    Unknown(i64),
}

/// `status` as it appears on the wire: a number or a numeric string.
#[derive(Deserialize)]
#[serde(untagged)]
enum StatusCode {
    Number(i64),
    Text(String),
}

impl TryFrom<StatusCode> for SleepStatus {
    type Error = String;

    fn try_from(code: StatusCode) -> Result<Self, Self::Error> {
        match code {
            StatusCode::Number(n) => Ok(SleepStatus::from(n)),
            StatusCode::Text(text) => text
                .trim()
                .parse::<i64>()
                .map(SleepStatus::from)
                .map_err(|_| format!("invalid sleep status {:?}", text)),
        }
    }
}

impl From<i64> for SleepStatus {
    fn from(code: i64) -> Self {
        match code {
            1 => SleepStatus::Deep,
            2 => SleepStatus::Light,
            3 => SleepStatus::Rem,
            4 => SleepStatus::Awake,
            other => SleepStatus::Unknown(other),
        }
    }
}

impl From<SleepStatus> for i64 {
    fn from(status: SleepStatus) -> Self {
        match status {
            SleepStatus::Deep => 1,
            SleepStatus::Light => 2,
            SleepStatus::Rem => 3,
            SleepStatus::Awake => 4,
            SleepStatus::Unknown(code) => code,
        }
    }
}

// ── Raw series ──────────────────────────────────────────

/// One stage interval; `start`/`end` are Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepEvent {
    pub start: i64,
    pub end: i64,
    pub status: SleepStatus,
}

/// One sample of a point series (revolve, move, snore, snore count).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEvent {
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageShare {
    pub percentage: f64,
}

// ── Day report ──────────────────────────────────────────

/// The `data` object of a `getday` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDayReport {
    pub score: Option<f64>,
    pub go_to_bed_time: Option<i64>,
    pub wake_up_time: Option<i64>,
    pub heart_beat_avg: Option<f64>,
    pub breath_avg: Option<f64>,
    pub deep: Option<StageShare>,
    pub light: Option<StageShare>,
    pub rem: Option<StageShare>,
    pub awake: Option<StageShare>,
    #[serde(deserialize_with = "null_as_empty")]
    pub sleep_data: Vec<SleepEvent>,
    #[serde(deserialize_with = "null_as_empty")]
    pub body_revolve: Vec<PointEvent>,
    #[serde(deserialize_with = "null_as_empty")]
    pub body_move: Vec<PointEvent>,
    #[serde(deserialize_with = "null_as_empty")]
    pub snore: Vec<PointEvent>,
    #[serde(deserialize_with = "null_as_empty")]
    pub snore_count: Vec<PointEvent>,
}

/// Display strings and totals computed from a [`RawDayReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub deep_sleep_time: String,
    pub light_sleep_time: String,
    pub rem_time: String,
    pub awake_time: String,
    pub revolve_time: String,
    pub move_time: String,
    pub vibrate_time: String,
    pub snore_count_time: String,
    pub vibrate_count: f64,
    pub snore_count_total: f64,
}

/// Last night's report as shown on the dashboard.
///
/// Built only by [`crate::report::build_report`], so `derived` always matches `raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayReport {
    pub day: NaiveDate,
    pub raw: RawDayReport,
    pub derived: DerivedFields,
    pub fetched_at: DateTime<Utc>,
}

impl DayReport {
    pub fn stage_share(&self, status: SleepStatus) -> Option<f64> {
        let share = match status {
            SleepStatus::Deep => &self.raw.deep,
            SleepStatus::Light => &self.raw.light,
            SleepStatus::Rem => &self.raw.rem,
            SleepStatus::Awake => &self.raw.awake,
            SleepStatus::Unknown(_) => return None,
        };
        share.as_ref().map(|s| s.percentage)
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
