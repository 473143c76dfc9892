//! Sensors and the refresh button shown for a pillow.
//!
//! Every sensor is a variant of [`SensorKind`]; its value is a pure function
//! of the current [`DayReport`].

use chrono::{DateTime, Local, Utc};
use std::fmt;

use crate::auth::DeviceIdentity;
use crate::coordinator::{Coordinator, PollOutcome};
use crate::data::{DayReport, SleepStatus};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Measurement,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub unit: Option<&'static str>,
    pub state_class: Option<StateClass>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Number(f64),
    Text(String),
    Time(DateTime<Utc>),
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Number(n) => write!(f, "{}", n),
            SensorValue::Text(s) => f.write_str(s),
            SensorValue::Time(t) => write!(f, "{}", t.with_timezone(&Local).format("%Y-%m-%d %H:%M")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    SleepScore,
    GoToBedTime,
    WakeUpTime,
    AwakePercent,
    DeepPercent,
    LightPercent,
    RemPercent,
    HeartBeatAvg,
    BreathRateAvg,
    SleepDuration,
    DeepSleepTime,
    LightSleepTime,
    RemTime,
    AwakeTime,
    RevolveTime,
    MoveTime,
    VibrateCount,
    SnoreCount,
    VibrateTime,
    SnoreCountTime,
}

const fn sensor(
    key: &'static str,
    name: &'static str,
    icon: &'static str,
    unit: Option<&'static str>,
    state_class: Option<StateClass>,
) -> SensorDescription {
    SensorDescription {
        key,
        name,
        icon,
        unit,
        state_class,
    }
}

const PERCENT: Option<&str> = Some("%");
const BPM: Option<&str> = Some("BPM");
const MEASUREMENT: Option<StateClass> = Some(StateClass::Measurement);
const TOTAL: Option<StateClass> = Some(StateClass::Total);

impl SensorKind {
    pub const ALL: [SensorKind; 20] = [
        SensorKind::SleepScore,
        SensorKind::GoToBedTime,
        SensorKind::WakeUpTime,
        SensorKind::AwakePercent,
        SensorKind::DeepPercent,
        SensorKind::LightPercent,
        SensorKind::RemPercent,
        SensorKind::HeartBeatAvg,
        SensorKind::BreathRateAvg,
        SensorKind::SleepDuration,
        SensorKind::DeepSleepTime,
        SensorKind::LightSleepTime,
        SensorKind::RemTime,
        SensorKind::AwakeTime,
        SensorKind::RevolveTime,
        SensorKind::MoveTime,
        SensorKind::VibrateCount,
        SensorKind::SnoreCount,
        SensorKind::VibrateTime,
        SensorKind::SnoreCountTime,
    ];

    pub const fn description(self) -> SensorDescription {
        match self {
            SensorKind::SleepScore => sensor("score", "Sleep score", "mdi:star", PERCENT, MEASUREMENT),
            SensorKind::GoToBedTime => sensor("go_to_bed_time", "Go to bed time", "mdi:bed-clock", None, None),
            SensorKind::WakeUpTime => sensor("wake_up_time", "Wake up time", "mdi:bed-clock", None, None),
            SensorKind::AwakePercent => sensor("awake_percent", "Awake", "mdi:bed", PERCENT, MEASUREMENT),
            SensorKind::DeepPercent => sensor("deep_sleep_percent", "Deep sleep", "mdi:bed", PERCENT, MEASUREMENT),
            SensorKind::LightPercent => sensor("light_sleep_percent", "Light sleep", "mdi:bed", PERCENT, MEASUREMENT),
            SensorKind::RemPercent => sensor("rem_percent", "REM", "mdi:bed", PERCENT, MEASUREMENT),
            SensorKind::HeartBeatAvg => sensor("heart_beat_avg", "Heart beat average", "mdi:heart-pulse", BPM, MEASUREMENT),
            SensorKind::BreathRateAvg => sensor("breath_rate_avg", "Respiratory rate average", "mdi:lungs", BPM, MEASUREMENT),
            SensorKind::SleepDuration => sensor("sleep_duration_hr", "Sleep duration", "mdi:bed-clock", Some("h"), MEASUREMENT),
            SensorKind::DeepSleepTime => sensor("sleep_deep_time", "Deep sleep time", "mdi:bed-clock", None, None),
            SensorKind::LightSleepTime => sensor("sleep_light_time", "Light sleep time", "mdi:bed-clock", None, None),
            SensorKind::RemTime => sensor("sleep_rem_time", "REM time", "mdi:bed-clock", None, None),
            SensorKind::AwakeTime => sensor("sleep_awake_time", "Awake time", "mdi:bed-clock", None, None),
            SensorKind::RevolveTime => sensor("sleep_revolve_time", "Revolve time", "mdi:reload", None, None),
            SensorKind::MoveTime => sensor("sleep_move_time", "Move time", "mdi:car-brake-worn-linings", None, None),
            SensorKind::VibrateCount => sensor("sleep_vibrate_count", "Vibrate count", "mdi:vibrate", None, TOTAL),
            SensorKind::SnoreCount => sensor("sleep_snore_count", "Snore count", "mdi:sleep", None, TOTAL),
            SensorKind::VibrateTime => sensor("sleep_vibrate_time", "Vibrate time", "mdi:vibrate", None, None),
            SensorKind::SnoreCountTime => sensor("sleep_snore_count_time", "Snore time", "mdi:sleep", None, None),
        }
    }

    /// True for sensors whose value is a `" | "`-joined timeline.
    pub fn is_timeline(self) -> bool {
        matches!(
            self,
            SensorKind::DeepSleepTime
                | SensorKind::LightSleepTime
                | SensorKind::RemTime
                | SensorKind::AwakeTime
                | SensorKind::RevolveTime
                | SensorKind::MoveTime
                | SensorKind::VibrateTime
                | SensorKind::SnoreCountTime
        )
    }

    pub fn unique_id(self, identity: &DeviceIdentity) -> String {
        format!("{}_{}", identity.did(), self.description().key)
    }

    pub fn value(self, report: &DayReport) -> Option<SensorValue> {
        let raw = &report.raw;
        let derived = &report.derived;
        let text = |s: &str| Some(SensorValue::Text(s.to_string()));

        match self {
            SensorKind::SleepScore => raw.score.map(SensorValue::Number),
            SensorKind::GoToBedTime => raw.go_to_bed_time.and_then(time_value),
            SensorKind::WakeUpTime => raw.wake_up_time.and_then(time_value),
            SensorKind::AwakePercent => report.stage_share(SleepStatus::Awake).map(SensorValue::Number),
            SensorKind::DeepPercent => report.stage_share(SleepStatus::Deep).map(SensorValue::Number),
            SensorKind::LightPercent => report.stage_share(SleepStatus::Light).map(SensorValue::Number),
            SensorKind::RemPercent => report.stage_share(SleepStatus::Rem).map(SensorValue::Number),
            SensorKind::HeartBeatAvg => raw.heart_beat_avg.map(SensorValue::Number),
            SensorKind::BreathRateAvg => raw.breath_avg.map(SensorValue::Number),
            SensorKind::SleepDuration => match (raw.go_to_bed_time, raw.wake_up_time) {
                (Some(bed), Some(wake)) => {
                    let hours = (wake - bed) as f64 / 3600.0;
                    Some(SensorValue::Number((hours * 10.0).round() / 10.0))
                }
                _ => None,
            },
            SensorKind::DeepSleepTime => text(&derived.deep_sleep_time),
            SensorKind::LightSleepTime => text(&derived.light_sleep_time),
            SensorKind::RemTime => text(&derived.rem_time),
            SensorKind::AwakeTime => text(&derived.awake_time),
            SensorKind::RevolveTime => text(&derived.revolve_time),
            SensorKind::MoveTime => text(&derived.move_time),
            SensorKind::VibrateCount => Some(SensorValue::Number(derived.vibrate_count)),
            SensorKind::SnoreCount => Some(SensorValue::Number(derived.snore_count_total)),
            SensorKind::VibrateTime => text(&derived.vibrate_time),
            SensorKind::SnoreCountTime => text(&derived.snore_count_time),
        }
    }
}

fn time_value(timestamp: i64) -> Option<SensorValue> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(SensorValue::Time)
}

/// A sensor bound to one pillow. Unavailable until a report exists.
pub struct Sensor<'a> {
    pub kind: SensorKind,
    coordinator: &'a Coordinator,
}

impl<'a> Sensor<'a> {
    pub fn all(coordinator: &'a Coordinator) -> Vec<Sensor<'a>> {
        SensorKind::ALL
            .iter()
            .map(|&kind| Sensor { kind, coordinator })
            .collect()
    }

    pub fn unique_id(&self) -> String {
        self.kind.unique_id(self.coordinator.identity())
    }

    pub fn available(&self) -> bool {
        self.coordinator.report().is_some()
    }

    pub fn native_value(&self) -> Option<SensorValue> {
        self.coordinator.report().and_then(|r| self.kind.value(&r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonKind {
    GetLastNightReport,
}

impl ButtonKind {
    pub fn key(self) -> &'static str {
        match self {
            ButtonKind::GetLastNightReport => "get_last_night_report",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ButtonKind::GetLastNightReport => "Get last night report",
        }
    }

    pub fn unique_id(self, identity: &DeviceIdentity) -> String {
        format!("{}_{}", identity.did(), self.key())
    }

    pub async fn press(self, coordinator: &Coordinator) -> Result<PollOutcome> {
        match self {
            ButtonKind::GetLastNightReport => coordinator.refresh().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identifier: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub name: &'static str,
    pub title: String,
}

impl DeviceInfo {
    pub fn for_identity(identity: &DeviceIdentity) -> Self {
        let did = identity.did();
        Self {
            identifier: did.to_string(),
            manufacturer: "YUDEE",
            model: "Dual-Mode Sleep Sensor",
            name: "Sleep Sensor",
            title: format!("Smart Pillow - {}", did.get(4..).unwrap_or(did)),
        }
    }
}
