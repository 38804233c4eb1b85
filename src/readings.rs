//! Interval readings, meter identities and the series built from them.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const HALF_HOUR_MS: i64 = 1_800_000;
pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterType {
    Electricity,
    Gas,
}

impl MeterType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Electricity => "electricity",
            Self::Gas => "gas",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Electricity => "Electricity",
            Self::Gas => "Gas",
        }
    }

    /// Only electricity meters are mirrored by the secondary smart-meter source.
    pub fn supports_secondary(self) -> bool {
        matches!(self, Self::Electricity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeterKey {
    pub account_number: String,
    pub meter_id: String,
    pub meter_type: MeterType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterInfo {
    pub account_number: String,
    pub meter_id: String,
    pub meter_point_id: String,
    pub serial: String,
    pub meter_type: MeterType,
}

impl MeterInfo {
    pub fn key(&self) -> MeterKey {
        MeterKey {
            account_number: self.account_number.clone(),
            meter_id: self.meter_id.clone(),
            meter_type: self.meter_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadingSource {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalReading {
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc: i64,
    pub value: f64,
    pub source: ReadingSource,
}

impl IntervalReading {
    pub fn half_hour(start_ts_ms_utc: i64, value: f64, source: ReadingSource) -> Self {
        Self {
            start_ts_ms_utc,
            end_ts_ms_utc: start_ts_ms_utc + HALF_HOUR_MS,
            value,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterSeries {
    pub key: MeterKey,
    pub readings: Vec<IntervalReading>,
}

impl MeterSeries {
    /// Merges both sources and drops readings that extend past the window end.
    pub fn from_sources(
        key: MeterKey,
        primary: Vec<IntervalReading>,
        secondary: Vec<IntervalReading>,
        window: FetchWindow,
    ) -> Self {
        let mut readings = crate::merge::merge_readings(primary, secondary);
        readings.retain(|reading| reading.end_ts_ms_utc <= window.end_ts_ms_utc);
        Self { key, readings }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn last_reading(&self) -> Option<&IntervalReading> {
        self.readings.last()
    }

    pub fn total(&self) -> f64 {
        self.readings.iter().map(|reading| reading.value).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_start_ts_ms_utc: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CumulativeStatisticPoint {
    pub start_ts_ms_utc: i64,
    pub state: f64,
    pub sum: f64,
}

pub fn floor_to_hour_ms(ts_ms_utc: i64) -> i64 {
    ts_ms_utc.div_euclid(HOUR_MS) * HOUR_MS
}

pub fn parse_rfc3339_ms(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

pub fn format_rfc3339_ms(ts_ms_utc: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}
