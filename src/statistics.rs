//! Checkpointed import of hourly buckets into a cumulative statistic series.
//!
//! The running total is always re-derived from the store at the start of an
//! import. Nothing here caches sums between calls, so a restarted process
//! resumes from the last persisted point.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::readings::{
    CumulativeStatisticPoint, HourlyBucket, MeterInfo, MeterType, DAY_MS, HOUR_MS,
};

pub const STATISTIC_SOURCE: &str = "meterstat";
pub const STATISTIC_UNIT: &str = "kWh";
pub const CHECKPOINT_LOOKBACK_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("import task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticMetadata {
    pub statistic_id: String,
    pub source: String,
    pub name: String,
    pub unit_of_measurement: String,
    pub has_mean: bool,
    pub has_sum: bool,
}

impl StatisticMetadata {
    pub fn for_meter(meter: &MeterInfo, statistic_id: impl Into<String>) -> Self {
        Self {
            statistic_id: statistic_id.into(),
            source: STATISTIC_SOURCE.to_string(),
            name: format!("{} consumption {}", meter.meter_type.label(), meter.serial),
            unit_of_measurement: STATISTIC_UNIT.to_string(),
            has_mean: false,
            has_sum: true,
        }
    }
}

/// Persisted hourly statistics, keyed by a stable statistic identity.
pub trait StatisticsStore {
    /// Points with `start_ts_ms_utc` in `[start, end_exclusive)`, ascending.
    fn statistics_during_period(
        &self,
        start_ts_ms_utc: i64,
        end_ts_ms_utc_exclusive: i64,
        statistic_id: &str,
    ) -> Result<Vec<CumulativeStatisticPoint>, PersistenceError>;

    /// Writes all points in one batch and returns how many were stored.
    fn import_statistics(
        &mut self,
        metadata: &StatisticMetadata,
        points: &[CumulativeStatisticPoint],
    ) -> Result<usize, PersistenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub written: usize,
    pub skipped_existing: usize,
    pub checkpoint_sum: f64,
    pub final_sum: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatisticIdError {
    #[error(
        "statistic id override {override_id:?} matches {count} electricity meters; \
         keeping derived ids"
    )]
    AmbiguousOverride { override_id: String, count: usize },
}

/// Derived identity `meterstat_<serial>_<type>_history` unless an override applies.
///
/// The override only targets electricity meters. Callers pass it through
/// [`resolve_override`] first so it never lands on more than one meter.
pub fn statistic_id_for(meter: &MeterInfo, override_id: Option<&str>) -> String {
    match override_id {
        Some(id) if meter.meter_type == MeterType::Electricity && !id.trim().is_empty() => {
            id.trim().to_string()
        }
        _ => format!(
            "{STATISTIC_SOURCE}_{}_{}_history",
            sanitize_serial(&meter.serial),
            meter.meter_type.as_str()
        ),
    }
}

/// The override to use for this set of meters.
///
/// A non-blank override is kept only when exactly one electricity meter is
/// present. With several, each meter keeps its derived identity and the
/// conflict is returned as an error for the caller to report.
pub fn resolve_override<'a>(
    meters: &[MeterInfo],
    override_id: Option<&'a str>,
) -> Result<Option<&'a str>, StatisticIdError> {
    let Some(id) = override_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(None);
    };

    let count = meters
        .iter()
        .filter(|meter| meter.meter_type == MeterType::Electricity)
        .count();
    if count > 1 {
        return Err(StatisticIdError::AmbiguousOverride {
            override_id: id.to_string(),
            count,
        });
    }
    Ok(Some(id))
}

fn sanitize_serial(serial: &str) -> String {
    serial
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Running total carried into the hour starting at `before_ts_ms_utc`.
pub fn resolve_checkpoint<S: StatisticsStore + ?Sized>(
    store: &S,
    statistic_id: &str,
    before_ts_ms_utc: i64,
) -> Result<f64, PersistenceError> {
    let lookback_start = before_ts_ms_utc - CHECKPOINT_LOOKBACK_DAYS * DAY_MS;
    let points = store.statistics_during_period(lookback_start, before_ts_ms_utc, statistic_id)?;
    Ok(points
        .iter()
        .filter(|point| point.start_ts_ms_utc < before_ts_ms_utc)
        .max_by_key(|point| point.start_ts_ms_utc)
        .map(|point| point.sum)
        .unwrap_or(0.0))
}

/// Appends the hours missing from the store, continuing the persisted running total.
///
/// Hours that already exist are not rewritten, but their bucket value still
/// advances the running total so later hours stay consistent. An existing
/// hour whose stored sum disagrees with the recomputed one is left as is.
pub fn import_cumulative<S: StatisticsStore + ?Sized>(
    store: &mut S,
    buckets: &[HourlyBucket],
    metadata: &StatisticMetadata,
) -> Result<ImportReport, PersistenceError> {
    let (Some(first), Some(last)) = (buckets.first(), buckets.last()) else {
        return Ok(ImportReport {
            written: 0,
            skipped_existing: 0,
            checkpoint_sum: 0.0,
            final_sum: 0.0,
        });
    };
    let statistic_id = metadata.statistic_id.as_str();

    let checkpoint_sum = resolve_checkpoint(store, statistic_id, first.hour_start_ts_ms_utc)?;
    let existing_hours: HashSet<i64> = store
        .statistics_during_period(
            first.hour_start_ts_ms_utc,
            last.hour_start_ts_ms_utc + HOUR_MS,
            statistic_id,
        )?
        .into_iter()
        .map(|point| point.start_ts_ms_utc)
        .collect();

    let (points, final_sum) = fold_new_points(checkpoint_sum, buckets, &existing_hours);
    let skipped_existing = buckets.len() - points.len();

    let written = if points.is_empty() {
        0
    } else {
        store.import_statistics(metadata, &points)?
    };

    if skipped_existing > 0 {
        debug!(
            component = "statistics",
            event = "statistics.import.skipped_existing",
            statistic_id,
            skipped_existing
        );
    }

    info!(
        component = "statistics",
        event = "statistics.import.finish",
        statistic_id,
        buckets = buckets.len(),
        written,
        skipped_existing,
        checkpoint_sum,
        final_sum
    );

    Ok(ImportReport {
        written,
        skipped_existing,
        checkpoint_sum,
        final_sum,
    })
}

fn fold_new_points(
    checkpoint_sum: f64,
    buckets: &[HourlyBucket],
    existing_hours: &HashSet<i64>,
) -> (Vec<CumulativeStatisticPoint>, f64) {
    let mut running_total = checkpoint_sum;
    let mut points = Vec::with_capacity(buckets.len());

    for bucket in buckets {
        running_total += bucket.value;
        if existing_hours.contains(&bucket.hour_start_ts_ms_utc) {
            continue;
        }
        points.push(CumulativeStatisticPoint {
            start_ts_ms_utc: bucket.hour_start_ts_ms_utc,
            state: running_total,
            sum: running_total,
        });
    }

    (points, running_total)
}
