//! Best-effort secondary interval source.
//!
//! The secondary source only enriches the primary series. Every failure on
//! this path is downgraded to an empty result plus a warning so that the
//! primary pipeline never sees it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::readings::{
    format_rfc3339_ms, IntervalReading, MeterType, ReadingSource, DAY_MS, HALF_HOUR_MS, HOUR_MS,
};

pub const SECONDARY_DEFAULT_LOOKBACK_DAYS: i64 = 2;
pub const SECONDARY_FUTURE_FALLBACK_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum SecondarySourceError {
    #[error("secondary authentication failed: {0}")]
    Auth(String),
    #[error("secondary request {operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
    #[error("secondary request {operation} returned HTTP {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("malformed secondary payload: {0}")]
    Malformed(String),
    #[error("secondary worker failed: {0}")]
    Worker(String),
}

/// One raw secondary sample: interval start in epoch seconds plus its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSecondarySample {
    pub start_epoch_s: i64,
    pub value: Option<f64>,
}

/// Blocking secondary transport. Implementations may block the calling
/// thread; callers go through [`SecondaryWorkerPool`] from async code.
pub trait SecondaryReadingSource: Send + Sync {
    /// Resolves the consumption resource, `None` when the account has none.
    fn consumption_resource_id(&self) -> Result<Option<String>, SecondarySourceError>;

    fn samples(
        &self,
        resource_id: &str,
        from_ts_ms_utc: i64,
        to_ts_ms_utc: i64,
    ) -> Result<Vec<RawSecondarySample>, SecondarySourceError>;
}

/// Start of the secondary request: the interval right after the last
/// primary reading, a short lookback without primary data, and never later
/// than `now` minus the skew fallback.
pub fn secondary_since(last_primary: Option<&IntervalReading>, now_ts_ms_utc: i64) -> i64 {
    let since = match last_primary {
        Some(reading) => reading.start_ts_ms_utc + HALF_HOUR_MS,
        None => now_ts_ms_utc - SECONDARY_DEFAULT_LOOKBACK_DAYS * DAY_MS,
    };

    if since > now_ts_ms_utc {
        let clamped = now_ts_ms_utc - SECONDARY_FUTURE_FALLBACK_HOURS * HOUR_MS;
        warn!(
            component = "secondary",
            event = "secondary.since.clamped",
            requested_since = %format_rfc3339_ms(since).unwrap_or_default(),
            clamped_since = %format_rfc3339_ms(clamped).unwrap_or_default()
        );
        return clamped;
    }
    since
}

pub fn fetch_secondary(
    source: &dyn SecondaryReadingSource,
    since_ts_ms_utc: i64,
    now_ts_ms_utc: i64,
) -> Result<Vec<IntervalReading>, SecondarySourceError> {
    let Some(resource_id) = source.consumption_resource_id()? else {
        debug!(
            component = "secondary",
            event = "secondary.resource.missing"
        );
        return Ok(Vec::new());
    };

    let samples = source.samples(&resource_id, since_ts_ms_utc, now_ts_ms_utc)?;
    Ok(normalize_samples(&samples, since_ts_ms_utc, now_ts_ms_utc))
}

/// Never fails outward: any error becomes an empty series and a warning.
pub fn try_fetch_secondary(
    source: &dyn SecondaryReadingSource,
    since_ts_ms_utc: i64,
    now_ts_ms_utc: i64,
) -> Vec<IntervalReading> {
    match fetch_secondary(source, since_ts_ms_utc, now_ts_ms_utc) {
        Ok(readings) => {
            debug!(
                component = "secondary",
                event = "secondary.fetch.finish",
                readings = readings.len()
            );
            readings
        }
        Err(err) => {
            warn!(
                component = "secondary",
                event = "secondary.fetch.degraded",
                since = %format_rfc3339_ms(since_ts_ms_utc).unwrap_or_default(),
                error = %err
            );
            Vec::new()
        }
    }
}

fn normalize_samples(
    samples: &[RawSecondarySample],
    since_ts_ms_utc: i64,
    now_ts_ms_utc: i64,
) -> Vec<IntervalReading> {
    let mut out: Vec<IntervalReading> = samples
        .iter()
        .filter_map(|sample| {
            let value = sample.value.filter(|v| v.is_finite() && *v >= 0.0)?;
            let start_ts_ms_utc = sample.start_epoch_s.checked_mul(1_000)?;
            (start_ts_ms_utc >= since_ts_ms_utc && start_ts_ms_utc <= now_ts_ms_utc).then(|| {
                IntervalReading::half_hour(start_ts_ms_utc, value, ReadingSource::Secondary)
            })
        })
        .collect();
    out.sort_by_key(|reading| reading.start_ts_ms_utc);
    out.dedup_by_key(|reading| reading.start_ts_ms_utc);
    out
}

/// Bounded pool for blocking secondary fetches.
#[derive(Clone)]
pub struct SecondaryWorkerPool {
    source: Arc<dyn SecondaryReadingSource>,
    permits: Arc<Semaphore>,
}

impl SecondaryWorkerPool {
    pub fn new(source: Arc<dyn SecondaryReadingSource>, workers: usize) -> Self {
        Self {
            source,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn fetch(&self, since_ts_ms_utc: i64, now_ts_ms_utc: i64) -> Vec<IntervalReading> {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                warn!(
                    component = "secondary",
                    event = "secondary.fetch.degraded",
                    error = %SecondarySourceError::Worker(err.to_string())
                );
                return Vec::new();
            }
        };

        let source = Arc::clone(&self.source);
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            try_fetch_secondary(source.as_ref(), since_ts_ms_utc, now_ts_ms_utc)
        })
        .await;

        joined.unwrap_or_else(|err| {
            warn!(
                component = "secondary",
                event = "secondary.fetch.degraded",
                error = %SecondarySourceError::Worker(err.to_string())
            );
            Vec::new()
        })
    }
}

/// Which sources a refresh cycle consults, fixed at startup.
#[derive(Clone)]
pub enum SourcePlan {
    PrimaryOnly,
    WithSecondary(SecondaryWorkerPool),
}

impl SourcePlan {
    pub fn from_source(source: Option<Arc<dyn SecondaryReadingSource>>, workers: usize) -> Self {
        match source {
            Some(source) => Self::WithSecondary(SecondaryWorkerPool::new(source, workers)),
            None => Self::PrimaryOnly,
        }
    }

    pub fn secondary_for(&self, meter_type: MeterType) -> Option<&SecondaryWorkerPool> {
        match self {
            Self::WithSecondary(pool) if meter_type.supports_secondary() => Some(pool),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: i64 = 1_735_725_600_000;

    struct FixedSource {
        resource: Option<&'static str>,
        samples: Vec<RawSecondarySample>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedSource {
        fn with_samples(samples: Vec<RawSecondarySample>) -> Self {
            Self {
                resource: Some("res-1"),
                samples,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl SecondaryReadingSource for FixedSource {
        fn consumption_resource_id(&self) -> Result<Option<String>, SecondarySourceError> {
            Ok(self.resource.map(str::to_string))
        }

        fn samples(
            &self,
            resource_id: &str,
            _from_ts_ms_utc: i64,
            _to_ts_ms_utc: i64,
        ) -> Result<Vec<RawSecondarySample>, SecondarySourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(resource_id, "res-1");
            if self.fail {
                return Err(SecondarySourceError::Transport {
                    operation: "readings",
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.samples.clone())
        }
    }

    fn sample(start_ts_ms_utc: i64, value: f64) -> RawSecondarySample {
        RawSecondarySample {
            start_epoch_s: start_ts_ms_utc / 1_000,
            value: Some(value),
        }
    }

    #[test]
    fn since_follows_last_primary_and_falls_back() {
        let last = IntervalReading::half_hour(NOW - 4 * HOUR_MS, 1.0, ReadingSource::Primary);
        assert_eq!(secondary_since(Some(&last), NOW), NOW - 4 * HOUR_MS + HALF_HOUR_MS);
        assert_eq!(secondary_since(None, NOW), NOW - 2 * DAY_MS);

        let skewed = IntervalReading::half_hour(NOW + HOUR_MS, 1.0, ReadingSource::Primary);
        assert_eq!(secondary_since(Some(&skewed), NOW), NOW - 24 * HOUR_MS);
    }

    #[test]
    fn network_error_degrades_to_empty() {
        let mut source = FixedSource::with_samples(vec![sample(NOW - HOUR_MS, 1.0)]);
        source.fail = true;
        assert!(try_fetch_secondary(&source, NOW - DAY_MS, NOW).is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_resource_is_empty_not_error() {
        let mut source = FixedSource::with_samples(vec![sample(NOW - HOUR_MS, 1.0)]);
        source.resource = None;
        assert!(fetch_secondary(&source, NOW - DAY_MS, NOW).unwrap().is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn samples_are_clipped_sorted_and_tagged() {
        let source = FixedSource::with_samples(vec![
            sample(NOW - HOUR_MS, 0.4),
            sample(NOW - 2 * HOUR_MS, 0.2),
            sample(NOW - 3 * DAY_MS, 9.0),
            sample(NOW - HOUR_MS, 0.5),
            RawSecondarySample {
                start_epoch_s: (NOW - HALF_HOUR_MS) / 1_000,
                value: None,
            },
            sample(NOW - HALF_HOUR_MS * 3, -1.0),
        ]);

        let readings = fetch_secondary(&source, NOW - DAY_MS, NOW).unwrap();
        let starts: Vec<i64> = readings.iter().map(|r| r.start_ts_ms_utc).collect();
        assert_eq!(starts, vec![NOW - 2 * HOUR_MS, NOW - HOUR_MS]);
        assert!(readings
            .iter()
            .all(|r| r.source == ReadingSource::Secondary
                && r.end_ts_ms_utc == r.start_ts_ms_utc + HALF_HOUR_MS));
    }

    #[test]
    fn plan_only_offers_secondary_to_supported_meters() {
        assert!(SourcePlan::PrimaryOnly
            .secondary_for(MeterType::Electricity)
            .is_none());

        let plan = SourcePlan::from_source(Some(Arc::new(FixedSource::with_samples(vec![]))), 2);
        assert!(plan.secondary_for(MeterType::Electricity).is_some());
        assert!(plan.secondary_for(MeterType::Gas).is_none());
    }

    #[derive(Default)]
    struct SlowSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SecondaryReadingSource for SlowSource {
        fn consumption_resource_id(&self) -> Result<Option<String>, SecondarySourceError> {
            Ok(Some("res-1".to_string()))
        }

        fn samples(
            &self,
            _resource_id: &str,
            _from_ts_ms_utc: i64,
            _to_ts_ms_utc: i64,
        ) -> Result<Vec<RawSecondarySample>, SecondarySourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(50));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_pool_caps_concurrent_fetches_at_its_permits() {
        let source = Arc::new(SlowSource::default());
        let pool = SecondaryWorkerPool::new(source.clone(), 2);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let pool = pool.clone();
            tasks.spawn(async move { pool.fetch(NOW - DAY_MS, NOW).await });
        }
        while let Some(joined) = tasks.join_next().await {
            assert!(joined.unwrap().is_empty());
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 6);
        assert_eq!(source.peak.load(Ordering::SeqCst), 2);
        assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn worker_pool_runs_blocking_fetch() {
        let source = Arc::new(FixedSource::with_samples(vec![sample(NOW - HOUR_MS, 0.7)]));
        let pool = SecondaryWorkerPool::new(source.clone(), 1);

        let readings = pool.fetch(NOW - DAY_MS, NOW).await;
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 0.7);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
