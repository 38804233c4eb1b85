//! Hour-aligned aggregation of interval readings.

use crate::readings::{floor_to_hour_ms, HourlyBucket, MeterSeries};

/// Buckets every reading by `floor(start, 1h)` in UTC.
///
/// Readings are summed in ascending start order so identical input always
/// produces bit-identical bucket values.
pub fn aggregate_hourly(series: &MeterSeries) -> Vec<HourlyBucket> {
    let mut ordered: Vec<_> = series.readings.iter().collect();
    if !ordered
        .windows(2)
        .all(|pair| pair[0].start_ts_ms_utc <= pair[1].start_ts_ms_utc)
    {
        ordered.sort_by_key(|reading| reading.start_ts_ms_utc);
    }

    let mut buckets: Vec<HourlyBucket> = Vec::new();
    for reading in ordered {
        let hour_start_ts_ms_utc = floor_to_hour_ms(reading.start_ts_ms_utc);
        match buckets.last_mut() {
            Some(bucket) if bucket.hour_start_ts_ms_utc == hour_start_ts_ms_utc => {
                bucket.value += reading.value;
            }
            _ => buckets.push(HourlyBucket {
                hour_start_ts_ms_utc,
                value: reading.value,
            }),
        }
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::{
        IntervalReading, MeterKey, MeterType, ReadingSource, HALF_HOUR_MS, HOUR_MS,
    };

    const T10: i64 = 1_735_725_600_000; // 2025-01-01T10:00:00Z

    fn series(readings: Vec<IntervalReading>) -> MeterSeries {
        MeterSeries {
            key: MeterKey {
                account_number: "A-1".to_string(),
                meter_id: "m-1".to_string(),
                meter_type: MeterType::Gas,
            },
            readings,
        }
    }

    fn reading(start: i64, value: f64) -> IntervalReading {
        IntervalReading::half_hour(start, value, ReadingSource::Primary)
    }

    #[test]
    fn four_half_hours_become_two_buckets() {
        let s = series(vec![
            reading(T10, 1.0),
            reading(T10 + HALF_HOUR_MS, 1.0),
            reading(T10 + HOUR_MS, 1.0),
            reading(T10 + HOUR_MS + HALF_HOUR_MS, 1.0),
        ]);

        let buckets = aggregate_hourly(&s);
        assert_eq!(
            buckets,
            vec![
                HourlyBucket {
                    hour_start_ts_ms_utc: T10,
                    value: 2.0
                },
                HourlyBucket {
                    hour_start_ts_ms_utc: T10 + HOUR_MS,
                    value: 2.0
                },
            ]
        );
    }

    #[test]
    fn irregular_starts_land_in_their_floor_hour_and_sum_is_preserved() {
        let s = series(vec![
            reading(T10 + 5 * 60_000, 0.125),
            reading(T10 + 50 * 60_000, 0.25),
            reading(T10 + 3 * HOUR_MS, 0.5),
        ]);

        let buckets = aggregate_hourly(&s);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].hour_start_ts_ms_utc, T10);
        assert_eq!(buckets[1].hour_start_ts_ms_utc, T10 + 3 * HOUR_MS);

        let bucket_total: f64 = buckets.iter().map(|b| b.value).sum();
        assert_eq!(bucket_total, s.total());
    }

    #[test]
    fn empty_series_yields_no_buckets() {
        assert!(aggregate_hourly(&series(Vec::new())).is_empty());
    }
}
