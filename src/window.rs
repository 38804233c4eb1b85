//! Fetch window planning: cold-start backfill versus warm catch-up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::readings::{floor_to_hour_ms, FetchWindow, DAY_MS};

pub const DEFAULT_BACKFILL_DAYS: u32 = 90;
pub const MAX_BACKFILL_DAYS: u32 = 730;
pub const WARM_LOOKBACK_DAYS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillDays(u32);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackfillDaysError {
    #[error("backfill_days must be between 1 and {max}, got {value}")]
    OutOfRange { value: i64, max: u32 },
}

impl BackfillDays {
    pub fn new(value: i64) -> Result<Self, BackfillDaysError> {
        if value < 1 || value > i64::from(MAX_BACKFILL_DAYS) {
            return Err(BackfillDaysError::OutOfRange {
                value,
                max: MAX_BACKFILL_DAYS,
            });
        }
        Ok(Self(value as u32))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for BackfillDays {
    fn default() -> Self {
        Self(DEFAULT_BACKFILL_DAYS)
    }
}

/// Window ending at `now`. The start is floored to the UTC hour so the first
/// hourly bucket always covers a whole hour.
pub fn plan_fetch_window(
    now_ts_ms_utc: i64,
    has_prior_data: bool,
    backfill: BackfillDays,
) -> FetchWindow {
    let lookback_days = if has_prior_data {
        WARM_LOOKBACK_DAYS
    } else {
        backfill.get()
    };

    FetchWindow {
        start_ts_ms_utc: floor_to_hour_ms(now_ts_ms_utc - i64::from(lookback_days) * DAY_MS),
        end_ts_ms_utc: now_ts_ms_utc,
    }
}

/// Start of the range in which a persisted point counts as "prior data".
pub fn warm_lookback_start(now_ts_ms_utc: i64) -> i64 {
    floor_to_hour_ms(now_ts_ms_utc - i64::from(WARM_LOOKBACK_DAYS) * DAY_MS)
}
