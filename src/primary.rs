//! Paginated interval retrieval from the primary consumption API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::readings::{
    parse_rfc3339_ms, FetchWindow, IntervalReading, MeterInfo, MeterType, ReadingSource,
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed for {operation}: {message}")]
    Transport { operation: String, message: String },
    #[error("{operation} returned status {status}: {message}")]
    Status {
        operation: String,
        status: u16,
        message: String,
    },
    #[error("{operation} returned GraphQL error: {message}")]
    Graphql { operation: String, message: String },
    #[error("malformed consumption page: {0}")]
    MalformedPage(String),
    #[error("pagination cursor did not advance past {cursor}")]
    CursorStalled { cursor: String },
    #[error("session is not authenticated")]
    NotAuthenticated,
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Status { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest<'a> {
    pub account_number: &'a str,
    pub meter_id: &'a str,
    pub meter_type: MeterType,
    pub window_start_ts_ms_utc: i64,
    pub cursor: Option<&'a str>,
}

/// One consumption node as delivered by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawConsumptionRecord {
    #[serde(rename = "startAt")]
    pub start_at: String,
    #[serde(rename = "endAt")]
    pub end_at: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsumptionPage {
    pub records: Vec<RawConsumptionRecord>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

#[async_trait]
pub trait ConsumptionPageSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<ConsumptionPage, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchConfig {
    pub max_page_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_page_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryFetch {
    pub readings: Vec<IntervalReading>,
    pub pages: u32,
    pub dropped_records: u64,
}

/// Pages through the meter's consumption until the source runs dry or a
/// reading starts after `window.end`.
///
/// The server only filters on the window start, so the end is enforced here.
pub async fn fetch_interval_readings<S: ConsumptionPageSource + ?Sized>(
    source: &S,
    meter: &MeterInfo,
    window: FetchWindow,
    cfg: &FetchConfig,
) -> Result<PrimaryFetch, FetchError> {
    let mut cursor: Option<String> = None;
    let mut readings = Vec::new();
    let mut pages = 0u32;
    let mut dropped_records = 0u64;

    loop {
        pages += 1;
        let request = PageRequest {
            account_number: &meter.account_number,
            meter_id: &meter.meter_id,
            meter_type: meter.meter_type,
            window_start_ts_ms_utc: window.start_ts_ms_utc,
            cursor: cursor.as_deref(),
        };
        let page = fetch_page_with_retry(source, &request, cfg).await?;

        let mut past_window_end = false;
        for record in &page.records {
            let Some(reading) = parse_record(record)? else {
                dropped_records += 1;
                continue;
            };
            if reading.start_ts_ms_utc > window.end_ts_ms_utc {
                past_window_end = true;
                break;
            }
            if reading.start_ts_ms_utc >= window.start_ts_ms_utc {
                readings.push(reading);
            }
        }

        debug!(
            component = "primary_fetch",
            event = "primary.fetch.page",
            meter_id = %meter.meter_id,
            page = pages,
            records = page.records.len(),
            has_next_page = page.has_next_page
        );

        if past_window_end || !page.has_next_page {
            break;
        }

        match page.end_cursor {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                return Err(FetchError::CursorStalled { cursor: next });
            }
            Some(next) => cursor = Some(next),
            None => {
                return Err(FetchError::MalformedPage(
                    "hasNextPage set without an endCursor".to_string(),
                ));
            }
        }
    }

    readings.sort_by_key(|reading| reading.start_ts_ms_utc);

    if dropped_records > 0 {
        warn!(
            component = "primary_fetch",
            event = "primary.fetch.records_dropped",
            meter_id = %meter.meter_id,
            dropped_records
        );
    }

    info!(
        component = "primary_fetch",
        event = "primary.fetch.finish",
        account_number = %meter.account_number,
        meter_id = %meter.meter_id,
        meter_type = meter.meter_type.as_str(),
        window_start_ts_ms_utc = window.start_ts_ms_utc,
        window_end_ts_ms_utc = window.end_ts_ms_utc,
        pages,
        readings = readings.len()
    );

    Ok(PrimaryFetch {
        readings,
        pages,
        dropped_records,
    })
}

async fn fetch_page_with_retry<S: ConsumptionPageSource + ?Sized>(
    source: &S,
    request: &PageRequest<'_>,
    cfg: &FetchConfig,
) -> Result<ConsumptionPage, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        match source.fetch_page(request).await {
            Ok(page) => return Ok(page),
            Err(err) if attempt >= cfg.max_page_retries || !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "primary_fetch",
                    event = "primary.fetch.page_retry",
                    meter_id = request.meter_id,
                    attempt,
                    sleep_ms,
                    error = %err
                );
                tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            }
        }
    }
}

/// `Ok(None)` marks a record that is well-formed but unusable (negative or non-finite value).
fn parse_record(record: &RawConsumptionRecord) -> Result<Option<IntervalReading>, FetchError> {
    let start_ts_ms_utc = parse_rfc3339_ms(&record.start_at).ok_or_else(|| {
        FetchError::MalformedPage(format!("invalid startAt '{}'", record.start_at))
    })?;
    let end_ts_ms_utc = parse_rfc3339_ms(&record.end_at)
        .ok_or_else(|| FetchError::MalformedPage(format!("invalid endAt '{}'", record.end_at)))?;
    if end_ts_ms_utc <= start_ts_ms_utc {
        return Err(FetchError::MalformedPage(format!(
            "endAt '{}' is not after startAt '{}'",
            record.end_at, record.start_at
        )));
    }

    let value = json_f64(&record.value).ok_or_else(|| {
        FetchError::MalformedPage(format!("invalid value {}", record.value))
    })?;
    if !value.is_finite() || value < 0.0 {
        return Ok(None);
    }

    Ok(Some(IntervalReading {
        start_ts_ms_utc,
        end_ts_ms_utc,
        value,
        source: ReadingSource::Primary,
    }))
}

fn json_f64(value: &serde_json::Value) -> Option<f64> {
    if let Some(v) = value.as_f64() {
        return Some(v);
    }
    value.as_str().and_then(|text| text.trim().parse().ok())
}
