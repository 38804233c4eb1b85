//! Per-meter "current value" readout and its HTTP routes.

use std::sync::{Arc, RwLock};

use axum::{
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use chrono_tz::Europe::London;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::readings::{format_rfc3339_ms, MeterInfo, MeterSeries, MeterType};

pub const READOUT_HEADERS: [&str; 7] = [
    "Account",
    "Meter",
    "Type",
    "Statistic",
    "Today (kWh)",
    "Last reading",
    "Status",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadoutSnapshot {
    pub generated_at: Option<String>,
    pub meters: Vec<MeterReadout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReadout {
    pub account_number: String,
    pub meter_id: String,
    pub meter_serial: String,
    pub meter_type: MeterType,
    pub statistic_id: String,
    pub current_value: Option<f64>,
    pub last_reading_time: Option<String>,
    pub stale: bool,
}

impl MeterReadout {
    pub fn from_series(
        meter: &MeterInfo,
        statistic_id: impl Into<String>,
        series: &MeterSeries,
        stale: bool,
    ) -> Self {
        Self {
            account_number: meter.account_number.clone(),
            meter_id: meter.meter_id.clone(),
            meter_serial: meter.serial.clone(),
            meter_type: meter.meter_type,
            statistic_id: statistic_id.into(),
            current_value: latest_day_total(series),
            last_reading_time: series
                .last_reading()
                .and_then(|reading| format_rfc3339_ms(reading.end_ts_ms_utc)),
            stale,
        }
    }

    pub fn to_cell_text_values(&self) -> Vec<String> {
        vec![
            self.account_number.clone(),
            self.meter_serial.clone(),
            self.meter_type.label().to_string(),
            self.statistic_id.clone(),
            self.current_value
                .map(|value| format!("{value:.3}"))
                .unwrap_or_else(|| "-".to_string()),
            self.last_reading_time
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            if self.stale { "stale" } else { "fresh" }.to_string(),
        ]
    }
}

/// Total of the Europe/London calendar day holding the latest reading,
/// rounded to 3 decimals.
pub fn latest_day_total(series: &MeterSeries) -> Option<f64> {
    let last = series.last_reading()?;
    let day = london_day(last.start_ts_ms_utc)?;
    let total: f64 = series
        .readings
        .iter()
        .filter(|reading| london_day(reading.start_ts_ms_utc) == Some(day))
        .map(|reading| reading.value)
        .sum();
    Some((total * 1_000.0).round() / 1_000.0)
}

fn london_day(ts_ms_utc: i64) -> Option<chrono::NaiveDate> {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.with_timezone(&London).date_naive())
}

pub trait ReadoutSource: Send + Sync + 'static {
    fn snapshot(&self) -> ReadoutSnapshot;
}

/// Latest published snapshot, shared between the refresh loop and HTTP.
#[derive(Clone, Default)]
pub struct ReadoutBoard {
    inner: Arc<RwLock<ReadoutSnapshot>>,
}

impl ReadoutBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: ReadoutSnapshot) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = snapshot;
    }
}

impl ReadoutSource for ReadoutBoard {
    fn snapshot(&self) -> ReadoutSnapshot {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub fn readout_router(source: Arc<dyn ReadoutSource>) -> Router {
    Router::new()
        .route("/readout", get(get_readout_html))
        .route("/readout/snapshot", get(get_readout_snapshot))
        .with_state(ReadoutAppState { source })
}

pub fn render_readout_html(snapshot: &ReadoutSnapshot) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Meter readout</title>\n");
    out.push_str("<style>body{margin:0;font-family:\"Avenir Next\",\"Segoe UI\",sans-serif;background:#f4f6f2;color:#1d2522}.shell{max-width:1100px;margin:0 auto;padding:24px 18px}h1{margin:0 0 8px;font-size:1.5rem}.meta{color:#5b6660;font-size:.9rem;margin-bottom:14px}table{width:100%;border-collapse:collapse;background:#fff;border:1px solid #d3dad5}th{background:#23443a;color:#f1f6f3;text-align:left;font-size:.8rem;text-transform:uppercase;padding:9px 10px}td{padding:8px 10px;border-top:1px solid #e1e6e2;font-size:.88rem;white-space:nowrap}tr.stale td{color:#8a8f8c;background:#fbf7ea}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<h1>Meter readout</h1>");
    out.push_str(&format!(
        "<div class=\"meta\"><span>Meters: {}</span> <span>Generated: {}</span></div>\n",
        snapshot.meters.len(),
        escape_html(snapshot.generated_at.as_deref().unwrap_or("-"))
    ));
    out.push_str("<table id=\"readout-table\"><thead><tr>");
    for header in READOUT_HEADERS {
        out.push_str("<th>");
        out.push_str(&escape_html(header));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody>\n");

    for meter in &snapshot.meters {
        let class = if meter.stale { "stale" } else { "" };
        out.push_str(&format!("<tr class=\"{class}\">"));
        for value in meter.to_cell_text_values() {
            out.push_str("<td>");
            out.push_str(&escape_html(&value));
            out.push_str("</td>");
        }
        out.push_str("</tr>\n");
    }

    out.push_str("</tbody></table></main></body></html>\n");
    out
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct ReadoutAppState {
    source: Arc<dyn ReadoutSource>,
}

async fn get_readout_html(State(state): State<ReadoutAppState>) -> impl IntoResponse {
    let snapshot = state.source.snapshot();
    info!(
        component = "http",
        event = "http.readout.request",
        route = "/readout",
        meters = snapshot.meters.len()
    );
    Html(render_readout_html(&snapshot))
}

async fn get_readout_snapshot(State(state): State<ReadoutAppState>) -> impl IntoResponse {
    let snapshot = state.source.snapshot();
    info!(
        component = "http",
        event = "http.readout.request",
        route = "/readout/snapshot",
        meters = snapshot.meters.len()
    );
    Json(snapshot)
}
