//! Blocking Glowmarkt (Bright) client used as the secondary source.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::readings::DAY_MS;
use crate::secondary::{RawSecondarySample, SecondaryReadingSource, SecondarySourceError};

pub const GLOWMARKT_BASE_URL: &str = "https://api.glowmarkt.com/api/v0-1";
/// Public application id of the Bright app.
pub const GLOWMARKT_APPLICATION_ID: &str = "b0f1b774-a586-4f72-9edd-27ead8aa7a8d";
pub const ELECTRICITY_CONSUMPTION_CLASSIFIER: &str = "electricity.consumption";
/// Longest range the readings endpoint accepts at half-hour resolution.
pub const MAX_READINGS_SPAN_DAYS: i64 = 10;

pub struct GlowmarktClient {
    http: reqwest::blocking::Client,
    base_url: String,
    credentials: Credentials,
    token: Mutex<Option<String>>,
}

impl GlowmarktClient {
    pub fn new(credentials: Credentials, timeout_ms: u64) -> Result<Self, SecondarySourceError> {
        Self::with_base_url(credentials, timeout_ms, GLOWMARKT_BASE_URL)
    }

    pub fn with_base_url(
        credentials: Credentials,
        timeout_ms: u64,
        base_url: impl Into<String>,
    ) -> Result<Self, SecondarySourceError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| SecondarySourceError::Transport {
                operation: "client_build",
                message: err.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
        })
    }

    pub fn authenticate(&self) -> Result<String, SecondarySourceError> {
        let url = format!("{}/auth", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("applicationId", GLOWMARKT_APPLICATION_ID)
            .json(&json!({
                "username": self.credentials.username,
                "password": self.credentials.password,
            }))
            .send()
            .map_err(|err| SecondarySourceError::Auth(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SecondarySourceError::Auth(format!(
                "unexpected HTTP status {status}"
            )));
        }

        let body: AuthResponse = response
            .json()
            .map_err(|err| SecondarySourceError::Auth(err.to_string()))?;
        let token = match (body.valid, body.token) {
            (true, Some(token)) if !token.is_empty() => token,
            _ => return Err(SecondarySourceError::Auth("credentials rejected".to_string())),
        };

        self.store_token(Some(token.clone()))?;
        info!(
            component = "glowmarkt",
            event = "glowmarkt.auth.success"
        );
        Ok(token)
    }

    fn store_token(&self, token: Option<String>) -> Result<(), SecondarySourceError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| SecondarySourceError::Auth("token lock poisoned".to_string()))?;
        *guard = token;
        Ok(())
    }

    fn current_token(&self) -> Result<String, SecondarySourceError> {
        let cached = self
            .token
            .lock()
            .map_err(|_| SecondarySourceError::Auth("token lock poisoned".to_string()))?
            .clone();
        match cached {
            Some(token) => Ok(token),
            None => self.authenticate(),
        }
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &str,
    ) -> Result<T, SecondarySourceError> {
        let mut reauthenticated = false;
        loop {
            let token = self.current_token()?;
            let response = self
                .http
                .get(url)
                .header("applicationId", GLOWMARKT_APPLICATION_ID)
                .header("token", token)
                .send()
                .map_err(|err| SecondarySourceError::Transport {
                    operation,
                    message: err.to_string(),
                })?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                debug!(
                    component = "glowmarkt",
                    event = "glowmarkt.auth.expired",
                    operation
                );
                self.store_token(None)?;
                reauthenticated = true;
                continue;
            }
            if !status.is_success() {
                let message = response.text().unwrap_or_default();
                return Err(SecondarySourceError::Status {
                    operation,
                    status: status.as_u16(),
                    message,
                });
            }

            return response
                .json()
                .map_err(|err| SecondarySourceError::Malformed(format!("{operation}: {err}")));
        }
    }
}

impl SecondaryReadingSource for GlowmarktClient {
    fn consumption_resource_id(&self) -> Result<Option<String>, SecondarySourceError> {
        let url = format!("{}/resource", self.base_url);
        let resources: Vec<GlowResource> = self.get_json("resource", &url)?;
        Ok(pick_consumption_resource(resources))
    }

    fn samples(
        &self,
        resource_id: &str,
        from_ts_ms_utc: i64,
        to_ts_ms_utc: i64,
    ) -> Result<Vec<RawSecondarySample>, SecondarySourceError> {
        let mut out = Vec::new();
        for (from, to) in request_spans(from_ts_ms_utc, to_ts_ms_utc) {
            let url = format!(
                "{}/resource/{}/readings?from={}&to={}&period=PT30M&function=sum&offset=0",
                self.base_url,
                resource_id,
                glow_timestamp(from)?,
                glow_timestamp(to)?
            );
            let body: ReadingsResponse = self.get_json("readings", &url)?;
            out.extend(
                body.data
                    .into_iter()
                    .map(|(start_epoch_s, value)| RawSecondarySample {
                        start_epoch_s,
                        value,
                    }),
            );
        }
        Ok(out)
    }
}

fn pick_consumption_resource(resources: Vec<GlowResource>) -> Option<String> {
    resources
        .into_iter()
        .find(|resource| {
            resource.classifier.as_deref() == Some(ELECTRICITY_CONSUMPTION_CLASSIFIER)
        })
        .map(|resource| resource.resource_id)
}

fn request_spans(from_ts_ms_utc: i64, to_ts_ms_utc: i64) -> Vec<(i64, i64)> {
    let step = MAX_READINGS_SPAN_DAYS * DAY_MS;
    let mut spans = Vec::new();
    let mut cursor = from_ts_ms_utc;
    while cursor < to_ts_ms_utc {
        let end = (cursor + step).min(to_ts_ms_utc);
        spans.push((cursor, end));
        cursor = end;
    }
    spans
}

fn glow_timestamp(ts_ms_utc: i64) -> Result<String, SecondarySourceError> {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .ok_or_else(|| {
            SecondarySourceError::Malformed(format!("timestamp out of range: {ts_ms_utc}"))
        })
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    valid: bool,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlowResource {
    #[serde(rename = "resourceId")]
    resource_id: String,
    classifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadingsResponse {
    #[serde(default)]
    data: Vec<(i64, Option<f64>)>,
}
