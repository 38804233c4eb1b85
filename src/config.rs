//! Runtime configuration loaded from `METERSTAT_*` environment variables.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::window::{BackfillDays, BackfillDaysError};

pub const DEFAULT_STORE_PATH: &str = "data/meterstat.sqlite";
pub const DEFAULT_READOUT_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SECONDARY_WORKERS: usize = 2;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub account: Credentials,
    pub secondary: Option<Credentials>,
    pub backfill_days: BackfillDays,
    pub target_statistic_id: Option<String>,
    pub store_path: PathBuf,
    pub readout_addr: SocketAddr,
    pub http_timeout_ms: u64,
    pub secondary_workers: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{present} is set but {missing} is not")]
    IncompletePair {
        present: &'static str,
        missing: &'static str,
    },
    #[error(transparent)]
    Backfill(#[from] BackfillDaysError),
}

pub fn config_from_env() -> Result<AppConfig, ConfigError> {
    config_from_lookup(|key| std::env::var(key).ok())
}

pub fn config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let get = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    let username =
        get("METERSTAT_USERNAME").ok_or(ConfigError::Missing("METERSTAT_USERNAME"))?;
    let password =
        get("METERSTAT_PASSWORD").ok_or(ConfigError::Missing("METERSTAT_PASSWORD"))?;

    let secondary = match (
        get("METERSTAT_GLOW_USERNAME"),
        get("METERSTAT_GLOW_PASSWORD"),
    ) {
        (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
        (None, None) => None,
        (Some(_), None) => {
            return Err(ConfigError::IncompletePair {
                present: "METERSTAT_GLOW_USERNAME",
                missing: "METERSTAT_GLOW_PASSWORD",
            })
        }
        (None, Some(_)) => {
            return Err(ConfigError::IncompletePair {
                present: "METERSTAT_GLOW_PASSWORD",
                missing: "METERSTAT_GLOW_USERNAME",
            })
        }
    };

    let backfill_days = match get("METERSTAT_BACKFILL_DAYS") {
        Some(raw) => {
            let days = raw.parse::<i64>().map_err(|_| ConfigError::Invalid {
                key: "METERSTAT_BACKFILL_DAYS",
                value: raw.clone(),
            })?;
            BackfillDays::new(days)?
        }
        None => BackfillDays::default(),
    };

    let readout_raw =
        get("METERSTAT_READOUT_ADDR").unwrap_or_else(|| DEFAULT_READOUT_ADDR.to_string());
    let readout_addr = readout_raw.parse().map_err(|_| ConfigError::Invalid {
        key: "METERSTAT_READOUT_ADDR",
        value: readout_raw.clone(),
    })?;

    let http_timeout_ms = parse_or(
        "METERSTAT_HTTP_TIMEOUT_MS",
        get("METERSTAT_HTTP_TIMEOUT_MS"),
        DEFAULT_HTTP_TIMEOUT_MS,
    )?;
    let secondary_workers = parse_or(
        "METERSTAT_SECONDARY_WORKERS",
        get("METERSTAT_SECONDARY_WORKERS"),
        DEFAULT_SECONDARY_WORKERS,
    )?;
    if secondary_workers == 0 {
        return Err(ConfigError::Invalid {
            key: "METERSTAT_SECONDARY_WORKERS",
            value: "0".to_string(),
        });
    }

    Ok(AppConfig {
        account: Credentials::new(username, password),
        secondary,
        backfill_days,
        target_statistic_id: get("METERSTAT_TARGET_STATISTIC_ID"),
        store_path: get("METERSTAT_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
        readout_addr,
        http_timeout_ms,
        secondary_workers,
    })
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
