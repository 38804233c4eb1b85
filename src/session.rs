//! Account session and meter discovery seam.

use async_trait::async_trait;
use thiserror::Error;

use crate::primary::FetchError;
use crate::readings::MeterInfo;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("authentication transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait AccountSession: Send + Sync {
    fn is_session_valid(&self, now_ts_ms_utc: i64) -> bool;

    async fn reauthenticate(&self) -> Result<(), AuthError>;

    async fn account_numbers(&self) -> Result<Vec<String>, FetchError>;

    async fn meters(&self, account_number: &str) -> Result<Vec<MeterInfo>, FetchError>;
}
