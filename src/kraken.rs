//! GraphQL client for the primary (Kraken) consumption API.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::primary::{
    ConsumptionPage, ConsumptionPageSource, FetchError, PageRequest, RawConsumptionRecord,
};
use crate::readings::{MeterInfo, MeterType};
use crate::session::{AccountSession, AuthError};

pub const KRAKEN_GRAPHQL_URL: &str = "https://api.eonnext-kraken.energy/v1/graphql/";
const PAGE_SIZE: u32 = 100;

const LOGIN_MUTATION: &str = "
mutation loginEmailAuthentication($input: ObtainJSONWebTokenInput!) {
    obtainKrakenToken(input: $input) {
        payload
        refreshExpiresIn
        refreshToken
        token
    }
}";

const ACCOUNTS_QUERY: &str = "
query headerGetLoggedInUser {
    viewer {
        accounts {
            ... on AccountType {
                number
            }
        }
    }
}";

const METERS_QUERY: &str = "
query getAccountMeterSelector($accountNumber: String!, $showInactive: Boolean!) {
    properties(accountNumber: $accountNumber) {
        electricityMeterPoints {
            id
            meters(includeInactive: $showInactive) {
                id
                serialNumber
            }
        }
        gasMeterPoints {
            id
            meters(includeInactive: $showInactive) {
                id
                serialNumber
            }
        }
    }
}";

#[derive(Debug, Clone)]
struct KrakenTokens {
    token: String,
    token_expires_s: i64,
}

pub struct KrakenClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    tokens: RwLock<Option<KrakenTokens>>,
}

impl KrakenClient {
    pub fn new(credentials: Credentials, timeout_ms: u64) -> Result<Self, FetchError> {
        Self::with_base_url(credentials, timeout_ms, KRAKEN_GRAPHQL_URL)
    }

    pub fn with_base_url(
        credentials: Credentials,
        timeout_ms: u64,
        base_url: impl Into<String>,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| FetchError::Transport {
                operation: "client_build".to_string(),
                message: err.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            credentials,
            tokens: RwLock::new(None),
        })
    }

    pub async fn login(&self) -> Result<(), AuthError> {
        let variables = json!({
            "input": {
                "email": self.credentials.username,
                "password": self.credentials.password,
            }
        });

        let data: LoginData = self
            .graphql("loginEmailAuthentication", LOGIN_MUTATION, variables, None)
            .await
            .map_err(|err| match err {
                FetchError::Graphql { message, .. } => AuthError::Rejected(message),
                FetchError::Status {
                    status: 400..=403,
                    message,
                    ..
                } => AuthError::Rejected(message),
                other => AuthError::Transport(other.to_string()),
            })?;

        let token = data
            .obtain_kraken_token
            .ok_or_else(|| AuthError::Rejected("no token in login response".to_string()))?;

        let mut guard = self
            .tokens
            .write()
            .map_err(|_| AuthError::Transport("token lock poisoned".to_string()))?;
        *guard = Some(KrakenTokens {
            token: token.token,
            token_expires_s: token.payload.exp,
        });

        info!(
            component = "kraken",
            event = "kraken.login.ok",
            token_expires_s = token.payload.exp
        );
        Ok(())
    }

    fn bearer(&self) -> Result<String, FetchError> {
        let guard = self.tokens.read().map_err(|_| FetchError::NotAuthenticated)?;
        guard
            .as_ref()
            .map(|tokens| tokens.token.clone())
            .ok_or(FetchError::NotAuthenticated)
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        operation: &str,
        query: &str,
        variables: serde_json::Value,
        token: Option<&str>,
    ) -> Result<T, FetchError> {
        let body = json!({
            "operationName": operation,
            "variables": variables,
            "query": query,
        });

        let mut request = self.http.post(&self.base_url).json(&body);
        if let Some(token) = token {
            request = request.header("authorization", format!("JWT {token}"));
        }

        let response = request.send().await.map_err(|err| FetchError::Transport {
            operation: operation.to_string(),
            message: err.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|err| FetchError::Transport {
            operation: operation.to_string(),
            message: err.to_string(),
        })?;

        let envelope: GraphqlEnvelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(err) if status.is_success() => {
                return Err(FetchError::MalformedPage(format!(
                    "{operation} response is not valid JSON: {err}"
                )));
            }
            Err(_) => GraphqlEnvelope {
                data: None,
                errors: Vec::new(),
            },
        };

        let first_error = envelope.errors.first().map(|e| e.message.clone());
        if !status.is_success() {
            return Err(FetchError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                message: first_error.unwrap_or(text),
            });
        }

        match (envelope.data, first_error) {
            (Some(data), _) => Ok(data),
            (None, Some(message)) => Err(FetchError::Graphql {
                operation: operation.to_string(),
                message,
            }),
            (None, None) => Err(FetchError::MalformedPage(format!(
                "{operation} response has no data"
            ))),
        }
    }
}

#[async_trait]
impl AccountSession for KrakenClient {
    fn is_session_valid(&self, now_ts_ms_utc: i64) -> bool {
        self.tokens
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|t| t.token_expires_s))
            .map(|expires_s| expires_s * 1_000 > now_ts_ms_utc)
            .unwrap_or(false)
    }

    async fn reauthenticate(&self) -> Result<(), AuthError> {
        debug!(component = "kraken", event = "kraken.reauthenticate");
        self.login().await
    }

    async fn account_numbers(&self) -> Result<Vec<String>, FetchError> {
        let token = self.bearer()?;
        let data: AccountsData = self
            .graphql("headerGetLoggedInUser", ACCOUNTS_QUERY, json!({}), Some(&token))
            .await?;

        Ok(data
            .viewer
            .map(|viewer| viewer.accounts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|account| account.number)
            .collect())
    }

    async fn meters(&self, account_number: &str) -> Result<Vec<MeterInfo>, FetchError> {
        let token = self.bearer()?;
        let data: PropertiesData = self
            .graphql(
                "getAccountMeterSelector",
                METERS_QUERY,
                json!({ "accountNumber": account_number, "showInactive": false }),
                Some(&token),
            )
            .await?;

        Ok(meters_from_properties(account_number, data.properties))
    }
}

#[async_trait]
impl ConsumptionPageSource for KrakenClient {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<ConsumptionPage, FetchError> {
        let token = self.bearer()?;
        let (operation, query) = consumption_query(request.meter_type);
        let start_date = Utc
            .timestamp_millis_opt(request.window_start_ts_ms_utc)
            .single()
            .ok_or_else(|| {
                FetchError::MalformedPage(format!(
                    "invalid window start {}",
                    request.window_start_ts_ms_utc
                ))
            })?
            .format("%Y-%m-%dT%H:%M:%S+00:00")
            .to_string();

        let mut variables = json!({
            "accountNumber": request.account_number,
            "startDate": start_date,
        });
        if let Some(cursor) = request.cursor {
            variables["after"] = json!(cursor);
        }

        let data: ConsumptionData = self
            .graphql(operation, &query, variables, Some(&token))
            .await?;

        Ok(page_for_meter(data, request.meter_id))
    }
}

fn consumption_query(meter_type: MeterType) -> (&'static str, String) {
    let (operation, agreements) = match meter_type {
        MeterType::Electricity => ("getElectricityConsumption", "electricityAgreements"),
        MeterType::Gas => ("getGasConsumption", "gasAgreements"),
    };

    let query = format!(
        "
query {operation}($accountNumber: String!, $startDate: DateTime!, $after: String) {{
    account(accountNumber: $accountNumber) {{
        {agreements}(active: true) {{
            meterPoint {{
                meters(includeInactive: false) {{
                    id
                    consumption(
                        startAt: $startDate
                        grouping: HALF_HOUR
                        timezone: \"Europe/London\"
                        first: {PAGE_SIZE}
                        after: $after
                    ) {{
                        edges {{
                            node {{
                                startAt
                                endAt
                                value
                            }}
                        }}
                        pageInfo {{
                            hasNextPage
                            endCursor
                        }}
                    }}
                }}
            }}
        }}
    }}
}}"
    );

    (operation, query)
}

fn page_for_meter(data: ConsumptionData, meter_id: &str) -> ConsumptionPage {
    let agreements = data.account.map(|a| a.agreements).unwrap_or_default();
    let meter = agreements
        .into_iter()
        .filter_map(|agreement| agreement.meter_point)
        .flat_map(|point| point.meters)
        .flatten()
        .find(|meter| meter.id == meter_id);

    let Some(connection) = meter.and_then(|m| m.consumption) else {
        return ConsumptionPage::default();
    };

    let records: Vec<RawConsumptionRecord> = connection
        .edges
        .into_iter()
        .flatten()
        .filter_map(|edge| edge.node)
        .collect();
    let page_info = connection.page_info.unwrap_or_default();

    ConsumptionPage {
        records,
        end_cursor: page_info.end_cursor,
        has_next_page: page_info.has_next_page,
    }
}

fn meters_from_properties(account_number: &str, properties: Vec<PropertyNode>) -> Vec<MeterInfo> {
    let mut meters = Vec::new();
    for property in properties {
        let points = property
            .electricity_meter_points
            .into_iter()
            .map(|point| (MeterType::Electricity, point))
            .chain(
                property
                    .gas_meter_points
                    .into_iter()
                    .map(|point| (MeterType::Gas, point)),
            );

        for (meter_type, point) in points {
            for meter in point.meters.into_iter().flatten() {
                // Serial-less meters fall back to their id to keep identities distinct.
                let serial = meter
                    .serial_number
                    .filter(|serial| !serial.trim().is_empty())
                    .unwrap_or_else(|| meter.id.clone());
                meters.push(MeterInfo {
                    account_number: account_number.to_string(),
                    meter_id: meter.id,
                    meter_point_id: point.id.clone(),
                    serial,
                    meter_type,
                });
            }
        }
    }
    meters
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorItem {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    obtain_kraken_token: Option<LoginToken>,
}

#[derive(Debug, Deserialize)]
struct LoginToken {
    token: String,
    payload: LoginPayload,
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct AccountsData {
    viewer: Option<Viewer>,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    #[serde(default)]
    accounts: Vec<AccountNode>,
}

#[derive(Debug, Deserialize)]
struct AccountNode {
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PropertiesData {
    #[serde(default)]
    properties: Vec<PropertyNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyNode {
    #[serde(default)]
    electricity_meter_points: Vec<MeterPointNode>,
    #[serde(default)]
    gas_meter_points: Vec<MeterPointNode>,
}

#[derive(Debug, Deserialize)]
struct MeterPointNode {
    id: String,
    #[serde(default)]
    meters: Vec<Option<MeterNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterNode {
    id: String,
    serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionData {
    account: Option<ConsumptionAccount>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionAccount {
    #[serde(rename = "electricityAgreements", alias = "gasAgreements", default)]
    agreements: Vec<AgreementNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgreementNode {
    meter_point: Option<ConsumptionMeterPoint>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionMeterPoint {
    #[serde(default)]
    meters: Vec<Option<ConsumptionMeter>>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionMeter {
    id: String,
    consumption: Option<ConsumptionConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumptionConnection {
    #[serde(default)]
    edges: Vec<Option<ConsumptionEdge>>,
    page_info: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionEdge {
    node: Option<RawConsumptionRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    end_cursor: Option<String>,
}
