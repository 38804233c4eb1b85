//! Hourly refresh cycle: session check, discovery, per-meter pipelines,
//! serialized imports and readout publication.
//!
//! Each meter's pipeline is isolated. A failed meter keeps the series from
//! its last successful cycle and is published as stale.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::hourly::aggregate_hourly;
use crate::primary::{fetch_interval_readings, ConsumptionPageSource, FetchConfig, FetchError};
use crate::readings::{
    format_rfc3339_ms, FetchWindow, HourlyBucket, MeterInfo, MeterKey, MeterSeries,
};
use crate::readout::{MeterReadout, ReadoutBoard, ReadoutSnapshot};
use crate::secondary::{secondary_since, SourcePlan};
use crate::session::{AccountSession, AuthError};
use crate::statistics::{
    import_cumulative, resolve_override, statistic_id_for, ImportReport, PersistenceError,
    StatisticMetadata, StatisticsStore,
};
use crate::window::{plan_fetch_window, warm_lookback_start, BackfillDays};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("meter task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSettings {
    pub backfill: BackfillDays,
    pub target_statistic_id: Option<String>,
    pub fetch: FetchConfig,
}

impl RefreshSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            backfill: config.backfill_days,
            target_statistic_id: config.target_statistic_id.clone(),
            fetch: FetchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeterOutcome {
    Refreshed {
        key: MeterKey,
        readings: usize,
        secondary_readings: usize,
        import: Result<ImportReport, String>,
    },
    Failed {
        key: MeterKey,
        reason: String,
    },
}

impl MeterOutcome {
    pub fn key(&self) -> &MeterKey {
        match self {
            Self::Refreshed { key, .. } | Self::Failed { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub started_at_ts_ms_utc: i64,
    pub auth_failed: bool,
    pub discovery_errors: Vec<String>,
    pub outcomes: Vec<MeterOutcome>,
}

impl CycleReport {
    fn new(started_at_ts_ms_utc: i64) -> Self {
        Self {
            started_at_ts_ms_utc,
            auth_failed: false,
            discovery_errors: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn refreshed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, MeterOutcome::Refreshed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.refreshed()
    }
}

struct MeterState {
    meter: MeterInfo,
    statistic_id: String,
    series: MeterSeries,
}

struct PlannedMeter {
    meter: MeterInfo,
    metadata: StatisticMetadata,
    window: FetchWindow,
}

struct FetchedMeter {
    series: MeterSeries,
    secondary_readings: usize,
}

struct ImportJob {
    key: MeterKey,
    metadata: StatisticMetadata,
    buckets: Vec<HourlyBucket>,
}

pub struct RefreshCoordinator<S> {
    session: Arc<dyn AccountSession>,
    primary: Arc<dyn ConsumptionPageSource>,
    sources: SourcePlan,
    store: Arc<Mutex<S>>,
    board: ReadoutBoard,
    settings: RefreshSettings,
    state: BTreeMap<MeterKey, MeterState>,
}

impl<S> RefreshCoordinator<S>
where
    S: StatisticsStore + Send + 'static,
{
    pub fn new(
        session: Arc<dyn AccountSession>,
        primary: Arc<dyn ConsumptionPageSource>,
        sources: SourcePlan,
        store: Arc<Mutex<S>>,
        board: ReadoutBoard,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            session,
            primary,
            sources,
            store,
            board,
            settings,
            state: BTreeMap::new(),
        }
    }

    /// Latest successfully merged series for a meter, possibly from an earlier cycle.
    pub fn series(&self, key: &MeterKey) -> Option<&MeterSeries> {
        self.state.get(key).map(|state| &state.series)
    }

    pub fn known_meters(&self) -> impl Iterator<Item = &MeterKey> {
        self.state.keys()
    }

    /// Runs cycles every [`REFRESH_INTERVAL`], starting immediately.
    pub async fn run_forever(mut self) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now_ts_ms_utc = chrono::Utc::now().timestamp_millis();
            self.run_cycle(now_ts_ms_utc).await;
        }
    }

    pub async fn run_cycle(&mut self, now_ts_ms_utc: i64) -> CycleReport {
        let mut report = CycleReport::new(now_ts_ms_utc);
        info!(
            component = "orchestrator",
            event = "cycle.start",
            now = %format_rfc3339_ms(now_ts_ms_utc).unwrap_or_default(),
            known_meters = self.state.len()
        );

        if let Err(err) = self.ensure_session(now_ts_ms_utc).await {
            error!(
                component = "orchestrator",
                event = "cycle.auth_failed",
                error = %err
            );
            report.auth_failed = true;
            self.publish(now_ts_ms_utc, &[]);
            return report;
        }

        let meters = self.discover_meters(&mut report).await;
        let override_id =
            match resolve_override(&meters, self.settings.target_statistic_id.as_deref()) {
                Ok(id) => id.map(str::to_string),
                Err(err) => {
                    warn!(
                        component = "orchestrator",
                        event = "plan.override_ignored",
                        error = %err
                    );
                    report.discovery_errors.push(err.to_string());
                    None
                }
            };
        let planned = match self.plan_meters(meters, override_id, now_ts_ms_utc).await {
            Ok(planned) => planned,
            Err(err) => {
                error!(
                    component = "orchestrator",
                    event = "cycle.plan_failed",
                    error = %err
                );
                report.discovery_errors.push(err.to_string());
                self.publish(now_ts_ms_utc, &[]);
                return report;
            }
        };

        let fetched = self.fetch_all(planned, now_ts_ms_utc).await;

        let mut jobs = Vec::new();
        let mut refreshed = Vec::new();
        for (planned, result) in fetched {
            let key = planned.meter.key();
            match result {
                Ok(fetched) => {
                    jobs.push(ImportJob {
                        key: key.clone(),
                        metadata: planned.metadata.clone(),
                        buckets: aggregate_hourly(&fetched.series),
                    });
                    refreshed.push((planned, fetched));
                }
                Err(err) => {
                    let window_start =
                        format_rfc3339_ms(planned.window.start_ts_ms_utc).unwrap_or_default();
                    let window_end =
                        format_rfc3339_ms(planned.window.end_ts_ms_utc).unwrap_or_default();
                    warn!(
                        component = "orchestrator",
                        event = "meter.refresh_failed",
                        account_number = %key.account_number,
                        meter_id = %key.meter_id,
                        meter_type = key.meter_type.as_str(),
                        window_start = %window_start,
                        window_end = %window_end,
                        error = %err
                    );
                    report.outcomes.push(MeterOutcome::Failed {
                        key,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut imports = self.import_all(jobs).await;
        let mut fresh_keys = Vec::with_capacity(refreshed.len());
        for (planned, fetched) in refreshed {
            let key = planned.meter.key();
            let import = imports
                .remove(&key)
                .unwrap_or_else(|| Err("import did not run".to_string()));
            if let Err(reason) = &import {
                warn!(
                    component = "orchestrator",
                    event = "meter.import_failed",
                    statistic_id = %planned.metadata.statistic_id,
                    error = %reason
                );
            }

            report.outcomes.push(MeterOutcome::Refreshed {
                key: key.clone(),
                readings: fetched.series.readings.len(),
                secondary_readings: fetched.secondary_readings,
                import,
            });
            self.state.insert(
                key.clone(),
                MeterState {
                    meter: planned.meter,
                    statistic_id: planned.metadata.statistic_id,
                    series: fetched.series,
                },
            );
            fresh_keys.push(key);
        }

        self.publish(now_ts_ms_utc, &fresh_keys);

        info!(
            component = "orchestrator",
            event = "cycle.finish",
            refreshed = report.refreshed(),
            failed = report.failed(),
            discovery_errors = report.discovery_errors.len()
        );
        report
    }

    async fn ensure_session(&self, now_ts_ms_utc: i64) -> Result<(), AuthError> {
        if self.session.is_session_valid(now_ts_ms_utc) {
            return Ok(());
        }
        info!(
            component = "orchestrator",
            event = "session.reauthenticate"
        );
        self.session.reauthenticate().await
    }

    async fn discover_meters(&self, report: &mut CycleReport) -> Vec<MeterInfo> {
        let accounts = match self.session.account_numbers().await {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(
                    component = "orchestrator",
                    event = "discovery.accounts_failed",
                    error = %err
                );
                report.discovery_errors.push(err.to_string());
                return Vec::new();
            }
        };

        let mut tasks = JoinSet::new();
        for account_number in accounts {
            let session = Arc::clone(&self.session);
            tasks.spawn(async move {
                let result = session.meters(&account_number).await;
                (account_number, result)
            });
        }

        let mut meters = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(found))) => meters.extend(found),
                Ok((account_number, Err(err))) => {
                    warn!(
                        component = "orchestrator",
                        event = "discovery.meters_failed",
                        account_number = %account_number,
                        error = %err
                    );
                    report
                        .discovery_errors
                        .push(format!("account {account_number}: {err}"));
                }
                Err(err) => report.discovery_errors.push(err.to_string()),
            }
        }
        meters.sort_by(|a, b| a.key().cmp(&b.key()));
        meters
    }

    /// Resolves identity and fetch window for every meter. Warm meters have a
    /// persisted point inside the warm lookback. A failed lookup plans a backfill.
    async fn plan_meters(
        &self,
        meters: Vec<MeterInfo>,
        override_id: Option<String>,
        now_ts_ms_utc: i64,
    ) -> Result<Vec<PlannedMeter>, PipelineError> {
        let backfill = self.settings.backfill;
        let store = Arc::clone(&self.store);

        let planned = tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| PersistenceError::LockPoisoned)?;
            let lookback_start = warm_lookback_start(now_ts_ms_utc);
            let planned = meters
                .into_iter()
                .map(|meter| {
                    let statistic_id = statistic_id_for(&meter, override_id.as_deref());
                    let has_prior_data = match guard.statistics_during_period(
                        lookback_start,
                        now_ts_ms_utc,
                        &statistic_id,
                    ) {
                        Ok(points) => !points.is_empty(),
                        Err(err) => {
                            warn!(
                                component = "orchestrator",
                                event = "plan.prior_data_unknown",
                                statistic_id = %statistic_id,
                                error = %err
                            );
                            false
                        }
                    };
                    PlannedMeter {
                        window: plan_fetch_window(now_ts_ms_utc, has_prior_data, backfill),
                        metadata: StatisticMetadata::for_meter(&meter, statistic_id),
                        meter,
                    }
                })
                .collect::<Vec<_>>();
            Ok::<_, PersistenceError>(planned)
        })
        .await
        .map_err(|err| PipelineError::Task(err.to_string()))??;

        Ok(planned)
    }

    async fn fetch_all(
        &self,
        planned: Vec<PlannedMeter>,
        now_ts_ms_utc: i64,
    ) -> Vec<(PlannedMeter, Result<FetchedMeter, PipelineError>)> {
        let mut tasks = JoinSet::new();
        let mut pending: BTreeMap<MeterKey, PlannedMeter> = BTreeMap::new();

        for plan in planned {
            let primary = Arc::clone(&self.primary);
            let sources = self.sources.clone();
            let fetch_cfg = self.settings.fetch;
            let meter = plan.meter.clone();
            let window = plan.window;
            tasks.spawn(async move {
                let key = meter.key();
                let result =
                    refresh_meter(primary, sources, meter, window, fetch_cfg, now_ts_ms_utc).await;
                (key, result)
            });
            pending.insert(plan.meter.key(), plan);
        }

        let mut out = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, result)) => {
                    if let Some(plan) = pending.remove(&key) {
                        out.push((plan, result));
                    }
                }
                Err(err) => {
                    error!(
                        component = "orchestrator",
                        event = "meter.task_failed",
                        error = %err
                    );
                }
            }
        }
        // Tasks that panicked never report back.
        for plan in pending.into_values() {
            out.push((plan, Err(PipelineError::Task("meter task aborted".to_string()))));
        }
        out.sort_by(|a, b| a.0.meter.key().cmp(&b.0.meter.key()));
        out
    }

    async fn import_all(
        &self,
        jobs: Vec<ImportJob>,
    ) -> BTreeMap<MeterKey, Result<ImportReport, String>> {
        let keys: Vec<MeterKey> = jobs.iter().map(|job| job.key.clone()).collect();
        let store = Arc::clone(&self.store);

        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = store.lock().map_err(|_| PersistenceError::LockPoisoned)?;
            Ok::<_, PersistenceError>(
                jobs.into_iter()
                    .map(|job| {
                        let result = import_cumulative(&mut *guard, &job.buckets, &job.metadata)
                            .map_err(|err| err.to_string());
                        (job.key, result)
                    })
                    .collect::<BTreeMap<_, _>>(),
            )
        })
        .await;

        match joined {
            Ok(Ok(results)) => results,
            Ok(Err(err)) => failed_imports(keys, &err),
            Err(err) => failed_imports(keys, &PersistenceError::Task(err.to_string())),
        }
    }

    fn publish(&self, now_ts_ms_utc: i64, fresh_keys: &[MeterKey]) {
        let meters = self
            .state
            .iter()
            .map(|(key, state)| {
                MeterReadout::from_series(
                    &state.meter,
                    state.statistic_id.clone(),
                    &state.series,
                    !fresh_keys.contains(key),
                )
            })
            .collect();
        self.board.publish(ReadoutSnapshot {
            generated_at: format_rfc3339_ms(now_ts_ms_utc),
            meters,
        });
    }
}

async fn refresh_meter(
    primary: Arc<dyn ConsumptionPageSource>,
    sources: SourcePlan,
    meter: MeterInfo,
    window: FetchWindow,
    fetch_cfg: FetchConfig,
    now_ts_ms_utc: i64,
) -> Result<FetchedMeter, PipelineError> {
    let fetched = fetch_interval_readings(primary.as_ref(), &meter, window, &fetch_cfg).await?;

    let secondary = match sources.secondary_for(meter.meter_type) {
        Some(pool) => {
            let since = secondary_since(fetched.readings.last(), now_ts_ms_utc);
            pool.fetch(since, now_ts_ms_utc).await
        }
        None => Vec::new(),
    };
    let secondary_readings = secondary.len();

    Ok(FetchedMeter {
        series: MeterSeries::from_sources(meter.key(), fetched.readings, secondary, window),
        secondary_readings,
    })
}

fn failed_imports(
    keys: Vec<MeterKey>,
    err: &PersistenceError,
) -> BTreeMap<MeterKey, Result<ImportReport, String>> {
    error!(
        component = "orchestrator",
        event = "import.batch_failed",
        error = %err
    );
    keys.into_iter()
        .map(|key| (key, Err(err.to_string())))
        .collect()
}
