use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use meterstat::{
    format_rfc3339_ms, AccountSession, AuthError, BackfillDays, ConsumptionPage,
    ConsumptionPageSource, CumulativeStatisticPoint, FetchConfig, FetchError, MeterInfo,
    MeterOutcome, MeterType, PageRequest, RawConsumptionRecord, RawSecondarySample, ReadingSource,
    ReadoutBoard, ReadoutSource, RefreshCoordinator, RefreshSettings, SecondaryReadingSource,
    SecondarySourceError, SourcePlan, SqliteStatisticsStore, StatisticMetadata, StatisticsStore,
    DAY_MS, HALF_HOUR_MS, HOUR_MS,
};
use tempfile::tempdir;

const T0: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z
const PAGE_SIZE: usize = 4;

fn at(hours: i64, minutes: i64) -> i64 {
    T0 + hours * HOUR_MS + minutes * 60_000
}

fn electricity_meter() -> MeterInfo {
    MeterInfo {
        account_number: "A-100".to_string(),
        meter_id: "m-elec".to_string(),
        meter_point_id: "mpan-1".to_string(),
        serial: "21E1234".to_string(),
        meter_type: MeterType::Electricity,
    }
}

fn gas_meter() -> MeterInfo {
    MeterInfo {
        account_number: "A-100".to_string(),
        meter_id: "m-gas".to_string(),
        meter_point_id: "mprn-1".to_string(),
        serial: "G4 0099".to_string(),
        meter_type: MeterType::Gas,
    }
}

#[derive(Default)]
struct FakeKraken {
    session_valid: AtomicBool,
    reject_login: bool,
    reauth_calls: AtomicUsize,
    meters: Vec<MeterInfo>,
    readings: Mutex<HashMap<String, Vec<(i64, f64)>>>,
    failing_meters: Mutex<HashSet<String>>,
    requested_window_starts: Mutex<Vec<(String, i64)>>,
}

impl FakeKraken {
    fn new(meters: Vec<MeterInfo>) -> Self {
        Self {
            session_valid: AtomicBool::new(true),
            meters,
            ..Self::default()
        }
    }

    fn set_half_hours(&self, meter_id: &str, start_ts_ms_utc: i64, values: &[f64]) {
        let series = values
            .iter()
            .enumerate()
            .map(|(idx, value)| (start_ts_ms_utc + idx as i64 * HALF_HOUR_MS, *value))
            .collect();
        self.readings
            .lock()
            .unwrap()
            .insert(meter_id.to_string(), series);
    }

    fn fail_meter(&self, meter_id: &str, fail: bool) {
        let mut failing = self.failing_meters.lock().unwrap();
        if fail {
            failing.insert(meter_id.to_string());
        } else {
            failing.remove(meter_id);
        }
    }

    fn window_starts_for(&self, meter_id: &str) -> Vec<i64> {
        self.requested_window_starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == meter_id)
            .map(|(_, start)| *start)
            .collect()
    }
}

#[async_trait]
impl AccountSession for FakeKraken {
    fn is_session_valid(&self, _now_ts_ms_utc: i64) -> bool {
        self.session_valid.load(Ordering::SeqCst)
    }

    async fn reauthenticate(&self) -> Result<(), AuthError> {
        self.reauth_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_login {
            return Err(AuthError::Rejected("invalid credentials".to_string()));
        }
        self.session_valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn account_numbers(&self) -> Result<Vec<String>, FetchError> {
        let mut accounts: Vec<String> = self
            .meters
            .iter()
            .map(|meter| meter.account_number.clone())
            .collect();
        accounts.dedup();
        Ok(accounts)
    }

    async fn meters(&self, account_number: &str) -> Result<Vec<MeterInfo>, FetchError> {
        Ok(self
            .meters
            .iter()
            .filter(|meter| meter.account_number == account_number)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConsumptionPageSource for FakeKraken {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<ConsumptionPage, FetchError> {
        if request.cursor.is_none() {
            self.requested_window_starts
                .lock()
                .unwrap()
                .push((request.meter_id.to_string(), request.window_start_ts_ms_utc));
        }
        if self.failing_meters.lock().unwrap().contains(request.meter_id) {
            return Err(FetchError::Transport {
                operation: "getElectricityConsumption".to_string(),
                message: "connection reset".to_string(),
            });
        }

        let all: Vec<(i64, f64)> = self
            .readings
            .lock()
            .unwrap()
            .get(request.meter_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|(start, _)| *start >= request.window_start_ts_ms_utc)
            .collect();

        let offset: usize = request.cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let end = (offset + PAGE_SIZE).min(all.len());
        let records = all[offset..end]
            .iter()
            .map(|(start, value)| RawConsumptionRecord {
                start_at: format_rfc3339_ms(*start).unwrap(),
                end_at: format_rfc3339_ms(start + HALF_HOUR_MS).unwrap(),
                value: serde_json::json!(value),
            })
            .collect();

        Ok(ConsumptionPage {
            records,
            end_cursor: Some(end.to_string()),
            has_next_page: end < all.len(),
        })
    }
}

struct FakeGlow {
    samples: Vec<(i64, f64)>,
    fail: bool,
}

impl SecondaryReadingSource for FakeGlow {
    fn consumption_resource_id(&self) -> Result<Option<String>, SecondarySourceError> {
        Ok(Some("res-elec".to_string()))
    }

    fn samples(
        &self,
        _resource_id: &str,
        _from_ts_ms_utc: i64,
        _to_ts_ms_utc: i64,
    ) -> Result<Vec<RawSecondarySample>, SecondarySourceError> {
        if self.fail {
            return Err(SecondarySourceError::Transport {
                operation: "readings",
                message: "network unreachable".to_string(),
            });
        }
        Ok(self
            .samples
            .iter()
            .map(|(start, value)| RawSecondarySample {
                start_epoch_s: start / 1_000,
                value: Some(*value),
            })
            .collect())
    }
}

fn settings(backfill_days: i64) -> RefreshSettings {
    RefreshSettings {
        backfill: BackfillDays::new(backfill_days).unwrap(),
        target_statistic_id: None,
        fetch: FetchConfig {
            max_page_retries: 0,
            retry_backoff_ms: 0,
        },
    }
}

fn coordinator<S: StatisticsStore + Send + 'static>(
    kraken: &Arc<FakeKraken>,
    sources: SourcePlan,
    store: Arc<Mutex<S>>,
    board: &ReadoutBoard,
    backfill_days: i64,
) -> RefreshCoordinator<S> {
    RefreshCoordinator::new(
        kraken.clone(),
        kraken.clone(),
        sources,
        store,
        board.clone(),
        settings(backfill_days),
    )
}

fn sums<S: StatisticsStore>(store: &Mutex<S>, statistic_id: &str) -> Vec<(i64, f64)> {
    store
        .lock()
        .unwrap()
        .statistics_during_period(T0 - 30 * DAY_MS, T0 + 30 * DAY_MS, statistic_id)
        .unwrap()
        .into_iter()
        .map(|point| (point.start_ts_ms_utc, point.sum))
        .collect()
}

const ELEC_ID: &str = "meterstat_21e1234_electricity_history";

#[tokio::test]
async fn cold_start_backfills_and_imports_running_totals() {
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter()]));
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0, 1.0, 1.0]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store.clone(), &board, 2);

    let now = at(12, 0);
    let report = coord.run_cycle(now).await;

    assert!(!report.auth_failed);
    assert_eq!(kraken.window_starts_for("m-elec"), vec![now - 2 * DAY_MS]);
    assert_eq!(sums(&store, ELEC_ID), vec![(at(10, 0), 2.0), (at(11, 0), 4.0)]);
    match &report.outcomes[0] {
        MeterOutcome::Refreshed {
            readings, import, ..
        } => {
            assert_eq!(*readings, 4);
            assert_eq!(import.as_ref().unwrap().written, 2);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let snapshot = board.snapshot();
    assert_eq!(snapshot.meters.len(), 1);
    assert_eq!(snapshot.meters[0].current_value, Some(4.0));
    assert_eq!(snapshot.meters[0].statistic_id, ELEC_ID);
    assert!(!snapshot.meters[0].stale);
}

#[tokio::test]
async fn warm_refresh_skips_existing_hour_but_advances_the_total() {
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter()]));
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0, 1.0, 1.0]);

    let mut sqlite = SqliteStatisticsStore::open_in_memory().unwrap();
    sqlite
        .import_statistics(
            &StatisticMetadata::for_meter(&electricity_meter(), ELEC_ID),
            &[CumulativeStatisticPoint {
                start_ts_ms_utc: at(10, 0),
                state: 2.0,
                sum: 2.0,
            }],
        )
        .unwrap();
    let store = Arc::new(Mutex::new(sqlite));
    let board = ReadoutBoard::new();
    let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store.clone(), &board, 90);

    let now = at(12, 0);
    let report = coord.run_cycle(now).await;

    // Prior data inside the warm lookback keeps the window short.
    assert_eq!(kraken.window_starts_for("m-elec"), vec![now - 2 * DAY_MS]);
    assert_eq!(sums(&store, ELEC_ID), vec![(at(10, 0), 2.0), (at(11, 0), 4.0)]);
    let MeterOutcome::Refreshed { import, .. } = &report.outcomes[0] else {
        panic!("meter should refresh");
    };
    let import = import.as_ref().unwrap();
    assert_eq!(import.written, 1);
    assert_eq!(import.skipped_existing, 1);
    assert_eq!(import.final_sum, 4.0);
}

#[tokio::test]
async fn warm_refresh_past_the_hour_continues_from_older_history() {
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter()]));
    kraken.set_half_hours("m-elec", at(0, 0), &[1.0; 144]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store.clone(), &board, 90);

    coord.run_cycle(at(72, 0)).await;
    let seeded = sums(&store, ELEC_ID);
    assert_eq!(seeded.len(), 72);
    assert_eq!(seeded.last(), Some(&(at(71, 0), 144.0)));

    // Stored history now reaches well before the warm window.
    let mut values = vec![1.0; 144];
    values.extend([0.1, 0.1]);
    kraken.set_half_hours("m-elec", at(0, 0), &values);
    let report = coord.run_cycle(at(73, 15)).await;

    assert_eq!(kraken.window_starts_for("m-elec").last(), Some(&at(25, 0)));
    let MeterOutcome::Refreshed { import, .. } = &report.outcomes[0] else {
        panic!("meter should refresh");
    };
    let import = import.as_ref().unwrap();
    assert_eq!(import.checkpoint_sum, 50.0);
    assert_eq!(import.skipped_existing, 47);
    assert_eq!(import.written, 1);

    let persisted = sums(&store, ELEC_ID);
    assert_eq!(persisted.len(), 73);
    let (hour, sum) = persisted[72];
    assert_eq!(hour, at(72, 0));
    assert!((sum - 144.2).abs() < 1e-9, "hour 72 sum was {sum}");
    assert!(persisted.windows(2).all(|pair| pair[0].1 <= pair[1].1));
}

#[tokio::test]
async fn statistic_override_is_ignored_with_two_electricity_meters() {
    let mut second = electricity_meter();
    second.meter_id = "m-elec-2".to_string();
    second.serial = "22E5678".to_string();
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter(), second]));
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0]);
    kraken.set_half_hours("m-elec-2", at(10, 0), &[3.0, 3.0]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let mut settings = settings(2);
    settings.target_statistic_id = Some("sensor.house_energy".to_string());
    let mut coord = RefreshCoordinator::new(
        kraken.clone(),
        kraken.clone(),
        SourcePlan::PrimaryOnly,
        store.clone(),
        board.clone(),
        settings,
    );

    let report = coord.run_cycle(at(12, 0)).await;

    assert_eq!(report.refreshed(), 2);
    assert!(report
        .discovery_errors
        .iter()
        .any(|err| err.contains("sensor.house_energy")));
    assert!(sums(&store, "sensor.house_energy").is_empty());
    assert_eq!(sums(&store, ELEC_ID), vec![(at(10, 0), 2.0)]);
    assert_eq!(
        sums(&store, "meterstat_22e5678_electricity_history"),
        vec![(at(10, 0), 6.0)]
    );
}

#[tokio::test]
async fn repeated_cycles_and_restarts_never_rewrite_or_regress() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("meterstat.sqlite");

    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter()]));
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0, 1.0, 1.0]);
    let board = ReadoutBoard::new();

    {
        let store = Arc::new(Mutex::new(SqliteStatisticsStore::open(&path).unwrap()));
        let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store.clone(), &board, 2);
        coord.run_cycle(at(12, 0)).await;

        let second = coord.run_cycle(at(12, 0)).await;
        let MeterOutcome::Refreshed { import, .. } = &second.outcomes[0] else {
            panic!("meter should refresh");
        };
        assert_eq!(import.as_ref().unwrap().written, 0);
    }

    // A new process sees more data and resumes from the persisted checkpoint.
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0, 1.0, 1.0, 0.5, 0.25]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open(&path).unwrap()));
    let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store.clone(), &board, 90);
    coord.run_cycle(at(13, 0)).await;

    let persisted = sums(&store, ELEC_ID);
    assert_eq!(
        persisted,
        vec![(at(10, 0), 2.0), (at(11, 0), 4.0), (at(12, 0), 4.75)]
    );
    assert!(persisted.windows(2).all(|pair| pair[0].1 <= pair[1].1));
    assert_eq!(
        kraken.window_starts_for("m-elec").last(),
        Some(&(at(13, 0) - 2 * DAY_MS))
    );
}

#[tokio::test]
async fn secondary_network_error_leaves_primary_only_series() {
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter()]));
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0, 1.0, 1.0]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let glow: Arc<dyn SecondaryReadingSource> = Arc::new(FakeGlow {
        samples: vec![(at(12, 0), 9.0)],
        fail: true,
    });
    let mut coord = coordinator(
        &kraken,
        SourcePlan::from_source(Some(glow), 1),
        store.clone(),
        &board,
        2,
    );

    let report = coord.run_cycle(at(13, 0)).await;

    let MeterOutcome::Refreshed {
        readings,
        secondary_readings,
        ..
    } = &report.outcomes[0]
    else {
        panic!("secondary failure must not fail the meter");
    };
    assert_eq!(*readings, 4);
    assert_eq!(*secondary_readings, 0);
    let series = coord.series(&electricity_meter().key()).unwrap();
    assert!(series
        .readings
        .iter()
        .all(|reading| reading.source == ReadingSource::Primary));
}

#[tokio::test]
async fn secondary_fills_the_tail_for_electricity_only() {
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter(), gas_meter()]));
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0, 1.0, 1.0]);
    kraken.set_half_hours("m-gas", at(10, 0), &[2.0, 2.0]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let glow: Arc<dyn SecondaryReadingSource> = Arc::new(FakeGlow {
        samples: vec![(at(11, 30), 7.0), (at(12, 0), 0.5), (at(12, 30), 0.5)],
        fail: false,
    });
    let mut coord = coordinator(
        &kraken,
        SourcePlan::from_source(Some(glow), 2),
        store.clone(),
        &board,
        2,
    );

    coord.run_cycle(at(13, 0)).await;

    let elec = coord.series(&electricity_meter().key()).unwrap();
    let tail: Vec<(i64, f64, ReadingSource)> = elec
        .readings
        .iter()
        .skip(3)
        .map(|r| (r.start_ts_ms_utc, r.value, r.source))
        .collect();
    assert_eq!(
        tail,
        vec![
            (at(11, 30), 1.0, ReadingSource::Primary),
            (at(12, 0), 0.5, ReadingSource::Secondary),
            (at(12, 30), 0.5, ReadingSource::Secondary),
        ]
    );
    assert_eq!(
        sums(&store, ELEC_ID),
        vec![(at(10, 0), 2.0), (at(11, 0), 4.0), (at(12, 0), 5.0)]
    );

    let gas = coord.series(&gas_meter().key()).unwrap();
    assert_eq!(gas.readings.len(), 2);
    assert_eq!(
        sums(&store, "meterstat_g4_0099_gas_history"),
        vec![(at(10, 0), 4.0)]
    );
}

#[tokio::test]
async fn failing_meter_keeps_stale_series_without_affecting_siblings() {
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter(), gas_meter()]));
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0]);
    kraken.set_half_hours("m-gas", at(10, 0), &[2.0, 2.0]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store.clone(), &board, 2);

    coord.run_cycle(at(12, 0)).await;

    kraken.fail_meter("m-gas", true);
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0, 1.0, 1.0]);
    let report = coord.run_cycle(at(13, 0)).await;

    assert_eq!(report.refreshed(), 1);
    assert_eq!(report.failed(), 1);
    let failed = report
        .outcomes
        .iter()
        .find(|outcome| outcome.key().meter_id == "m-gas")
        .unwrap();
    assert!(matches!(
        failed,
        MeterOutcome::Failed { reason, .. } if reason.contains("connection reset")
    ));

    assert_eq!(coord.series(&gas_meter().key()).unwrap().readings.len(), 2);
    assert_eq!(coord.series(&electricity_meter().key()).unwrap().readings.len(), 4);

    let snapshot = board.snapshot();
    let gas = snapshot
        .meters
        .iter()
        .find(|meter| meter.meter_id == "m-gas")
        .unwrap();
    let elec = snapshot
        .meters
        .iter()
        .find(|meter| meter.meter_id == "m-elec")
        .unwrap();
    assert!(gas.stale);
    assert_eq!(gas.current_value, Some(4.0));
    assert!(!elec.stale);
    assert_eq!(elec.current_value, Some(4.0));
}

#[tokio::test]
async fn failed_reauthentication_aborts_the_cycle() {
    let mut fake = FakeKraken::new(vec![electricity_meter()]);
    fake.reject_login = true;
    fake.session_valid = AtomicBool::new(false);
    let kraken = Arc::new(fake);
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store.clone(), &board, 2);

    let report = coord.run_cycle(at(12, 0)).await;

    assert!(report.auth_failed);
    assert!(report.outcomes.is_empty());
    assert_eq!(kraken.reauth_calls.load(Ordering::SeqCst), 1);
    assert!(kraken.window_starts_for("m-elec").is_empty());
    assert!(sums(&store, ELEC_ID).is_empty());
}

#[tokio::test]
async fn expired_session_is_renewed_before_fetching() {
    let kraken = Arc::new(FakeKraken::new(vec![electricity_meter()]));
    kraken.session_valid.store(false, Ordering::SeqCst);
    kraken.set_half_hours("m-elec", at(10, 0), &[1.0, 1.0]);
    let store = Arc::new(Mutex::new(SqliteStatisticsStore::open_in_memory().unwrap()));
    let board = ReadoutBoard::new();
    let mut coord = coordinator(&kraken, SourcePlan::PrimaryOnly, store, &board, 2);

    let report = coord.run_cycle(at(12, 0)).await;

    assert!(!report.auth_failed);
    assert_eq!(kraken.reauth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.refreshed(), 1);
}
