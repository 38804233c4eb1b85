//! meterstat core crate.
//!
//! Current implemented scope:
//! - paginated primary interval fetch and best-effort secondary enrichment
//! - merge/dedup, fetch window planning and hourly aggregation
//! - checkpointed cumulative statistics import backed by SQLite
//! - hourly refresh orchestration and the per-meter readout surface

mod config;
mod glowmarkt;
mod hourly;
mod kraken;
mod merge;
mod observability;
mod orchestrator;
mod primary;
mod readings;
mod readout;
mod secondary;
mod session;
mod statistics;
mod store;
mod window;

pub use config::{
    config_from_env, config_from_lookup, AppConfig, ConfigError, Credentials,
    DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_READOUT_ADDR, DEFAULT_SECONDARY_WORKERS, DEFAULT_STORE_PATH,
};
pub use glowmarkt::{GlowmarktClient, ELECTRICITY_CONSUMPTION_CLASSIFIER, GLOWMARKT_BASE_URL};
pub use hourly::aggregate_hourly;
pub use kraken::{KrakenClient, KRAKEN_GRAPHQL_URL};
pub use merge::merge_readings;
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_sources_selected, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError,
};
pub use orchestrator::{
    CycleReport, MeterOutcome, PipelineError, RefreshCoordinator, RefreshSettings,
    REFRESH_INTERVAL,
};
pub use primary::{
    fetch_interval_readings, ConsumptionPage, ConsumptionPageSource, FetchConfig, FetchError,
    PageRequest, PrimaryFetch, RawConsumptionRecord,
};
pub use readings::{
    floor_to_hour_ms, format_rfc3339_ms, parse_rfc3339_ms, CumulativeStatisticPoint, FetchWindow,
    HourlyBucket, IntervalReading, MeterInfo, MeterKey, MeterSeries, MeterType, ReadingSource,
    DAY_MS, HALF_HOUR_MS, HOUR_MS,
};
pub use readout::{
    latest_day_total, readout_router, render_readout_html, MeterReadout, ReadoutBoard,
    ReadoutSnapshot, ReadoutSource, READOUT_HEADERS,
};
pub use secondary::{
    fetch_secondary, secondary_since, try_fetch_secondary, RawSecondarySample,
    SecondaryReadingSource, SecondarySourceError, SecondaryWorkerPool, SourcePlan,
};
pub use session::{AccountSession, AuthError};
pub use statistics::{
    import_cumulative, resolve_checkpoint, resolve_override, statistic_id_for, ImportReport,
    PersistenceError, StatisticIdError, StatisticMetadata, StatisticsStore,
    CHECKPOINT_LOOKBACK_DAYS, STATISTIC_SOURCE, STATISTIC_UNIT,
};
pub use store::SqliteStatisticsStore;
pub use window::{
    plan_fetch_window, warm_lookback_start, BackfillDays, BackfillDaysError,
    DEFAULT_BACKFILL_DAYS, MAX_BACKFILL_DAYS, WARM_LOOKBACK_DAYS,
};
