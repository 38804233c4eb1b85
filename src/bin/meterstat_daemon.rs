use std::sync::{Arc, Mutex};

use meterstat::{
    config_from_env, init_logging, log_app_bind, log_app_start, log_sources_selected,
    logging_config_from_env, readout_router, GlowmarktClient, KrakenClient, ReadoutBoard,
    RefreshCoordinator, RefreshSettings, SecondaryReadingSource, SourcePlan,
    SqliteStatisticsStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("meterstat_daemon", &logging_cfg);

    let config = config_from_env()?;
    log_sources_selected(&config);

    let kraken = Arc::new(KrakenClient::new(
        config.account.clone(),
        config.http_timeout_ms,
    )?);
    kraken.login().await?;

    // The blocking client owns its own runtime thread and cannot be built on
    // an async worker.
    let secondary: Option<Arc<dyn SecondaryReadingSource>> = match config.secondary.clone() {
        Some(credentials) => {
            let timeout_ms = config.http_timeout_ms;
            let client = tokio::task::spawn_blocking(move || {
                GlowmarktClient::new(credentials, timeout_ms)
            })
            .await??;
            Some(Arc::new(client))
        }
        None => None,
    };
    let sources = SourcePlan::from_source(secondary, config.secondary_workers);

    let store = SqliteStatisticsStore::open(&config.store_path)?;
    let board = ReadoutBoard::new();

    let coordinator = RefreshCoordinator::new(
        kraken.clone(),
        kraken,
        sources,
        Arc::new(Mutex::new(store)),
        board.clone(),
        RefreshSettings::from_config(&config),
    );
    tokio::spawn(coordinator.run_forever());

    let app = readout_router(Arc::new(board));
    let listener = tokio::net::TcpListener::bind(config.readout_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
