use std::sync::Arc;

use gapwatch::{
    app_paths_from_env, collector_config_from_env, init_logging, log_app_bind, log_app_config,
    log_app_start, log_app_stop, logging_config_from_env, status_router, CollectorStatusSource,
    CsvPointSource, GapAwareCollector, IndicatorEngine, Scheduler, SqliteIndicatorStore,
    StatusSource, SystemClock,
};
use tokio_util::sync::CancellationToken;
use tracing::error;

const APP: &str = "gapwatch_collector";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(APP, &logging_cfg);

    let cfg = collector_config_from_env();
    cfg.validate()?;
    let paths = app_paths_from_env();
    log_app_config(APP, &cfg, &paths);

    let store = Arc::new(SqliteIndicatorStore::open(&paths.store_path)?);
    let source = Arc::new(CsvPointSource::open(&paths.csv_path)?);
    let engine = IndicatorEngine::new(cfg.signal_mode);
    let collector = Arc::new(GapAwareCollector::new(engine, source, store, cfg)?);
    let clock = Arc::new(SystemClock);

    let status: Arc<dyn StatusSource> = Arc::new(CollectorStatusSource::new(
        collector.status_reader(),
        Arc::clone(&clock),
    ));
    let scheduler = Arc::new(Scheduler::new(collector, clock));

    let cancel = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind(paths.status_addr).await?;
    log_app_bind(APP, listener.local_addr()?);

    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, status_router(status))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_app_stop(APP, "ctrl_c");
            shutdown.cancel();
        }
    });

    // Returns once cancelled, or early if startup cannot read the store.
    let scheduled = scheduler.run(cancel.clone()).await;
    cancel.cancel();
    server_task.await??;

    if let Err(err) = scheduled {
        error!(component = APP, event = "app.scheduler_failed", error = %err);
        return Err(err.into());
    }

    Ok(())
}
