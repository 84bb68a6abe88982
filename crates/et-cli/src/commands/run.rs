//! Run command: the tracking daemon.
//!
//! Owns the engine for one database. Host events are dispatched on a single
//! task so triggers never interleave; the health monitor runs on its own
//! task with its own connection and only talks back through wake requests.

use std::sync::Arc;

use anyhow::{Context, Result};
use et_core::EpochStore;
use et_db::Database;
use et_engine::{
    Clock, CommandIdleSource, Engine, HealthMonitor, HostEvent, IdleSource, SystemClock,
    TokioHost, Trigger,
};
use tokio::sync::watch;

use super::util::try_lock;
use crate::Config;

pub fn run(config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run_daemon(config))
}

async fn run_daemon(config: &Config) -> Result<()> {
    let lock_path = config.lock_path();
    let Some(_lock) = try_lock(&lock_path)? else {
        anyhow::bail!(
            "an et daemon is already running against {}",
            config.database_path.display()
        );
    };

    let store: Arc<dyn EpochStore> = Arc::new(
        Database::open(&config.database_path)
            .with_context(|| format!("failed to open {}", config.database_path.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let source: Arc<dyn IdleSource> = Arc::new(CommandIdleSource::new(
        config.idle.clone(),
        config.engine.idle_threshold_secs,
    ));
    let (host, mut events) =
        TokioHost::new(Arc::clone(&source)).context("failed to create trigger host")?;
    let host = Arc::new(host);

    let engine = Engine::new(
        config.engine.clone(),
        store,
        Arc::clone(&clock),
        source,
        host.clone(),
    )
    .context("invalid engine configuration")?;

    // A failed first start is retried when the health monitor sees no
    // liveness and requests a wake.
    if engine.initialize().await.is_err() {
        tracing::warn!("initial startup failed, waiting for a wake request");
    }

    let monitor_store: Arc<dyn EpochStore> = Arc::new(
        Database::open_read_only(&config.database_path)
            .context("failed to open health monitor store")?,
    );
    let monitor = HealthMonitor::new(monitor_store, clock, config.engine.stale_threshold_secs)
        .with_waker(host.clone());
    let (stop, shutdown) = watch::channel(false);
    let every = config.engine.tick_interval();
    let supervisor = tokio::spawn(async move { monitor.supervise(every, shutdown).await });

    tracing::info!(database = %config.database_path.display(), "daemon started");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                dispatch(&engine, event).await;
            }
            signal = &mut ctrl_c => {
                signal.context("failed to listen for shutdown signal")?;
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    host.shutdown();
    let _ = stop.send(true);
    if let Err(err) = supervisor.await {
        tracing::warn!(error = %err, "health supervisor task failed");
    }
    engine
        .shutdown()
        .await
        .context("failed to flush state on shutdown")?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Maps a host event to the engine trigger it causes, if any.
const fn trigger_for(event: HostEvent) -> Option<Trigger> {
    match event {
        HostEvent::Tick => Some(Trigger::PeriodicTick),
        HostEvent::BusyStateChanged(state) => Some(Trigger::BusyStateChanged(state)),
        HostEvent::Wake => None,
    }
}

async fn dispatch(engine: &Engine, event: HostEvent) {
    let Some(trigger) = trigger_for(event) else {
        // Wake requests re-run startup; a no-op when already initialized.
        if engine.initialize().await.is_ok() {
            tracing::debug!("wake handled");
        }
        return;
    };
    // Failures are logged by the engine and retried on the next trigger.
    if let Ok(outcome) = engine.reconcile(trigger).await {
        tracing::trace!(?outcome, "trigger handled");
    }
}
