use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use flamenco_manager::{Config, Engine};
use flamenco_storage::{Store, StoreOptions};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// `flamanager`: runs the Flamenco Manager scheduling engine against a
/// SQLite database, with no HTTP surface of its own (§0).
#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Apply pending migrations during startup.
    #[arg(long)]
    migrate: bool,

    #[arg(long, env = "FLAMENCO_TASK_TIMEOUT", value_parser = humantime::parse_duration, default_value = "10min")]
    task_timeout: Duration,

    #[arg(long, env = "FLAMENCO_WORKER_TIMEOUT", value_parser = humantime::parse_duration, default_value = "1min")]
    worker_timeout: Duration,

    #[arg(long, env = "FLAMENCO_BLOCKLIST_THRESHOLD", default_value_t = 3)]
    blocklist_threshold: u64,

    #[arg(long, env = "FLAMENCO_SOFT_FAIL_THRESHOLD", default_value_t = 3)]
    soft_fail_threshold: u64,

    #[arg(long, env = "FLAMENCO_POLL_WAIT", value_parser = humantime::parse_duration, default_value = "5s")]
    poll_wait: Duration,

    #[arg(long, env = "FLAMENCO_CHECK_INTERVAL", value_parser = humantime::parse_duration, default_value = "1min")]
    check_interval: Duration,

    #[arg(long, env = "FLAMENCO_INITIAL_SLEEP", value_parser = humantime::parse_duration, default_value = "3min")]
    initial_sleep: Duration,

    /// Interval between `PRAGMA wal_checkpoint(TRUNCATE)` passes (§4.1).
    #[arg(long, env = "FLAMENCO_CHECKPOINT_INTERVAL", value_parser = humantime::parse_duration, default_value = "5min")]
    checkpoint_interval: Duration,
}

impl Args {
    fn engine_config(&self) -> Config {
        Config::builder()
            .with_task_timeout(self.task_timeout)
            .with_worker_timeout(self.worker_timeout)
            .with_blocklist_threshold(self.blocklist_threshold)
            .with_soft_fail_threshold(self.soft_fail_threshold)
            .with_poll_wait(self.poll_wait)
            .with_check_interval(self.check_interval)
            .with_initial_sleep(self.initial_sleep)
            .build()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
        )
        .init();

    let args = Args::parse();

    let store = Store::connect(&args.database_url, StoreOptions::default())
        .await
        .context("failed to open the store")?;

    if args.migrate {
        store.migrate().await.context("failed to run migrations")?;
    }

    {
        let mut txn = store.begin_read().await.context("failed to open startup integrity check")?;
        let report = flamenco_storage::check_integrity(txn.conn())
            .await
            .context("failed to run integrity check")?;
        if !report.is_ok() {
            anyhow::bail!("refusing to serve, database failed integrity check: {:?}", report.issues);
        }
    }

    let engine = Engine::new(Arc::new(store), args.engine_config());
    let shutdown = engine.spawn_background_loops();

    let checkpoint_store = engine.store.clone();
    let checkpoint_shutdown = shutdown.clone();
    let checkpoint_interval = args.checkpoint_interval;
    tokio::spawn(async move {
        run_checkpoint_loop(checkpoint_store, checkpoint_shutdown, checkpoint_interval).await;
    });

    let signal = tokio::task::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;

            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        }

        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        anyhow::Ok(())
    });

    tracing::info!("flamanager starting up");

    signal
        .await
        .context("signal task exited early with an error")??;

    tracing::info!("got signal, shutting down");
    shutdown.raise();

    Ok(())
}

/// Periodic `PRAGMA wal_checkpoint(TRUNCATE)` pass, owned by the daemon
/// rather than `flamenco-manager` since it's process housekeeping, not
/// scheduling (§4.1 last paragraph).
async fn run_checkpoint_loop(
    store: Arc<flamenco_storage::Store>,
    shutdown: flamenco_manager::ShutdownFlag,
    interval: Duration,
) {
    let mut wait = std::pin::pin!(shutdown.wait());

    loop {
        tokio::select! {
            biased;
            _ = wait.as_mut() => return,
            _ = tokio::time::sleep(interval) => (),
        }

        let result = async {
            let mut txn = store.begin_write().await?;
            flamenco_storage::checkpoint_wal(txn.conn()).await?;
            txn.commit().await
        }
        .await;

        if let Err(err) = result {
            tracing::warn!("wal checkpoint failed: {err}");
        }
    }
}
