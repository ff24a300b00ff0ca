//! Farm Status Aggregator (§4.6).

use std::sync::Arc;

use flamenco_core::{FarmStatus, JobStatus, StatusHistogram, WorkerStatus};
use flamenco_storage::Store;

use crate::config::Config;
use crate::event::{self, Broker};
use crate::flag::{ShutdownFlag, ShutdownGuard};

/// Poll the farm status every `config.poll_wait` until `shutdown` is
/// raised, broadcasting a `FarmStatus` event whenever the resolved status
/// differs from the last one emitted.
pub async fn run(store: Arc<Store>, broker: Arc<Broker>, config: Config, shutdown: ShutdownFlag) {
    let _guard = ShutdownGuard::new(&shutdown);
    let mut wait = std::pin::pin!(shutdown.wait());

    broker.broadcast(event::farm_status_update(FarmStatus::Starting));
    let mut last = FarmStatus::Starting;

    loop {
        tokio::select! {
            biased;
            _ = wait.as_mut() => return,
            _ = tokio::time::sleep(config.poll_wait) => (),
        }

        match compute_status(&store).await {
            Ok(status) => {
                if status != last {
                    broker.broadcast(event::farm_status_update(status));
                    last = status;
                }
            }
            Err(err) => tracing::warn!("farm status poll failed: {err}"),
        }
    }
}

/// One poll of the algorithm in §4.6.
pub async fn compute_status(store: &Store) -> flamenco_core::Result<FarmStatus> {
    let mut txn = store.begin_read().await?;
    let workers = flamenco_storage::summarize_worker_statuses(txn.conn()).await?;
    let jobs = flamenco_storage::summarize_job_statuses(txn.conn()).await?;
    Ok(resolve_status(&workers, &jobs))
}

/// Pure form of the §4.6 algorithm, factored out so it can be exercised
/// without a database.
fn resolve_status(
    workers: &StatusHistogram<WorkerStatus>,
    jobs: &StatusHistogram<JobStatus>,
) -> FarmStatus {
    let total_workers: u64 = workers.values().sum();
    let offline = count(workers, WorkerStatus::Offline);
    let error = count(workers, WorkerStatus::Error);

    if total_workers == 0 || offline + error == total_workers {
        return FarmStatus::Inoperative;
    }

    let any_job_active = count(jobs, JobStatus::Active) > 0;
    let any_job_queued = count(jobs, JobStatus::Queued) > 0;
    let work_available = any_job_active || any_job_queued;
    let any_awake = count(workers, WorkerStatus::Awake) > 0;
    let any_asleep = count(workers, WorkerStatus::Asleep) > 0;
    let all_asleep = !any_awake && any_asleep;

    if any_job_active && any_awake {
        FarmStatus::Active
    } else if work_available {
        FarmStatus::Waiting
    } else if all_asleep {
        FarmStatus::Asleep
    } else if !work_available {
        FarmStatus::Idle
    } else {
        tracing::warn!("farm status resolved to unknown");
        FarmStatus::Unknown
    }
}

fn count<S: Eq + std::hash::Hash>(histogram: &StatusHistogram<S>, status: S) -> u64 {
    *histogram.get(&status).unwrap_or(&0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn hist<S: Eq + std::hash::Hash + Copy>(pairs: &[(S, u64)]) -> StatusHistogram<S> {
        pairs.iter().copied().collect::<HashMap<_, _>>()
    }

    #[test]
    fn offline_and_error_only_is_inoperative() {
        let workers = hist(&[(WorkerStatus::Offline, 2), (WorkerStatus::Error, 1)]);
        let jobs = HashMap::new();
        assert_eq!(resolve_status(&workers, &jobs), FarmStatus::Inoperative);
    }

    #[test]
    fn awake_with_active_job_is_active() {
        let workers = hist(&[(WorkerStatus::Awake, 3)]);
        let jobs = hist(&[(JobStatus::Active, 1)]);
        assert_eq!(resolve_status(&workers, &jobs), FarmStatus::Active);
    }

    #[test]
    fn asleep_with_active_job_is_waiting() {
        let workers = hist(&[(WorkerStatus::Asleep, 1)]);
        let jobs = hist(&[(JobStatus::Active, 1)]);
        assert_eq!(resolve_status(&workers, &jobs), FarmStatus::Waiting);
    }
}
