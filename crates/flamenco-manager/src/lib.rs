//! The Flamenco Manager job/task scheduling engine: Task Scheduler, Task
//! State Machine, Failure & Blocklist Policy, Timeout Detector, Farm Status
//! Aggregator, and Event Bus, all built on [`flamenco_storage::Store`].

pub mod blocklist;
pub mod config;
pub mod event;
pub mod farm_status;
pub mod flag;
pub mod scheduler;
pub mod state_machine;
pub mod timeout;

pub use config::{Config, ConfigBuilder};
pub use event::{Broker, Event, Forwarder};
pub use flag::ShutdownFlag;

use std::sync::Arc;

use flamenco_storage::Store;

/// Everything the engine needs to run: the store, the event broker, and
/// the configured tunables. Periodic loops (`timeout::run`,
/// `farm_status::run`) and the HTTP surface (not part of this crate, §1)
/// all share one `Engine`.
pub struct Engine {
    pub store: Arc<Store>,
    pub broker: Arc<Broker>,
    pub config: Config,
}

impl Engine {
    pub fn new(store: Arc<Store>, config: Config) -> Self {
        Self {
            store,
            broker: Arc::new(Broker::new()),
            config,
        }
    }

    /// Request work for `worker_id`, broadcasting the resulting task-update
    /// event on success.
    pub async fn request_work(
        &self,
        worker_id: flamenco_core::Id,
    ) -> flamenco_core::Result<Option<flamenco_core::Task>> {
        let assigned = scheduler::assign_task(&self.store, worker_id).await?;
        Ok(assigned.map(|(task, events)| {
            for event in events {
                self.broker.broadcast(event);
            }
            task
        }))
    }

    /// Report that `worker_id` completed `task_id` successfully.
    pub async fn report_task_completed(
        &self,
        task_id: flamenco_core::Id,
    ) -> flamenco_core::Result<()> {
        let mut txn = self.store.begin_write().await?;
        let events = state_machine::change_task_status(
            txn.conn(),
            task_id,
            flamenco_core::TaskStatus::Completed,
            "Task completed",
        )
        .await?;
        txn.commit().await?;

        for event in events {
            self.broker.broadcast(event);
        }
        Ok(())
    }

    /// Report that `worker_id` failed `task_id`, running the blocklist
    /// policy (§4.4) before deciding the task's next status.
    pub async fn report_task_failed(
        &self,
        task_id: flamenco_core::Id,
        worker_id: flamenco_core::Id,
    ) -> flamenco_core::Result<()> {
        let mut txn = self.store.begin_write().await?;
        let events = blocklist::report_task_failure(
            txn.conn(),
            task_id,
            worker_id,
            self.config.blocklist_threshold,
            self.config.soft_fail_threshold,
        )
        .await?;
        txn.commit().await?;

        for event in events {
            self.broker.broadcast(event);
        }
        Ok(())
    }

    /// Worker sign-off: requeue (or pause) every task it currently holds
    /// active (§4.4).
    pub async fn requeue_active_tasks_of_worker(
        &self,
        worker_id: flamenco_core::Id,
        reason: &str,
    ) -> flamenco_core::Result<()> {
        let mut txn = self.store.begin_write().await?;
        let events =
            blocklist::requeue_active_tasks_of_worker(txn.conn(), worker_id, reason).await?;
        txn.commit().await?;

        for event in events {
            self.broker.broadcast(event);
        }
        Ok(())
    }

    /// Spawn the periodic loops (timeout detector, farm status
    /// aggregator). Returns the [`ShutdownFlag`] the caller should raise on
    /// shutdown; loops exit within one tick of it being raised (§4.5).
    pub fn spawn_background_loops(&self) -> ShutdownFlag {
        let shutdown = ShutdownFlag::new();

        tokio::spawn(timeout::run(
            self.store.clone(),
            self.broker.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(farm_status::run(
            self.store.clone(),
            self.broker.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));

        shutdown
    }
}
