use std::time::Duration;

/// Tunables for the scheduling engine (§6).
#[derive(Clone, Debug)]
pub struct Config {
    /// Max silence on an `active` task before the timeout detector fails it.
    pub task_timeout: Duration,

    /// Max silence from a worker before the timeout detector marks it
    /// `error` and requeues its active tasks.
    pub worker_timeout: Duration,

    /// Per `(job, worker, task-type)` failures before the pair is
    /// blocklisted.
    pub blocklist_threshold: u64,

    /// Distinct workers failing a task before it hard-fails instead of
    /// soft-failing.
    pub soft_fail_threshold: u64,

    /// Interval between farm-status polls.
    pub poll_wait: Duration,

    /// Interval between timeout-detector passes.
    pub check_interval: Duration,

    /// Grace period on startup before the first timeout pass, long enough
    /// to let workers reconnect after a Manager restart.
    pub initial_sleep: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(10 * 60),
            worker_timeout: Duration::from_secs(60),
            blocklist_threshold: 3,
            soft_fail_threshold: 3,
            poll_wait: Duration::from_secs(5),
            check_interval: Duration::from_secs(60),
            initial_sleep: Duration::from_secs(3 * 60),
        }
    }
}

impl Config {
    /// Start from the defaults and override individual tunables with the
    /// chained `with_*` setters below.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Consuming builder over [`Config`], for callers (e.g. `flamenco-daemon`'s
/// CLI) that only want to override a handful of tunables read once at
/// startup (§13).
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: Config::default() }
    }

    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.config.task_timeout = task_timeout;
        self
    }

    pub fn with_worker_timeout(mut self, worker_timeout: Duration) -> Self {
        self.config.worker_timeout = worker_timeout;
        self
    }

    pub fn with_blocklist_threshold(mut self, blocklist_threshold: u64) -> Self {
        self.config.blocklist_threshold = blocklist_threshold;
        self
    }

    pub fn with_soft_fail_threshold(mut self, soft_fail_threshold: u64) -> Self {
        self.config.soft_fail_threshold = soft_fail_threshold;
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.config.poll_wait = poll_wait;
        self
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.config.check_interval = check_interval;
        self
    }

    pub fn with_initial_sleep(mut self, initial_sleep: Duration) -> Self {
        self.config.initial_sleep = initial_sleep;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
