use std::time::Duration;

pub const DEFAULT_INTER_CYCLE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_WORKER_CALL_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 4;

/// Tunables for the orchestration loop.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Throttle between cycles so dependent services are not hammered.
    pub inter_cycle_delay: Duration,
    /// Upper bound on any single worker execution call.
    pub worker_call_timeout: Duration,
    /// Default task fan-out width for jobs that don't specify one.
    pub max_parallel_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inter_cycle_delay: DEFAULT_INTER_CYCLE_DELAY,
            worker_call_timeout: DEFAULT_WORKER_CALL_TIMEOUT,
            max_parallel_tasks: DEFAULT_MAX_PARALLEL_TASKS,
        }
    }
}
