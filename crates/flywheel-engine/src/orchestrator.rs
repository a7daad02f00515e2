use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use flywheel_core::config::EngineConfig;
use flywheel_core::dispatch::{ExecutionTransport, WorkerCoordinator};
use flywheel_core::ids::{CycleId, JobId};
use flywheel_store::cycles::{CyclePhase, CycleRepo, CycleRow};
use flywheel_store::jobs::{JobRepo, JobRow, JobStatus, NewJob};
use flywheel_store::tasks::{TaskRepo, TaskRow, TaskStatus};
use flywheel_store::Database;

use crate::broadcaster::Broadcaster;
use crate::error::EngineError;
use crate::executor::{ExecutionScope, SessionExecutor};
use crate::prompts;

/// Caller-supplied configuration for a new job.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobConfig {
    pub repo_owner: String,
    pub repo_name: String,
    pub base_branch: String,
    pub request_doc: String,
    #[serde(default)]
    pub working_branch: Option<String>,
    #[serde(default)]
    pub max_cycles: Option<u32>,
    #[serde(default)]
    pub time_limit_minutes: Option<u32>,
    #[serde(default)]
    pub max_parallel_tasks: Option<u32>,
}

/// Read projection: a job with its cycles.
#[derive(Clone, Debug, Serialize)]
pub struct JobWithCycles {
    pub job: JobRow,
    pub cycles: Vec<CycleRow>,
}

/// Read projection: a cycle with its tasks.
#[derive(Clone, Debug, Serialize)]
pub struct CycleWithTasks {
    pub cycle: CycleRow,
    pub tasks: Vec<TaskRow>,
}

/// One in-process loop. The token is the cooperative cancellation flag;
/// the join handle lets cancel_job await the loop's termination.
struct ActiveLoop {
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

enum CycleOutcome {
    /// Move on to the next cycle.
    Continue,
    /// Discovery found nothing (or failed) — the job is done.
    NoFurtherWork,
    /// Cancellation was observed at a phase boundary.
    Cancelled,
}

/// The orchestration engine: owns the job state machine, the per-job loop
/// registry and the cycle phase machine. One instance per process is the
/// normal arrangement, but nothing here is global — tests run several.
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    jobs: JobRepo,
    cycles: CycleRepo,
    tasks: TaskRepo,
    executor: SessionExecutor,
    broadcaster: Arc<Broadcaster>,
    config: EngineConfig,
    active: DashMap<JobId, Arc<ActiveLoop>>,
}

impl JobEngine {
    pub fn new(
        db: Database,
        coordinator: Arc<dyn WorkerCoordinator>,
        transport: Arc<dyn ExecutionTransport>,
        broadcaster: Arc<Broadcaster>,
        config: EngineConfig,
    ) -> Self {
        let executor = SessionExecutor::new(
            coordinator,
            transport,
            db.clone(),
            Arc::clone(&broadcaster),
            config.worker_call_timeout,
        );

        Self {
            inner: Arc::new(EngineInner {
                jobs: JobRepo::new(db.clone()),
                cycles: CycleRepo::new(db.clone()),
                tasks: TaskRepo::new(db),
                executor,
                broadcaster,
                config,
                active: DashMap::new(),
            }),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.inner.broadcaster
    }

    /// Whether an in-process loop currently exists for the job.
    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.inner.active.contains_key(job_id)
    }

    /// Validate the config and persist a new job in status `pending`,
    /// cycle 0. The default working branch carries a short suffix of the
    /// job id so concurrent jobs against one repository never collide.
    #[instrument(skip(self, config), fields(user_id))]
    pub fn create_job(&self, user_id: &str, config: JobConfig) -> Result<JobRow, EngineError> {
        for (field, value) in [
            ("repo_owner", &config.repo_owner),
            ("repo_name", &config.repo_name),
            ("base_branch", &config.base_branch),
            ("request_doc", &config.request_doc),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::Validation(format!("{field} is required")));
            }
        }

        let id = JobId::new();
        let working_branch = config
            .working_branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| format!("flywheel/{}", id.short()));

        let job = self.inner.jobs.create(&NewJob {
            id,
            user_id: user_id.to_string(),
            repo_owner: config.repo_owner,
            repo_name: config.repo_name,
            base_branch: config.base_branch,
            working_branch,
            request_doc: config.request_doc,
            max_cycles: config.max_cycles,
            time_limit_minutes: config.time_limit_minutes,
            max_parallel_tasks: config
                .max_parallel_tasks
                .unwrap_or(self.inner.config.max_parallel_tasks as u32)
                .max(1),
        })?;

        info!(job_id = %job.id, "job created");
        Ok(job)
    }

    /// Start (or resume) a job's loop. Returns immediately; the loop runs
    /// as a supervised background task whose failure is captured by a
    /// cleanup step, never as an unhandled panic.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn start_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        let job = self.inner.jobs.get(job_id)?;

        if self.inner.active.contains_key(job_id) {
            return Err(EngineError::AlreadyRunning(job_id.clone()));
        }
        if !matches!(job.status, JobStatus::Pending | JobStatus::Paused) {
            return Err(EngineError::InvalidState {
                job: job_id.clone(),
                status: job.status,
            });
        }
        let resumed = job.status == JobStatus::Paused;

        let active = Arc::new(ActiveLoop {
            cancel: CancellationToken::new(),
            join: Mutex::new(None),
        });

        // The registry entry is the single-loop-per-job lock: of two
        // concurrent starts, exactly one claims the vacant slot.
        match self.inner.active.entry(job_id.clone()) {
            dashmap::Entry::Occupied(_) => {
                return Err(EngineError::AlreadyRunning(job_id.clone()));
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&active));
            }
        }

        if let Err(e) = self.inner.jobs.mark_started(job_id) {
            self.inner.active.remove(job_id);
            return Err(e.into());
        }

        self.inner.broadcaster.start_job(job_id);
        if resumed {
            self.inner.broadcaster.broadcast_job_resumed(job_id);
        } else {
            self.inner.broadcaster.broadcast_job_started(job_id);
        }

        let inner = Arc::clone(&self.inner);
        let cancel = active.cancel.clone();
        let loop_job_id = job_id.clone();
        let registry_entry = Arc::clone(&active);

        let handle = tokio::spawn(async move {
            // Supervise the loop: a panic is folded into the same cleanup
            // path as an error, so the registry entry never leaks.
            let result = AssertUnwindSafe(inner.run_orchestration_loop(&loop_job_id, &cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(EngineError::Internal("orchestration loop panicked".into())));

            if let Err(e) = result {
                error!(job_id = %loop_job_id, error = %e, "orchestration loop failed");
                if let Err(persist) = inner.jobs.record_error(&loop_job_id, &e.to_string()) {
                    error!(job_id = %loop_job_id, error = %persist, "failed to persist job error");
                }
                inner.broadcaster.broadcast_job_error(&loop_job_id, &e.to_string());
                inner.broadcaster.end_job(&loop_job_id, "error");
            }
            inner
                .active
                .remove_if(&loop_job_id, |_, entry| Arc::ptr_eq(entry, &registry_entry));
        });
        *active.join.lock() = Some(handle);

        Ok(())
    }

    /// Request a pause. The flag is observed at phase boundaries only, so
    /// this returns before the loop has necessarily stopped; tasks already
    /// dispatched run to completion.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn pause_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        let active = self
            .inner
            .active
            .get(job_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::NotRunning(job_id.clone()))?;

        active.cancel.cancel();
        self.inner.jobs.update_status(job_id, JobStatus::Paused)?;
        self.inner.broadcaster.broadcast_job_paused(job_id);
        Ok(())
    }

    /// Resume a paused job; delegates to start_job.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn resume_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        let job = self.inner.jobs.get(job_id)?;
        if job.status != JobStatus::Paused {
            return Err(EngineError::InvalidState {
                job: job_id.clone(),
                status: job.status,
            });
        }
        self.start_job(job_id)
    }

    /// Cancel a job: set the flag, await the loop's termination (its error,
    /// if any, was already handled by the supervisor), force the terminal
    /// status and end the broadcast registration.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<(), EngineError> {
        let (_, active) = self
            .inner
            .active
            .remove(job_id)
            .ok_or_else(|| EngineError::NotRunning(job_id.clone()))?;

        active.cancel.cancel();
        let handle = active.join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.jobs.update_status(job_id, JobStatus::Cancelled)?;
        self.inner.broadcaster.end_job(job_id, "cancelled");
        Ok(())
    }

    // -- read projections --

    pub fn get_job(&self, job_id: &JobId) -> Result<JobRow, EngineError> {
        Ok(self.inner.jobs.get(job_id)?)
    }

    pub fn get_job_with_cycles(&self, job_id: &JobId) -> Result<JobWithCycles, EngineError> {
        let job = self.inner.jobs.get(job_id)?;
        let cycles = self.inner.cycles.list_for_job(job_id)?;
        Ok(JobWithCycles { job, cycles })
    }

    pub fn get_cycle_with_tasks(&self, cycle_id: &CycleId) -> Result<CycleWithTasks, EngineError> {
        let cycle = self.inner.cycles.get(cycle_id)?;
        let tasks = self.inner.tasks.list_for_cycle(cycle_id)?;
        Ok(CycleWithTasks { cycle, tasks })
    }

    pub fn list_jobs(&self, user_id: Option<&str>) -> Result<Vec<JobRow>, EngineError> {
        Ok(self.inner.jobs.list(user_id)?)
    }
}

impl EngineInner {
    /// The job's main loop. Reloads the row at every decision point — the
    /// store, not the in-memory snapshot, is the source of truth.
    async fn run_orchestration_loop(
        &self,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let job = self.jobs.get(job_id)?;

        if job.current_cycle == 0 {
            self.run_setup(&job).await?;
            // Advance before honoring cancellation so setup never reruns,
            // even when the pause landed mid-setup.
            self.jobs.set_current_cycle(job_id, 1)?;
            if cancel.is_cancelled() {
                info!(job_id = %job_id, "cancelled during setup");
                return Ok(());
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let job = self.jobs.get(job_id)?;
            if let Some(reason) = termination_reason(&job) {
                self.finish_job(&job, &reason)?;
                return Ok(());
            }

            match self.run_cycle(&job, cancel).await? {
                CycleOutcome::Cancelled => return Ok(()),
                CycleOutcome::NoFurtherWork => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    let job = self.jobs.get(job_id)?;
                    self.finish_job(&job, "no further work discovered")?;
                    return Ok(());
                }
                CycleOutcome::Continue => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    self.jobs.set_current_cycle(job_id, job.current_cycle + 1)?;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.inter_cycle_delay) => {}
                    }
                }
            }
        }
    }

    /// The one-time setup session: prepare the working branch and store the
    /// request document. A dispatch-level failure here is logged and the
    /// loop proceeds — the discovery call surfaces real damage on its own.
    async fn run_setup(&self, job: &JobRow) -> Result<(), EngineError> {
        info!(job_id = %job.id, "running setup");
        let outcome = self
            .executor
            .run(&ExecutionScope::for_job(&job.id), &prompts::setup_prompt(job))
            .await?;
        if !outcome.is_completed() {
            warn!(job_id = %job.id, error = ?outcome.error, "setup session failed, continuing");
        }
        Ok(())
    }

    /// One discovery → execution → convergence → update iteration.
    /// Cancellation is consulted between phases, never inside one.
    async fn run_cycle(
        &self,
        job: &JobRow,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, EngineError> {
        let cycle = match self.cycles.get_by_number(&job.id, job.current_cycle)? {
            // Crash or pause landed between completing the cycle and moving
            // the counter: nothing left to redo for this number.
            Some(existing) if existing.phase == CyclePhase::Completed => {
                return Ok(CycleOutcome::Continue);
            }
            // Resumed mid-cycle: rerun from discovery on the same row.
            Some(existing) => existing,
            None => self.cycles.create(&job.id, job.current_cycle)?,
        };
        self.broadcaster.broadcast_cycle_started(&job.id, cycle.cycle_number);

        // -- discovery --
        let discovery = self
            .executor
            .run(
                &ExecutionScope::for_cycle(&job.id, cycle.cycle_number),
                &prompts::discovery_prompt(job),
            )
            .await?;
        let discovered = if discovery.is_completed() {
            prompts::parse_discovered_tasks(discovery.summary.as_deref().unwrap_or(""))
        } else {
            // A failed discovery is indistinguishable from an empty one;
            // both end the job as completed.
            Vec::new()
        };

        if discovered.is_empty() {
            self.cycles.complete(&cycle.id)?;
            self.broadcaster
                .broadcast_cycle_completed(&job.id, cycle.cycle_number, None);
            return Ok(CycleOutcome::NoFurtherWork);
        }

        // Leftover rows from an interrupted run keep their numbers; new
        // tasks continue after them.
        let offset = self.tasks.list_for_cycle(&cycle.id)?.len() as u32;
        for (i, new_task) in discovered.iter().enumerate() {
            self.tasks
                .create(&cycle.id, &job.id, offset + i as u32 + 1, new_task)?;
        }
        let descriptions: Vec<&str> = discovered.iter().map(|t| t.description.as_str()).collect();
        self.broadcaster.broadcast_cycle_tasks_discovered(
            &job.id,
            cycle.cycle_number,
            serde_json::json!(descriptions),
        );

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        // -- execution --
        self.cycles.set_phase(&cycle.id, CyclePhase::Execution)?;
        self.broadcaster
            .broadcast_cycle_phase(&job.id, cycle.cycle_number, "execution");

        let all_tasks = self.tasks.list_for_cycle(&cycle.id)?;
        let total = all_tasks.len() as u32;
        let to_run: Vec<TaskRow> = all_tasks
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect();
        let launched = to_run.len() as u32;
        self.cycles.set_counts(&cycle.id, total, launched, 0, 0)?;

        self.execute_tasks(job, cycle.cycle_number, to_run).await?;

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        // -- convergence (no network) --
        self.cycles.set_phase(&cycle.id, CyclePhase::Convergence)?;
        self.broadcaster
            .broadcast_cycle_phase(&job.id, cycle.cycle_number, "convergence");

        let rows = self.tasks.list_for_cycle(&cycle.id)?;
        let completed = rows.iter().filter(|t| t.status == TaskStatus::Completed).count() as u32;
        let failed = rows.iter().filter(|t| t.status == TaskStatus::Failed).count() as u32;
        self.cycles
            .set_counts(&cycle.id, rows.len() as u32, launched, completed, failed)?;

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        // -- update --
        self.cycles.set_phase(&cycle.id, CyclePhase::Update)?;
        self.broadcaster
            .broadcast_cycle_phase(&job.id, cycle.cycle_number, "update");

        let update = self
            .executor
            .run(
                &ExecutionScope::for_cycle(&job.id, cycle.cycle_number),
                &prompts::update_prompt(job, cycle.cycle_number, &rows),
            )
            .await?;
        let summary = if update.is_completed() { update.summary } else { None };
        if let Some(summary) = &summary {
            self.cycles.set_summary(&cycle.id, summary)?;
            self.jobs.set_task_list(&job.id, summary)?;
        } else {
            warn!(job_id = %job.id, cycle = cycle.cycle_number, "update session failed, summary not stored");
        }
        self.broadcaster
            .broadcast_cycle_completed(&job.id, cycle.cycle_number, summary.as_deref());

        self.cycles.complete(&cycle.id)?;
        Ok(CycleOutcome::Continue)
    }

    /// Fan the cycle's tasks out across the worker pool, bounded by the
    /// job's parallelism, and wait for every dispatch to settle. One task
    /// failing never cancels its siblings; store failures are collected and
    /// surfaced only after the fan-in completes.
    async fn execute_tasks(
        &self,
        job: &JobRow,
        cycle_number: u32,
        to_run: Vec<TaskRow>,
    ) -> Result<(), EngineError> {
        let width = (job.max_parallel_tasks as usize).max(1);

        let results: Vec<Result<(), EngineError>> = futures::stream::iter(
            to_run.into_iter().map(|task| async move {
                self.tasks.mark_running(&task.id)?;
                self.broadcaster
                    .broadcast_task_started(&job.id, cycle_number, &task.id, &task.description);

                let scope =
                    ExecutionScope::for_task(&job.id, cycle_number, &task.id, task.context.clone());
                match self.executor.run(&scope, &prompts::task_prompt(job, &task)).await {
                    Ok(outcome) if outcome.is_completed() => {
                        self.broadcaster.broadcast_task_completed(
                            &job.id,
                            cycle_number,
                            &task.id,
                            outcome.summary.as_deref().unwrap_or("completed"),
                        );
                    }
                    Ok(outcome) => {
                        self.broadcaster.broadcast_task_failed(
                            &job.id,
                            cycle_number,
                            &task.id,
                            outcome.error.as_deref().unwrap_or("failed"),
                        );
                    }
                    Err(e) => {
                        // A rejected dispatch settles exactly like a failed
                        // task; the siblings keep running.
                        warn!(task_id = %task.id, error = %e, "task dispatch rejected");
                        self.tasks.mark_failed(&task.id, &e.to_string())?;
                        self.broadcaster.broadcast_task_failed(
                            &job.id,
                            cycle_number,
                            &task.id,
                            &e.to_string(),
                        );
                    }
                }
                Ok(())
            }),
        )
        .buffer_unordered(width)
        .collect()
        .await;

        for result in results {
            result?;
        }
        Ok(())
    }

    /// Terminal success: persist, emit the completion summary, end the
    /// broadcast registration.
    fn finish_job(&self, job: &JobRow, reason: &str) -> Result<(), EngineError> {
        self.jobs.complete(&job.id)?;

        let cycles = self.cycles.list_for_job(&job.id)?;
        let cycles_run = cycles.len() as u32;
        let total_tasks: u32 = cycles.iter().map(|c| c.tasks_discovered).sum();

        info!(job_id = %job.id, cycles_run, total_tasks, reason, "job completed");
        self.broadcaster
            .broadcast_job_completed(&job.id, cycles_run, total_tasks, reason);
        self.broadcaster.end_job(&job.id, reason);
        Ok(())
    }
}

/// Evaluate the job's termination conditions against wall clock and cycle
/// counter. `started_at` survives pause/resume, so the time limit measures
/// the job's whole life, not the latest resume.
fn termination_reason(job: &JobRow) -> Option<String> {
    if let Some(max) = job.max_cycles {
        if job.current_cycle > max {
            return Some(format!("max cycles ({max}) reached"));
        }
    }

    if let (Some(limit), Some(started)) = (job.time_limit_minutes, job.started_at.as_deref()) {
        if let Ok(start) = DateTime::parse_from_rfc3339(started) {
            let elapsed = Utc::now().signed_duration_since(start.with_timezone(&Utc));
            if elapsed.num_minutes() >= i64::from(limit) {
                return Some(format!("time limit ({limit} min) reached"));
            }
        }
    }

    None
}
