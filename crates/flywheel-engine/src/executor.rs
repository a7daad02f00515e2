use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, instrument, warn};

use flywheel_core::dispatch::{
    AcquireOptions, ExecutionTransport, WorkEvent, WorkRequest, WorkStream, WorkerAssignment,
    WorkerCoordinator,
};
use flywheel_core::errors::DispatchError;
use flywheel_core::ids::{JobId, SessionId, TaskId};
use flywheel_store::tasks::TaskRepo;
use flywheel_store::Database;

use crate::broadcaster::Broadcaster;
use crate::error::EngineError;

const ACQUIRE_RETRY_ATTEMPTS: u32 = 3;
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What one session call was running on behalf of. Task-bound scopes get
/// their terminal status persisted onto the task row.
#[derive(Clone, Debug)]
pub struct ExecutionScope {
    pub job_id: JobId,
    pub cycle_number: Option<u32>,
    pub task_id: Option<TaskId>,
    pub context: Option<String>,
}

impl ExecutionScope {
    pub fn for_job(job_id: &JobId) -> Self {
        Self {
            job_id: job_id.clone(),
            cycle_number: None,
            task_id: None,
            context: None,
        }
    }

    pub fn for_cycle(job_id: &JobId, cycle_number: u32) -> Self {
        Self {
            cycle_number: Some(cycle_number),
            ..Self::for_job(job_id)
        }
    }

    pub fn for_task(job_id: &JobId, cycle_number: u32, task_id: &TaskId, context: Option<String>) -> Self {
        Self {
            job_id: job_id.clone(),
            cycle_number: Some(cycle_number),
            task_id: Some(task_id.clone()),
            context,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    Error,
}

/// Structured result of one session call. Ordinary task failure is data,
/// not an Err — the call only errors on contract violations (e.g. the
/// store refusing a terminal-status write).
#[derive(Clone, Debug)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub status: OutcomeStatus,
    pub summary: Option<String>,
    pub branch: Option<String>,
    pub error: Option<String>,
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    fn completed(session_id: SessionId, summary: String, branch: Option<String>) -> Self {
        Self {
            session_id,
            status: OutcomeStatus::Completed,
            summary: Some(summary),
            branch,
            error: None,
        }
    }

    fn failed(session_id: SessionId, error: String) -> Self {
        Self {
            session_id,
            status: OutcomeStatus::Error,
            summary: None,
            branch: None,
            error: Some(error),
        }
    }
}

/// Runs one prompt end-to-end against one worker: acquire, dispatch,
/// consume the event stream, release or fail the slot, report the outcome.
/// All transport detail stays behind this type.
pub struct SessionExecutor {
    coordinator: Arc<dyn WorkerCoordinator>,
    transport: Arc<dyn ExecutionTransport>,
    tasks: TaskRepo,
    broadcaster: Arc<Broadcaster>,
    call_timeout: Duration,
}

impl SessionExecutor {
    pub fn new(
        coordinator: Arc<dyn WorkerCoordinator>,
        transport: Arc<dyn ExecutionTransport>,
        db: Database,
        broadcaster: Arc<Broadcaster>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            transport,
            tasks: TaskRepo::new(db),
            broadcaster,
            call_timeout,
        }
    }

    /// Execute one prompt. Every path settles: worker slots are always
    /// released or marked failed, and a task-bound scope always ends with a
    /// terminal status on its row.
    #[instrument(skip(self, scope, prompt), fields(job_id = %scope.job_id))]
    pub async fn run(&self, scope: &ExecutionScope, prompt: &str) -> Result<SessionOutcome, EngineError> {
        let session_id = SessionId::new();

        if let Some(task_id) = &scope.task_id {
            self.tasks.bind_session(task_id, &session_id)?;
        }

        let options = AcquireOptions {
            retry_attempts: ACQUIRE_RETRY_ATTEMPTS,
            retry_delay: ACQUIRE_RETRY_DELAY,
            on_attempt: None,
        };

        let assignment = match self.coordinator.acquire(&session_id, &options).await {
            Ok(Some(assignment)) => assignment,
            Ok(None) => {
                return self
                    .settle(scope, SessionOutcome::failed(session_id, DispatchError::NoWorkersAvailable.to_string()))
                    .await;
            }
            Err(e) => {
                return self
                    .settle(scope, SessionOutcome::failed(session_id, e.to_string()))
                    .await;
            }
        };

        let request = WorkRequest {
            session_id: session_id.clone(),
            prompt: prompt.to_string(),
            context: scope.context.clone(),
        };

        let result = tokio::time::timeout(self.call_timeout, self.dispatch(&assignment, &request, scope)).await;
        let result = match result {
            Ok(inner) => inner,
            Err(_) => Err(TaskFailure::Dispatch(DispatchError::Timeout(self.call_timeout))),
        };

        let outcome = match result {
            Ok((summary, branch)) => {
                self.coordinator.release(&assignment.worker_id, &session_id).await;
                SessionOutcome::completed(session_id, summary, branch)
            }
            Err(TaskFailure::Reported(message)) => {
                // A worker-reported failure completed the protocol cleanly;
                // the slot goes back without a strike.
                self.coordinator.release(&assignment.worker_id, &session_id).await;
                SessionOutcome::failed(session_id, message)
            }
            Err(TaskFailure::Dispatch(e)) => {
                self.coordinator
                    .mark_failed(&assignment.worker_id, &session_id, &e.to_string())
                    .await;
                SessionOutcome::failed(session_id, e.to_string())
            }
        };

        self.settle(scope, outcome).await
    }

    /// Consume the work stream until a terminal event. `Ok` carries the
    /// completion summary; a worker-reported failure is `TaskFailure::Reported`
    /// and anything else is a transport-level dispatch error.
    async fn dispatch(
        &self,
        assignment: &WorkerAssignment,
        request: &WorkRequest,
        scope: &ExecutionScope,
    ) -> Result<(String, Option<String>), TaskFailure> {
        let mut stream: WorkStream = self.transport.execute(assignment, request).await?;

        while let Some(event) = stream.next().await {
            match event? {
                WorkEvent::Progress { message } => {
                    self.broadcaster.broadcast_task_progress(
                        &scope.job_id,
                        scope.cycle_number,
                        scope.task_id.as_ref(),
                        &message,
                    );
                }
                WorkEvent::AgentMessage { text } => {
                    self.broadcaster.broadcast_agent_message(
                        &scope.job_id,
                        scope.cycle_number,
                        scope.task_id.as_ref(),
                        &text,
                    );
                }
                WorkEvent::Completed { summary, branch } => {
                    return Ok((summary, branch));
                }
                WorkEvent::Failed { message } => {
                    return Err(TaskFailure::Reported(message));
                }
            }
        }

        Err(TaskFailure::Dispatch(DispatchError::StreamEnded))
    }

    /// Persist the terminal status for a task-bound scope and hand the
    /// outcome back.
    async fn settle(
        &self,
        scope: &ExecutionScope,
        outcome: SessionOutcome,
    ) -> Result<SessionOutcome, EngineError> {
        if let Some(task_id) = &scope.task_id {
            match &outcome.status {
                OutcomeStatus::Completed => {
                    let summary = outcome.summary.as_deref().unwrap_or("completed");
                    self.tasks.mark_completed(task_id, summary)?;
                }
                OutcomeStatus::Error => {
                    let message = outcome.error.as_deref().unwrap_or("unknown error");
                    self.tasks.mark_failed(task_id, message)?;
                }
            }
            debug!(task_id = %task_id, status = ?outcome.status, "task settled");
        } else if outcome.status == OutcomeStatus::Error {
            warn!(job_id = %scope.job_id, error = ?outcome.error, "phase session failed");
        }
        Ok(outcome)
    }
}

/// Distinguishes a failure the worker reported through the protocol from a
/// failure of the transport itself — only the latter penalizes the worker.
enum TaskFailure {
    Reported(String),
    Dispatch(DispatchError),
}

impl From<DispatchError> for TaskFailure {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}
