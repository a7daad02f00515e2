use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;
use crate::ids::{SessionId, WorkerId};

/// A short-lived binding of one worker instance to one session.
/// Ownership is exclusive to the executor call that acquired it until the
/// coordinator sees a release or mark_failed for the pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker_id: WorkerId,
    pub session_id: SessionId,
    pub url: String,
}

/// Payload dispatched to a worker for one session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkRequest {
    pub session_id: SessionId,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Events yielded by a worker's execution stream, one JSON object per line
/// on the wire. `Completed` and `Failed` are terminal; a stream that ends
/// without either is a `DispatchError::StreamEnded`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkEvent {
    Progress { message: String },
    AgentMessage { text: String },
    Completed {
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    Failed { message: String },
}

impl WorkEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Invoked once per acquire retry attempt (1-based).
pub type AttemptCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Options for worker acquisition.
#[derive(Clone, Default)]
pub struct AcquireOptions {
    /// Extra polling attempts after the first before giving up.
    pub retry_attempts: u32,
    /// Delay between polling attempts.
    pub retry_delay: std::time::Duration,
    /// Progress callback, invoked on each attempt.
    pub on_attempt: Option<AttemptCallback>,
}

pub type WorkStream = Pin<Box<dyn Stream<Item = Result<WorkEvent, DispatchError>> + Send>>;

/// Lends execution slots against a shared concurrency limit. The coordinator,
/// not the orchestration engine, enforces the system-wide ceiling.
#[async_trait]
pub trait WorkerCoordinator: Send + Sync {
    /// Acquire a worker slot for a session. `Ok(None)` means the pool is
    /// saturated and stayed so through the configured attempts.
    async fn acquire(
        &self,
        session_id: &SessionId,
        options: &AcquireOptions,
    ) -> Result<Option<WorkerAssignment>, DispatchError>;

    /// Return a slot after a clean run.
    async fn release(&self, worker_id: &WorkerId, session_id: &SessionId);

    /// Return a slot after a transport failure so the coordinator can evict
    /// or penalize the worker.
    async fn mark_failed(&self, worker_id: &WorkerId, session_id: &SessionId, reason: &str);
}

/// Opens a streamed execution against an assigned worker.
#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    async fn execute(
        &self,
        assignment: &WorkerAssignment,
        request: &WorkRequest,
    ) -> Result<WorkStream, DispatchError>;
}
