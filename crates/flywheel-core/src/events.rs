use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{JobId, TaskId};

/// Live progress events fanned out to observers of a job.
/// Ephemeral by design: these are never persisted, and a subscriber that
/// connects after an event was emitted will not see it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    JobPaused,
    JobResumed,
    JobCompleted,
    JobError,
    CycleStarted,
    CyclePhase,
    CycleTasksDiscovered,
    CycleCompleted,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    AgentMessage,
    JobEnded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobStarted => "job_started",
            Self::JobPaused => "job_paused",
            Self::JobResumed => "job_resumed",
            Self::JobCompleted => "job_completed",
            Self::JobError => "job_error",
            Self::CycleStarted => "cycle_started",
            Self::CyclePhase => "cycle_phase",
            Self::CycleTasksDiscovered => "cycle_tasks_discovered",
            Self::CycleCompleted => "cycle_completed",
            Self::TaskStarted => "task_started",
            Self::TaskProgress => "task_progress",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::AgentMessage => "agent_message",
            Self::JobEnded => "job_ended",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broadcast envelope. The payload is opaque to the hub; the timestamp
/// is assigned when the event is built, i.e. at emission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub payload: Value,
    pub timestamp: String,
}

impl BroadcastEvent {
    pub fn new(kind: EventKind, job_id: JobId, payload: Value) -> Self {
        Self {
            kind,
            job_id,
            cycle: None,
            task_id: None,
            payload,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_cycle(mut self, cycle: u32) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }
}
