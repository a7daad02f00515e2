use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use flywheel_core::ids::{CycleId, JobId, SessionId, TaskId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub cycle_id: CycleId,
    pub job_id: JobId,
    pub task_number: u32,
    pub description: String,
    pub context: Option<String>,
    pub priority: i32,
    pub can_run_parallel: bool,
    pub status: TaskStatus,
    pub session_id: Option<SessionId>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

/// Parameters for one discovered task.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub description: String,
    pub context: Option<String>,
    pub priority: i32,
    pub can_run_parallel: bool,
}

pub struct TaskRepo {
    db: Database,
}

const TASK_COLUMNS: &str = "id, cycle_id, job_id, task_number, description, context, priority, \
     can_run_parallel, status, session_id, result_summary, error_message, retry_count, \
     started_at, completed_at, created_at";

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert one pending task. task_number is 1-based within the cycle.
    #[instrument(skip(self, new), fields(cycle_id = %cycle_id, task_number))]
    pub fn create(
        &self,
        cycle_id: &CycleId,
        job_id: &JobId,
        task_number: u32,
        new: &NewTask,
    ) -> Result<TaskRow, StoreError> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, cycle_id, job_id, task_number, description, context,
                                    priority, can_run_parallel, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    cycle_id.as_str(),
                    job_id.as_str(),
                    task_number,
                    new.description,
                    new.context,
                    new.priority,
                    new.can_run_parallel,
                    now,
                ],
            )?;

            Ok(TaskRow {
                id,
                cycle_id: cycle_id.clone(),
                job_id: job_id.clone(),
                task_number,
                description: new.description.clone(),
                context: new.context.clone(),
                priority: new.priority,
                can_run_parallel: new.can_run_parallel,
                status: TaskStatus::Pending,
                session_id: None,
                result_summary: None,
                error_message: None,
                retry_count: 0,
                started_at: None,
                completed_at: None,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    pub fn get(&self, id: &TaskId) -> Result<TaskRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("task {id}"))),
            }
        })
    }

    /// Tasks of a cycle in task_number order.
    #[instrument(skip(self), fields(cycle_id = %cycle_id))]
    pub fn list_for_cycle(&self, cycle_id: &CycleId) -> Result<Vec<TaskRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE cycle_id = ?1 ORDER BY task_number ASC"
            ))?;
            let mut rows = stmt.query([cycle_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }

    /// Bind the execution session once the task is dispatched. Assigned once.
    #[instrument(skip(self), fields(task_id = %id, session_id = %session_id))]
    pub fn bind_session(&self, id: &TaskId, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET session_id = ?1 WHERE id = ?2 AND session_id IS NULL",
                rusqlite::params![session_id.as_str(), id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    pub fn mark_running(&self, id: &TaskId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, summary), fields(task_id = %id))]
    pub fn mark_completed(&self, id: &TaskId, summary: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE tasks SET status = 'completed', result_summary = ?1, completed_at = ?2
                 WHERE id = ?3",
                rusqlite::params![summary, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, message), fields(task_id = %id))]
    pub fn mark_failed(&self, id: &TaskId, message: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE tasks SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE id = ?3",
                rusqlite::params![message, now, id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<TaskRow, StoreError> {
    let status_str: String = row_helpers::get(row, 8, "tasks", "status")?;

    Ok(TaskRow {
        id: TaskId::from_raw(row_helpers::get::<String>(row, 0, "tasks", "id")?),
        cycle_id: CycleId::from_raw(row_helpers::get::<String>(row, 1, "tasks", "cycle_id")?),
        job_id: JobId::from_raw(row_helpers::get::<String>(row, 2, "tasks", "job_id")?),
        task_number: row_helpers::get(row, 3, "tasks", "task_number")?,
        description: row_helpers::get(row, 4, "tasks", "description")?,
        context: row_helpers::get_opt(row, 5, "tasks", "context")?,
        priority: row_helpers::get(row, 6, "tasks", "priority")?,
        can_run_parallel: row_helpers::get(row, 7, "tasks", "can_run_parallel")?,
        status: row_helpers::parse_enum(&status_str, "tasks", "status")?,
        session_id: row_helpers::get_opt::<String>(row, 9, "tasks", "session_id")?
            .map(SessionId::from_raw),
        result_summary: row_helpers::get_opt(row, 10, "tasks", "result_summary")?,
        error_message: row_helpers::get_opt(row, 11, "tasks", "error_message")?,
        retry_count: row_helpers::get(row, 12, "tasks", "retry_count")?,
        started_at: row_helpers::get_opt(row, 13, "tasks", "started_at")?,
        completed_at: row_helpers::get_opt(row, 14, "tasks", "completed_at")?,
        created_at: row_helpers::get(row, 15, "tasks", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::CycleRepo;
    use crate::jobs::{tests::sample_job, JobRepo};

    fn setup() -> (Database, JobId, CycleId) {
        let db = Database::in_memory().unwrap();
        let job = JobRepo::new(db.clone()).create(&sample_job()).unwrap();
        let cycle = CycleRepo::new(db.clone()).create(&job.id, 1).unwrap();
        (db, job.id, cycle.id)
    }

    fn sample_task() -> NewTask {
        NewTask {
            description: "add error handling to parser".into(),
            context: Some("src/parser.rs".into()),
            priority: 1,
            can_run_parallel: true,
        }
    }

    #[test]
    fn create_task_pending() {
        let (db, job_id, cycle_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&cycle_id, &job_id, 1, &sample_task()).unwrap();
        assert!(task.id.as_str().starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.session_id.is_none());
    }

    #[test]
    fn lifecycle_to_completed() {
        let (db, job_id, cycle_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&cycle_id, &job_id, 1, &sample_task()).unwrap();

        repo.mark_running(&task.id).unwrap();
        let running = repo.get(&task.id).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        repo.mark_completed(&task.id, "parser hardened").unwrap();
        let done = repo.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result_summary.as_deref(), Some("parser hardened"));
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn lifecycle_to_failed() {
        let (db, job_id, cycle_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&cycle_id, &job_id, 1, &sample_task()).unwrap();

        repo.mark_running(&task.id).unwrap();
        repo.mark_failed(&task.id, "no worker available").unwrap();

        let failed = repo.get(&task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("no worker available"));
    }

    #[test]
    fn bind_session_is_write_once() {
        let (db, job_id, cycle_id) = setup();
        let repo = TaskRepo::new(db);
        let task = repo.create(&cycle_id, &job_id, 1, &sample_task()).unwrap();

        let first = SessionId::new();
        let second = SessionId::new();
        repo.bind_session(&task.id, &first).unwrap();
        repo.bind_session(&task.id, &second).unwrap();

        let fetched = repo.get(&task.id).unwrap();
        assert_eq!(fetched.session_id.as_ref(), Some(&first));
    }

    #[test]
    fn list_for_cycle_ordered() {
        let (db, job_id, cycle_id) = setup();
        let repo = TaskRepo::new(db);
        for n in 1..=3 {
            repo.create(&cycle_id, &job_id, n, &sample_task()).unwrap();
        }
        let tasks = repo.list_for_cycle(&cycle_id).unwrap();
        let numbers: Vec<u32> = tasks.iter().map(|t| t.task_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
