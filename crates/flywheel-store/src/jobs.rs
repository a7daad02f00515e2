use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use flywheel_core::ids::JobId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Error,
}

impl JobStatus {
    /// Terminal jobs cannot be restarted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRow {
    pub id: JobId,
    pub user_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub base_branch: String,
    pub working_branch: String,
    pub request_doc: String,
    pub task_list: String,
    pub status: JobStatus,
    pub current_cycle: u32,
    pub max_cycles: Option<u32>,
    pub time_limit_minutes: Option<u32>,
    pub max_parallel_tasks: u32,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameters for inserting a new job. The id is minted by the caller so
/// derived values (the default working branch) can reference it. Validation
/// happens in the engine.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub id: JobId,
    pub user_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub base_branch: String,
    pub working_branch: String,
    pub request_doc: String,
    pub max_cycles: Option<u32>,
    pub time_limit_minutes: Option<u32>,
    pub max_parallel_tasks: u32,
}

pub struct JobRepo {
    db: Database,
}

const JOB_COLUMNS: &str = "id, user_id, repo_owner, repo_name, base_branch, working_branch, \
     request_doc, task_list, status, current_cycle, max_cycles, time_limit_minutes, \
     max_parallel_tasks, last_error, error_count, started_at, completed_at, created_at, updated_at";

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new job in status `pending`, cycle 0.
    #[instrument(skip(self, new), fields(user_id = %new.user_id, repo = %new.repo_name))]
    pub fn create(&self, new: &NewJob) -> Result<JobRow, StoreError> {
        let id = new.id.clone();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, user_id, repo_owner, repo_name, base_branch, working_branch,
                                   request_doc, status, max_cycles, time_limit_minutes,
                                   max_parallel_tasks, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    id.as_str(),
                    new.user_id,
                    new.repo_owner,
                    new.repo_name,
                    new.base_branch,
                    new.working_branch,
                    new.request_doc,
                    new.max_cycles,
                    new.time_limit_minutes,
                    new.max_parallel_tasks,
                    now,
                    now,
                ],
            )?;

            Ok(JobRow {
                id,
                user_id: new.user_id.clone(),
                repo_owner: new.repo_owner.clone(),
                repo_name: new.repo_name.clone(),
                base_branch: new.base_branch.clone(),
                working_branch: new.working_branch.clone(),
                request_doc: new.request_doc.clone(),
                task_list: String::new(),
                status: JobStatus::Pending,
                current_cycle: 0,
                max_cycles: new.max_cycles,
                time_limit_minutes: new.time_limit_minutes,
                max_parallel_tasks: new.max_parallel_tasks,
                last_error: None,
                error_count: 0,
                started_at: None,
                completed_at: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a job by ID.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn get(&self, id: &JobId) -> Result<JobRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_job(row),
                None => Err(StoreError::NotFound(format!("job {id}"))),
            }
        })
    }

    /// List jobs, newest first, optionally scoped to one user.
    #[instrument(skip(self))]
    pub fn list(&self, user_id: Option<&str>) -> Result<Vec<JobRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params): (String, Vec<String>) = match user_id {
                Some(u) => (
                    format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1 ORDER BY created_at DESC"
                    ),
                    vec![u.to_string()],
                ),
                None => (
                    format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"),
                    Vec::new(),
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_job(row)?);
            }
            Ok(results)
        })
    }

    /// Update job status.
    #[instrument(skip(self), fields(job_id = %id, status = %status))]
    pub fn update_status(&self, id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Transition to running. started_at is written only the first time so
    /// time-limit accounting survives pause/resume.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn mark_started(&self, id: &JobId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET status = 'running',
                                 started_at = COALESCE(started_at, ?1),
                                 updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(job_id = %id, cycle))]
    pub fn set_current_cycle(&self, id: &JobId, cycle: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET current_cycle = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![cycle, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, task_list), fields(job_id = %id))]
    pub fn set_task_list(&self, id: &JobId, task_list: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET task_list = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![task_list, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Record a job-fatal error: status error, last_error, error_count + 1.
    #[instrument(skip(self, message), fields(job_id = %id))]
    pub fn record_error(&self, id: &JobId, message: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET status = 'error', last_error = ?1,
                                 error_count = error_count + 1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![message, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Mark the job completed with a completion timestamp.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn complete(&self, id: &JobId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET status = 'completed', completed_at = ?1, updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<JobRow, StoreError> {
    let status_str: String = row_helpers::get(row, 8, "jobs", "status")?;

    Ok(JobRow {
        id: JobId::from_raw(row_helpers::get::<String>(row, 0, "jobs", "id")?),
        user_id: row_helpers::get(row, 1, "jobs", "user_id")?,
        repo_owner: row_helpers::get(row, 2, "jobs", "repo_owner")?,
        repo_name: row_helpers::get(row, 3, "jobs", "repo_name")?,
        base_branch: row_helpers::get(row, 4, "jobs", "base_branch")?,
        working_branch: row_helpers::get(row, 5, "jobs", "working_branch")?,
        request_doc: row_helpers::get(row, 6, "jobs", "request_doc")?,
        task_list: row_helpers::get(row, 7, "jobs", "task_list")?,
        status: row_helpers::parse_enum(&status_str, "jobs", "status")?,
        current_cycle: row_helpers::get(row, 9, "jobs", "current_cycle")?,
        max_cycles: row_helpers::get_opt(row, 10, "jobs", "max_cycles")?,
        time_limit_minutes: row_helpers::get_opt(row, 11, "jobs", "time_limit_minutes")?,
        max_parallel_tasks: row_helpers::get(row, 12, "jobs", "max_parallel_tasks")?,
        last_error: row_helpers::get_opt(row, 13, "jobs", "last_error")?,
        error_count: row_helpers::get(row, 14, "jobs", "error_count")?,
        started_at: row_helpers::get_opt(row, 15, "jobs", "started_at")?,
        completed_at: row_helpers::get_opt(row, 16, "jobs", "completed_at")?,
        created_at: row_helpers::get(row, 17, "jobs", "created_at")?,
        updated_at: row_helpers::get(row, 18, "jobs", "updated_at")?,
    })
}
