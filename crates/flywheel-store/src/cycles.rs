use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use flywheel_core::ids::{CycleId, JobId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Discovery,
    Execution,
    Convergence,
    Update,
    Completed,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovery => write!(f, "discovery"),
            Self::Execution => write!(f, "execution"),
            Self::Convergence => write!(f, "convergence"),
            Self::Update => write!(f, "update"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for CyclePhase {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Self::Discovery),
            "execution" => Ok(Self::Execution),
            "convergence" => Ok(Self::Convergence),
            "update" => Ok(Self::Update),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown cycle phase: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleRow {
    pub id: CycleId,
    pub job_id: JobId,
    pub cycle_number: u32,
    pub phase: CyclePhase,
    pub tasks_discovered: u32,
    pub tasks_launched: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub summary: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

pub struct CycleRepo {
    db: Database,
}

const CYCLE_COLUMNS: &str = "id, job_id, cycle_number, phase, tasks_discovered, tasks_launched, \
     tasks_completed, tasks_failed, summary, completed_at, created_at";

impl CycleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new cycle in phase `discovery`. cycle_number is unique per
    /// job; a duplicate insert is a Conflict.
    #[instrument(skip(self), fields(job_id = %job_id, cycle_number))]
    pub fn create(&self, job_id: &JobId, cycle_number: u32) -> Result<CycleRow, StoreError> {
        let id = CycleId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cycles (id, job_id, cycle_number, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), job_id.as_str(), cycle_number, now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("cycle {cycle_number} for job {job_id}"))
                }
                other => StoreError::Database(other.to_string()),
            })?;

            Ok(CycleRow {
                id,
                job_id: job_id.clone(),
                cycle_number,
                phase: CyclePhase::Discovery,
                tasks_discovered: 0,
                tasks_launched: 0,
                tasks_completed: 0,
                tasks_failed: 0,
                summary: None,
                completed_at: None,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(cycle_id = %id))]
    pub fn get(&self, id: &CycleId) -> Result<CycleRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {CYCLE_COLUMNS} FROM cycles WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_cycle(row),
                None => Err(StoreError::NotFound(format!("cycle {id}"))),
            }
        })
    }

    /// Look up a cycle by job and cycle number. Used on resume, where an
    /// interrupted cycle row may already exist for the current number.
    #[instrument(skip(self), fields(job_id = %job_id, cycle_number))]
    pub fn get_by_number(
        &self,
        job_id: &JobId,
        cycle_number: u32,
    ) -> Result<Option<CycleRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CYCLE_COLUMNS} FROM cycles WHERE job_id = ?1 AND cycle_number = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![job_id.as_str(), cycle_number])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_cycle(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Cycles of a job, oldest first.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn list_for_job(&self, job_id: &JobId) -> Result<Vec<CycleRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CYCLE_COLUMNS} FROM cycles WHERE job_id = ?1 ORDER BY cycle_number ASC"
            ))?;
            let mut rows = stmt.query([job_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_cycle(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(cycle_id = %id, phase = %phase))]
    pub fn set_phase(&self, id: &CycleId, phase: CyclePhase) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cycles SET phase = ?1 WHERE id = ?2",
                rusqlite::params![phase.to_string(), id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(cycle_id = %id))]
    pub fn set_counts(
        &self,
        id: &CycleId,
        discovered: u32,
        launched: u32,
        completed: u32,
        failed: u32,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cycles SET tasks_discovered = ?1, tasks_launched = ?2,
                                   tasks_completed = ?3, tasks_failed = ?4
                 WHERE id = ?5",
                rusqlite::params![discovered, launched, completed, failed, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, summary), fields(cycle_id = %id))]
    pub fn set_summary(&self, id: &CycleId, summary: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cycles SET summary = ?1 WHERE id = ?2",
                rusqlite::params![summary, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Mark the cycle completed. The row is immutable afterwards by
    /// convention; nothing in the engine writes to a completed cycle.
    #[instrument(skip(self), fields(cycle_id = %id))]
    pub fn complete(&self, id: &CycleId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE cycles SET phase = 'completed', completed_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_cycle(row: &rusqlite::Row<'_>) -> Result<CycleRow, StoreError> {
    let phase_str: String = row_helpers::get(row, 3, "cycles", "phase")?;

    Ok(CycleRow {
        id: CycleId::from_raw(row_helpers::get::<String>(row, 0, "cycles", "id")?),
        job_id: JobId::from_raw(row_helpers::get::<String>(row, 1, "cycles", "job_id")?),
        cycle_number: row_helpers::get(row, 2, "cycles", "cycle_number")?,
        phase: row_helpers::parse_enum(&phase_str, "cycles", "phase")?,
        tasks_discovered: row_helpers::get(row, 4, "cycles", "tasks_discovered")?,
        tasks_launched: row_helpers::get(row, 5, "cycles", "tasks_launched")?,
        tasks_completed: row_helpers::get(row, 6, "cycles", "tasks_completed")?,
        tasks_failed: row_helpers::get(row, 7, "cycles", "tasks_failed")?,
        summary: row_helpers::get_opt(row, 8, "cycles", "summary")?,
        completed_at: row_helpers::get_opt(row, 9, "cycles", "completed_at")?,
        created_at: row_helpers::get(row, 10, "cycles", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{tests::sample_job, JobRepo};

    fn setup() -> (Database, JobId) {
        let db = Database::in_memory().unwrap();
        let job_repo = JobRepo::new(db.clone());
        let job = job_repo.create(&sample_job()).unwrap();
        (db, job.id)
    }

    #[test]
    fn create_cycle_starts_in_discovery() {
        let (db, job_id) = setup();
        let repo = CycleRepo::new(db);
        let cycle = repo.create(&job_id, 1).unwrap();
        assert!(cycle.id.as_str().starts_with("cyc_"));
        assert_eq!(cycle.phase, CyclePhase::Discovery);
        assert_eq!(cycle.tasks_discovered, 0);
        assert!(cycle.completed_at.is_none());
    }

    #[test]
    fn duplicate_cycle_number_conflicts() {
        let (db, job_id) = setup();
        let repo = CycleRepo::new(db);
        repo.create(&job_id, 1).unwrap();
        let result = repo.create(&job_id, 1);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn list_for_job_ordered() {
        let (db, job_id) = setup();
        let repo = CycleRepo::new(db);
        repo.create(&job_id, 1).unwrap();
        repo.create(&job_id, 2).unwrap();
        repo.create(&job_id, 3).unwrap();

        let cycles = repo.list_for_job(&job_id).unwrap();
        let numbers: Vec<u32> = cycles.iter().map(|c| c.cycle_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn phase_progression() {
        let (db, job_id) = setup();
        let repo = CycleRepo::new(db);
        let cycle = repo.create(&job_id, 1).unwrap();

        for phase in [CyclePhase::Execution, CyclePhase::Convergence, CyclePhase::Update] {
            repo.set_phase(&cycle.id, phase).unwrap();
            assert_eq!(repo.get(&cycle.id).unwrap().phase, phase);
        }

        repo.complete(&cycle.id).unwrap();
        let done = repo.get(&cycle.id).unwrap();
        assert_eq!(done.phase, CyclePhase::Completed);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn counts_and_summary() {
        let (db, job_id) = setup();
        let repo = CycleRepo::new(db);
        let cycle = repo.create(&job_id, 1).unwrap();

        repo.set_counts(&cycle.id, 4, 4, 3, 1).unwrap();
        repo.set_summary(&cycle.id, "3 of 4 tasks landed").unwrap();

        let fetched = repo.get(&cycle.id).unwrap();
        assert_eq!(fetched.tasks_discovered, 4);
        assert_eq!(fetched.tasks_launched, 4);
        assert_eq!(fetched.tasks_completed, 3);
        assert_eq!(fetched.tasks_failed, 1);
        assert_eq!(fetched.summary.as_deref(), Some("3 of 4 tasks landed"));
    }

    #[test]
    fn get_nonexistent_fails() {
        let (db, _) = setup();
        let repo = CycleRepo::new(db);
        assert!(repo.get(&CycleId::from_raw("cyc_missing")).is_err());
    }

    #[test]
    fn get_by_number() {
        let (db, job_id) = setup();
        let repo = CycleRepo::new(db);
        let cycle = repo.create(&job_id, 1).unwrap();

        let found = repo.get_by_number(&job_id, 1).unwrap().unwrap();
        assert_eq!(found.id, cycle.id);
        assert!(repo.get_by_number(&job_id, 2).unwrap().is_none());
    }
}
