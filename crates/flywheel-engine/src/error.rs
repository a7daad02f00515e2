use flywheel_core::ids::JobId;
use flywheel_store::jobs::JobStatus;
use flywheel_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad job configuration, rejected before any state is created.
    #[error("invalid job config: {0}")]
    Validation(String),

    /// An in-process loop already exists for this job.
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),

    /// No in-process loop exists for this job.
    #[error("job {0} is not running")]
    NotRunning(JobId),

    /// The job is not in a status that allows the requested transition.
    #[error("job {job} cannot transition from status {status}")]
    InvalidState { job: JobId, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Control errors are caller mistakes; nothing was mutated.
    pub fn is_control_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning(_) | Self::NotRunning(_) | Self::InvalidState { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_error_classification() {
        assert!(EngineError::AlreadyRunning(JobId::new()).is_control_error());
        assert!(EngineError::NotRunning(JobId::new()).is_control_error());
        assert!(EngineError::InvalidState { job: JobId::new(), status: JobStatus::Completed }
            .is_control_error());
        assert!(!EngineError::Validation("missing repo".into()).is_control_error());
        assert!(!EngineError::Internal("bug".into()).is_control_error());
    }

    #[test]
    fn display_includes_job_id() {
        let id = JobId::from_raw("job_test123");
        let err = EngineError::AlreadyRunning(id);
        assert!(err.to_string().contains("job_test123"));
    }
}
