use std::time::Duration;

/// Typed errors for worker acquisition and task dispatch.
/// A dispatch error is always scoped to a single session; it is folded into
/// task/cycle bookkeeping by the caller and never aborts the owning job.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no worker available")]
    NoWorkersAvailable,

    #[error("worker unreachable: {0}")]
    WorkerUnreachable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker returned status {status}: {body}")]
    WorkerStatus { status: u16, body: String },

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("stream ended unexpectedly")]
    StreamEnded,

    #[error("cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Whether the same call could plausibly succeed against another worker.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoWorkersAvailable
                | Self::WorkerUnreachable(_)
                | Self::WorkerStatus { status: 500..=599, .. }
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoWorkersAvailable => "no_workers_available",
            Self::WorkerUnreachable(_) => "worker_unreachable",
            Self::Protocol(_) => "protocol",
            Self::WorkerStatus { .. } => "worker_status",
            Self::Timeout(_) => "timeout",
            Self::StreamEnded => "stream_ended",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(DispatchError::NoWorkersAvailable.is_retryable());
        assert!(DispatchError::WorkerUnreachable("tcp".into()).is_retryable());
        assert!(DispatchError::WorkerStatus { status: 503, body: "busy".into() }.is_retryable());
    }

    #[test]
    fn non_retryable_classification() {
        assert!(!DispatchError::Protocol("bad json".into()).is_retryable());
        assert!(!DispatchError::WorkerStatus { status: 400, body: "bad".into() }.is_retryable());
        assert!(!DispatchError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!DispatchError::StreamEnded.is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(DispatchError::StreamEnded.error_kind(), "stream_ended");
        assert_eq!(DispatchError::NoWorkersAvailable.error_kind(), "no_workers_available");
        assert_eq!(
            DispatchError::Timeout(Duration::from_secs(1)).error_kind(),
            "timeout"
        );
    }

    #[test]
    fn display_messages() {
        assert_eq!(DispatchError::StreamEnded.to_string(), "stream ended unexpectedly");
        assert_eq!(DispatchError::NoWorkersAvailable.to_string(), "no worker available");
    }
}
